use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use streamchat::api::ApiClient;
use streamchat::config::Config;
use streamchat::conversation::{ConversationId, Message};
use streamchat::session::{
    ControllerHandle, ImageAttachment, LinkState, Notice, SessionConfig, SessionController,
    Submission, WsTransport,
};
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
#[command(name = "streamchat")]
#[command(about = "streamchat CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: STREAMCHAT_CONFIG_PATH or ~/.streamchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat with a model over the streaming endpoint (interactive).
    Chat {
        /// Config file path (default: STREAMCHAT_CONFIG_PATH or ~/.streamchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Model to use (default: chat.defaultModel, else the first model the server lists).
        #[arg(long, short)]
        model: Option<String>,

        /// Existing conversation id to continue.
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,
    },

    /// List the models the server offers.
    Models {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// List stored conversations, newest first.
    Conversations {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Print the transcript of a stored conversation.
    History {
        id: String,
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Delete a stored conversation.
    Delete {
        id: String,
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("streamchat {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Chat {
            config,
            model,
            conversation,
        }) => run_chat(config, model, conversation).await,
        Some(Commands::Models { config }) => run_models(config).await,
        Some(Commands::Conversations { config }) => run_conversations(config).await,
        Some(Commands::History { id, config }) => run_history(config, id).await,
        Some(Commands::Delete { id, config }) => run_delete(config, id).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(streamchat::config::default_config_path);
    streamchat::config::init_config(&path)?;
    println!("initialized configuration at {}", path.display());
    Ok(())
}

fn api_client(config: &Config) -> anyhow::Result<ApiClient> {
    let url = streamchat::config::resolve_server_url(config);
    Ok(ApiClient::new(Some(url), config.session.request_timeout())?)
}

async fn run_models(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = streamchat::config::load_config(config_path)?;
    print_models(&api_client(&config)?).await
}

async fn print_models(api: &ApiClient) -> anyhow::Result<()> {
    let models = api.list_models().await?;
    if models.is_empty() {
        println!("no models available");
    }
    for model in models {
        match model.size {
            Some(size) => println!("{}  ({:.1} GB)", model.name, size as f64 / 1e9),
            None => println!("{}", model.name),
        }
    }
    Ok(())
}

async fn run_conversations(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = streamchat::config::load_config(config_path)?;
    let api = api_client(&config)?;
    for c in api.list_conversations().await? {
        println!("{}  {}  {}", c.id, c.timestamp.as_deref().unwrap_or("-"), c.title);
    }
    Ok(())
}

async fn run_history(config_path: Option<PathBuf>, id: String) -> anyhow::Result<()> {
    let (config, _) = streamchat::config::load_config(config_path)?;
    let api = api_client(&config)?;
    for message in api.history(&ConversationId::new(id)).await? {
        println!("{}: {}", message.role.as_str(), message.content);
    }
    Ok(())
}

async fn run_delete(config_path: Option<PathBuf>, id: String) -> anyhow::Result<()> {
    let (config, _) = streamchat::config::load_config(config_path)?;
    let api = api_client(&config)?;
    api.delete_conversation(&ConversationId::new(id.clone())).await?;
    println!("deleted {}", id);
    Ok(())
}

const HELP: &str = "\
commands:
  /help                 show this help
  /new                  start a new conversation
  /clear                delete this conversation on the server and start fresh
  /model [name]         show or switch the model
  /models               list available models
  /image <path> [text]  send an image with optional text
  /search <text>        send with web search enabled
  /open <id>            load a stored conversation
  /reconnect            reconnect after the connection was given up
  /quit, /exit          leave";

/// REPL state that lives next to the running controller.
struct Chat {
    api: Arc<ApiClient>,
    handle: ControllerHandle,
    ws_url: String,
    model: Option<String>,
    conversation: ConversationId,
    web_search: bool,
    /// True while a streamed reply is being printed on the current line.
    mid_reply: bool,
}

async fn run_chat(
    config_path: Option<PathBuf>,
    model: Option<String>,
    conversation: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = streamchat::config::load_config(config_path)?;
    let api = Arc::new(api_client(&config)?);
    let ws_url = streamchat::config::resolve_ws_url(&config);

    let model = match model.or_else(|| config.chat.default_model.clone()) {
        Some(m) => Some(m),
        None => match api.list_models().await {
            Ok(models) => models.into_iter().next().map(|m| m.name),
            Err(e) => {
                log::warn!("could not list models: {}", e);
                None
            }
        },
    };

    let conversation = conversation.map(ConversationId::new);
    let history = match &conversation {
        Some(id) => api.history(id).await.unwrap_or_else(|e| {
            log::warn!("could not load conversation {}: {}", id, e);
            Vec::new()
        }),
        None => Vec::new(),
    };
    let conversation = conversation.unwrap_or_else(ConversationId::generate);

    let (mut controller, handle, mut notices) = SessionController::new(
        config.session.policy(),
        WsTransport::new(),
        api.clone(),
        conversation.clone(),
    );
    if !history.is_empty() {
        println!("loaded {} messages", history.len());
        controller.reset_conversation(conversation.clone(), history);
    }
    let controller_task = tokio::spawn(controller.run());
    handle.select_model(model.as_ref().map(|m| SessionConfig::new(m.as_str(), ws_url.as_str())));

    let mut chat = Chat {
        api,
        handle,
        ws_url,
        model,
        conversation,
        web_search: config.chat.web_search,
        mid_reply: false,
    };
    match &chat.model {
        Some(m) => println!("conversation {} with {} (/help for commands)", chat.conversation, m),
        None => println!("no model available; pick one with /model <name>"),
    }
    log::info!("chat server {}, streaming via {}", chat.api.base_url(), chat.ws_url);
    prompt();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !chat.on_line(line.trim()).await {
                    break;
                }
            }
            notice = notices.recv() => match notice {
                Some(notice) => chat.on_notice(notice),
                None => break,
            },
        }
    }

    chat.handle.shutdown();
    let _ = controller_task.await;
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

impl Chat {
    /// Returns false when the user asked to leave.
    async fn on_line(&mut self, input: &str) -> bool {
        if input.is_empty() {
            prompt();
            return true;
        }
        let (command, rest) = match input.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (input, ""),
        };
        let submitted = match command {
            "/quit" | "/exit" => return false,
            "/help" => {
                println!("{}", HELP);
                false
            }
            "/new" => {
                let id = match self.api.create_conversation().await {
                    Ok(id) => id,
                    Err(e) => {
                        log::warn!("server did not create a conversation: {}", e);
                        ConversationId::generate()
                    }
                };
                self.switch_conversation(id, Vec::new());
                false
            }
            "/clear" => {
                if let Err(e) = self.api.delete_conversation(&self.conversation).await {
                    log::warn!("could not delete conversation {}: {}", self.conversation, e);
                }
                self.switch_conversation(ConversationId::generate(), Vec::new());
                false
            }
            "/open" if !rest.is_empty() => {
                let id = ConversationId::new(rest);
                match self.api.history(&id).await {
                    Ok(messages) => {
                        for m in &messages {
                            println!("{}: {}", m.role.as_str(), m.content);
                        }
                        self.switch_conversation(id, messages);
                    }
                    Err(e) => eprintln!("error: {}", e),
                }
                false
            }
            "/model" => {
                if rest.is_empty() {
                    println!("model: {}", self.model.as_deref().unwrap_or("(none)"));
                } else {
                    self.model = Some(rest.to_string());
                    self.handle
                        .select_model(Some(SessionConfig::new(rest, self.ws_url.as_str())));
                    println!("switched to {}", rest);
                }
                false
            }
            "/models" => {
                if let Err(e) = print_models(&self.api).await {
                    eprintln!("error: {:#}", e);
                }
                false
            }
            "/image" if !rest.is_empty() => {
                let (path, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                match ImageAttachment::from_path(std::path::Path::new(path)) {
                    Ok(image) => self.handle.submit(
                        Submission::text(text.trim())
                            .with_image(image)
                            .with_search(self.web_search),
                    ),
                    Err(e) => {
                        eprintln!("error: {:#}", e);
                        false
                    }
                }
            }
            "/search" if !rest.is_empty() => {
                self.handle.submit(Submission::text(rest).with_search(true))
            }
            "/reconnect" => {
                self.handle.reconnect();
                false
            }
            c if c.starts_with('/') => {
                eprintln!("unknown command {} (try /help)", c);
                false
            }
            _ => self
                .handle
                .submit(Submission::text(input).with_search(self.web_search)),
        };
        if !submitted {
            prompt();
        }
        true
    }

    fn switch_conversation(&mut self, id: ConversationId, messages: Vec<Message>) {
        println!("conversation {}", id);
        self.conversation = id.clone();
        self.handle.reset_conversation(id, messages);
    }

    fn end_reply_line(&mut self) {
        if std::mem::take(&mut self.mid_reply) {
            println!();
        }
    }

    fn on_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Delta(text) => {
                if !self.mid_reply {
                    print!("< ");
                    self.mid_reply = true;
                }
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            Notice::Finished(message) => {
                if self.mid_reply {
                    self.end_reply_line();
                } else {
                    println!("< {}", message.content);
                }
                prompt();
            }
            Notice::Status { phase, detail } => {
                self.end_reply_line();
                if detail.is_empty() {
                    println!("  [{}]", phase);
                } else {
                    println!("  [{}: {}]", phase, detail);
                }
            }
            Notice::Error(e) => {
                self.end_reply_line();
                eprintln!("error: {}", e);
                if !e.is_retryable() {
                    eprintln!("  sending again will not help; use /model or /reconnect first");
                }
                prompt();
            }
            Notice::Reconnecting { attempt, delay } => {
                eprintln!(
                    "connection lost, reconnecting in {}ms (attempt {})",
                    delay.as_millis(),
                    attempt
                );
            }
            Notice::Connection(state) => {
                log::info!("connection {:?}", state);
                if state == LinkState::Failed {
                    eprintln!("connection failed; use /reconnect to try again");
                }
            }
        }
    }
}
