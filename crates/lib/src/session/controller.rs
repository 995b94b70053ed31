//! Session lifecycle controller.
//!
//! A single task owns the controller and processes one input at a time: a transport event,
//! a timer or one-shot completion, or a UI command. Frames from one connection are therefore
//! applied in order and never interleave. Timers and one-shot calls carry the token of the
//! submission that started them; transport events carry their connection id. Anything that
//! no longer matches the current submission or connection is dropped.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::dispatch::{plan, Dispatch, Submission};
use super::supervisor::{CloseAction, LinkState, Supervisor};
use super::transport::{
    Connection, ConnectionId, Inbound, InboundSink, Transport, TransportEvent, NORMAL_CLOSURE,
};
use super::{SessionConfig, SessionPolicy};
use crate::api::{ApiError, OneShotBackend};
use crate::conversation::{Accumulator, Conversation, ConversationId, Message};
use crate::error::ChatError;
use crate::protocol::{decode_lines, ErrorOrigin, OneShotReply, StreamFrame, StreamRequest};

/// Notification for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connection(LinkState),
    Reconnecting { attempt: u32, delay: std::time::Duration },
    Status { phase: String, detail: String },
    /// Text appended to the streaming assistant message.
    Delta(String),
    /// Final assistant message of a turn.
    Finished(Message),
    Error(ChatError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    NoModel,
    Ready,
    Streaming,
}

enum Command {
    SelectModel(Option<SessionConfig>),
    Submit(Submission),
    Reconnect,
    ResetConversation {
        id: ConversationId,
        messages: Vec<Message>,
    },
    Shutdown,
}

/// Clonable sender of UI commands to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Select (or clear, with `None`) the model/endpoint the session targets.
    pub fn select_model(&self, config: Option<SessionConfig>) -> bool {
        self.send(Command::SelectModel(config))
    }

    /// Rejections (`Busy`, `NoModel`) come back as `Notice::Error`.
    pub fn submit(&self, submission: Submission) -> bool {
        self.send(Command::Submit(submission))
    }

    pub fn reconnect(&self) -> bool {
        self.send(Command::Reconnect)
    }

    /// Switch to another conversation (new chat, cleared chat, or loaded history).
    pub fn reset_conversation(&self, id: ConversationId, messages: Vec<Message>) -> bool {
        self.send(Command::ResetConversation { id, messages })
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }
}

enum Internal {
    Watchdog { token: u64 },
    OpenWait { token: u64 },
    Retry { epoch: u64 },
    OneShot {
        token: u64,
        result: Result<OneShotReply, ApiError>,
    },
}

enum Event {
    Inbound(Inbound),
    Internal(Internal),
    Command(Option<Command>),
}

/// The submission currently pending.
struct Turn {
    token: u64,
    phase: TurnPhase,
}

enum TurnPhase {
    /// Text submission waiting for the connection to open.
    AwaitingOpen {
        request: StreamRequest,
        timer: JoinHandle<()>,
    },
    Streaming {
        watchdog: JoinHandle<()>,
    },
    OneShot {
        submission: Submission,
        task: JoinHandle<()>,
    },
}

impl Turn {
    fn cancel(self) {
        match self.phase {
            TurnPhase::AwaitingOpen { timer, .. } => timer.abort(),
            TurnPhase::Streaming { watchdog } => watchdog.abort(),
            TurnPhase::OneShot { task, .. } => task.abort(),
        }
    }

    fn is_streaming(&self) -> bool {
        matches!(self.phase, TurnPhase::Streaming { .. })
    }
}

pub struct SessionController<T: Transport, B: OneShotBackend> {
    policy: SessionPolicy,
    transport: T,
    backend: Arc<B>,
    config: Option<SessionConfig>,
    connection: Option<Box<dyn Connection>>,
    next_connection: u64,
    supervisor: Supervisor,
    accumulator: Accumulator,
    turn: Option<Turn>,
    next_token: u64,
    retry: Option<(u64, JoinHandle<()>)>,
    retry_epoch: u64,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedSender<Notice>,
    shut_down: bool,
}

impl<T: Transport, B: OneShotBackend> SessionController<T, B> {
    pub fn new(
        policy: SessionPolicy,
        transport: T,
        backend: Arc<B>,
        conversation: ConversationId,
    ) -> (Self, ControllerHandle, mpsc::UnboundedReceiver<Notice>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let controller = Self {
            policy,
            transport,
            backend,
            config: None,
            connection: None,
            next_connection: 0,
            supervisor: Supervisor::new(policy.reconnect),
            accumulator: Accumulator::new(conversation),
            turn: None,
            next_token: 0,
            retry: None,
            retry_epoch: 0,
            inbound_tx,
            inbound_rx,
            internal_tx,
            internal_rx,
            commands_rx,
            notices,
            shut_down: false,
        };
        let handle = ControllerHandle {
            commands: commands_tx,
        };
        (controller, handle, notices_rx)
    }

    pub fn state(&self) -> ControllerState {
        if self.config.is_none() {
            ControllerState::NoModel
        } else if self.turn.is_some() {
            ControllerState::Streaming
        } else {
            ControllerState::Ready
        }
    }

    pub fn is_pending(&self) -> bool {
        self.turn.is_some()
    }

    pub fn link_state(&self) -> LinkState {
        self.supervisor.state()
    }

    pub fn conversation(&self) -> &Conversation {
        self.accumulator.conversation()
    }

    /// Process inputs until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        while self.step().await {}
        self.shutdown();
    }

    /// Wait for and process one input. Returns false once the controller has shut down.
    pub async fn step(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        let event = tokio::select! {
            biased;
            Some(inbound) = self.inbound_rx.recv() => Event::Inbound(inbound),
            Some(internal) = self.internal_rx.recv() => Event::Internal(internal),
            command = self.commands_rx.recv() => Event::Command(command),
        };
        self.handle(event)
    }

    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Inbound(inbound) => self.on_inbound(inbound),
            Event::Internal(internal) => self.on_internal(internal),
            Event::Command(Some(command)) => return self.on_command(command),
            Event::Command(None) => {
                log::debug!("controller: all handles dropped");
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::SelectModel(config) => self.select_model(config),
            Command::Submit(submission) => {
                if let Err(e) = self.submit(submission) {
                    self.notify(Notice::Error(e));
                }
            }
            Command::Reconnect => self.reconnect(),
            Command::ResetConversation { id, messages } => self.reset_conversation(id, messages),
            Command::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn notify_link(&self) {
        self.notify(Notice::Connection(self.supervisor.state()));
    }

    fn schedule(&self, delay: std::time::Duration, internal: Internal) -> JoinHandle<()> {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(internal);
        })
    }

    /// Change the session config. A different value closes the current session with the
    /// normal code and opens a new one; `None` leaves the controller without a model.
    pub fn select_model(&mut self, config: Option<SessionConfig>) {
        if self.config == config {
            return;
        }
        match &config {
            Some(c) => log::info!("controller: session config now {} @ {}", c.model, c.endpoint),
            None => log::info!("controller: model cleared"),
        }
        self.teardown_session();
        self.config = config;
        if self.config.is_some() && self.supervisor.request_open() {
            self.open_connection();
        }
    }

    /// Manual reconnect (e.g. after reconnection attempts were exhausted).
    pub fn reconnect(&mut self) {
        if self.config.is_none() {
            return;
        }
        self.cancel_retry();
        if self.supervisor.request_open() {
            self.open_connection();
        }
    }

    pub fn reset_conversation(&mut self, id: ConversationId, messages: Vec<Message>) {
        self.interrupt_turn();
        log::info!("controller: conversation {} ({} messages)", id, messages.len());
        self.accumulator.reset(id, messages);
    }

    /// Close with the normal code and cancel every timer. Idempotent.
    pub fn shutdown(&mut self) {
        if std::mem::replace(&mut self.shut_down, true) {
            return;
        }
        if let Some(turn) = self.turn.take() {
            turn.cancel();
        }
        self.cancel_retry();
        if let Some(mut conn) = self.connection.take() {
            conn.close(NORMAL_CLOSURE, "shutdown");
        }
        self.supervisor.close();
    }

    /// Accept a submission, or reject it with `Busy` / `NoModel`.
    pub fn submit(&mut self, submission: Submission) -> Result<(), ChatError> {
        if self.turn.is_some() {
            return Err(ChatError::Busy);
        }
        let Some(config) = self.config.clone() else {
            return Err(ChatError::NoModel);
        };
        if submission.is_empty() {
            log::debug!("controller: ignoring empty submission");
            return Ok(());
        }
        self.next_token += 1;
        let token = self.next_token;
        if submission.image.is_none() {
            self.accumulator.begin_user_turn(&submission.text, None);
        }
        match plan(&config, self.accumulator.conversation(), &submission) {
            Dispatch::Stream(request) => self.start_stream(token, request),
            Dispatch::OneShot(request) => {
                let backend = Arc::clone(&self.backend);
                let tx = self.internal_tx.clone();
                let task = tokio::spawn(async move {
                    let result = backend.chat(request).await;
                    let _ = tx.send(Internal::OneShot { token, result });
                });
                self.turn = Some(Turn {
                    token,
                    phase: TurnPhase::OneShot { submission, task },
                });
            }
        }
        Ok(())
    }

    fn start_stream(&mut self, token: u64, request: StreamRequest) {
        if self.try_send(&request) {
            self.start_watchdog(token);
            return;
        }
        // Not open: (re)open now rather than waiting out a backoff, then wait briefly.
        self.cancel_retry();
        if self.supervisor.request_open() {
            self.open_connection();
        }
        let timer = self.schedule(self.policy.open_wait, Internal::OpenWait { token });
        self.turn = Some(Turn {
            token,
            phase: TurnPhase::AwaitingOpen { request, timer },
        });
    }

    fn start_watchdog(&mut self, token: u64) {
        let watchdog = self.schedule(self.policy.watchdog, Internal::Watchdog { token });
        self.turn = Some(Turn {
            token,
            phase: TurnPhase::Streaming { watchdog },
        });
    }

    fn try_send(&self, request: &StreamRequest) -> bool {
        if !self.supervisor.is_open() {
            return false;
        }
        let Some(conn) = self.connection.as_ref() else {
            return false;
        };
        let payload = match serde_json::to_string(request) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("controller: encoding request failed: {}", e);
                return false;
            }
        };
        match conn.send(payload) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("controller: send on {} failed: {}", conn.id(), e);
                false
            }
        }
    }

    fn open_connection(&mut self) {
        let Some(config) = self.config.as_ref() else {
            return;
        };
        if let Some(mut old) = self.connection.take() {
            old.close(NORMAL_CLOSURE, "replaced");
        }
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        let sink = InboundSink::new(id, self.inbound_tx.clone());
        self.connection = Some(self.transport.open(config, sink));
        self.notify_link();
    }

    fn cancel_retry(&mut self) {
        if let Some((_, timer)) = self.retry.take() {
            timer.abort();
        }
    }

    /// Close the current session on purpose (model switch). Never triggers a reconnect.
    fn teardown_session(&mut self) {
        self.interrupt_turn();
        self.cancel_retry();
        if let Some(mut conn) = self.connection.take() {
            conn.close(NORMAL_CLOSURE, "session replaced");
            self.supervisor.close();
            self.notify_link();
        } else {
            self.supervisor.close();
        }
    }

    fn interrupt_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            if matches!(turn.phase, TurnPhase::AwaitingOpen { .. }) {
                self.accumulator.retract_user_turn();
            } else {
                self.accumulator.finalize();
            }
            turn.cancel();
            self.notify(Notice::Error(ChatError::Interrupted));
        }
    }

    /// The text turn never reached the backend: drop its user message so a retry starts clean.
    fn fail_unsent(&mut self, token: u64) {
        self.accumulator.retract_user_turn();
        log::warn!("controller: submission {} not delivered, connection unavailable", token);
        self.notify(Notice::Error(ChatError::ConnectionUnavailable));
    }

    fn is_awaiting_open(&self) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|t| matches!(t.phase, TurnPhase::AwaitingOpen { .. }))
    }

    fn current_turn(&self, token: u64) -> bool {
        self.turn.as_ref().is_some_and(|t| t.token == token)
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Watchdog { token } => {
                let streaming = self.turn.as_ref().is_some_and(Turn::is_streaming);
                if !self.current_turn(token) || !streaming {
                    log::debug!("controller: stale watchdog for submission {}", token);
                    return;
                }
                self.turn = None;
                self.accumulator.finalize();
                log::warn!("controller: submission {} timed out", token);
                self.notify(Notice::Error(ChatError::Timeout(self.policy.watchdog)));
            }
            Internal::OpenWait { token } => match self.turn.take() {
                Some(Turn {
                    token: t,
                    phase: TurnPhase::AwaitingOpen { .. },
                }) if t == token => self.fail_unsent(token),
                other => self.turn = other,
            },
            Internal::Retry { epoch } => {
                if self.retry.as_ref().map(|(e, _)| *e) != Some(epoch) {
                    return;
                }
                self.retry = None;
                if self.supervisor.retry_due() {
                    log::info!("controller: reconnect attempt {}", self.supervisor.attempt());
                    self.open_connection();
                }
            }
            Internal::OneShot { token, result } => match self.turn.take() {
                Some(Turn {
                    token: t,
                    phase: TurnPhase::OneShot { submission, .. },
                }) if t == token => self.finish_one_shot(submission, result),
                other => {
                    log::debug!("controller: stale one-shot reply for submission {}", token);
                    self.turn = other;
                }
            },
        }
    }

    fn finish_one_shot(&mut self, submission: Submission, result: Result<OneShotReply, ApiError>) {
        match result {
            Ok(reply) => {
                if let Some(failure) = reply.failure() {
                    log::warn!("controller: one-shot reply carried an error: {}", failure);
                    self.notify(Notice::Error(ChatError::Backend(failure)));
                    return;
                }
                if !reply.is_done() {
                    log::debug!("controller: one-shot reply without done marker");
                }
                let image = submission.image.as_ref().map(|i| i.url.as_str());
                self.accumulator.begin_user_turn(&submission.text, image);
                let message = self.accumulator.push_assistant(reply.content());
                self.notify(Notice::Finished(message));
            }
            Err(e) => {
                log::warn!("controller: one-shot request failed: {}", e);
                self.notify(Notice::Error(e.into()));
            }
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        let Inbound { connection, event } = inbound;
        if self.connection.as_ref().map(|c| c.id()) != Some(connection) {
            log::debug!("controller: dropping event from stale {}", connection);
            return;
        }
        match event {
            TransportEvent::Open => {
                self.supervisor.on_open();
                self.notify_link();
                self.flush_awaiting();
            }
            TransportEvent::Frame(raw) => self.on_frame(&raw),
            TransportEvent::Error(info) => {
                log::warn!("controller: transport error on {}: {}", connection, info)
            }
            TransportEvent::Close { code, reason } => self.on_close(code, &reason),
        }
    }

    fn flush_awaiting(&mut self) {
        match self.turn.take() {
            Some(Turn {
                token,
                phase: TurnPhase::AwaitingOpen { request, timer },
            }) => {
                if self.try_send(&request) {
                    timer.abort();
                    self.start_watchdog(token);
                } else {
                    self.turn = Some(Turn {
                        token,
                        phase: TurnPhase::AwaitingOpen { request, timer },
                    });
                }
            }
            other => self.turn = other,
        }
    }

    fn on_frame(&mut self, raw: &str) {
        if !self.turn.as_ref().is_some_and(Turn::is_streaming) {
            log::debug!("controller: discarding frame with no streaming turn");
            return;
        }
        for frame in decode_lines(raw) {
            match frame {
                StreamFrame::Delta { text } => {
                    self.accumulator.apply_delta(&text);
                    self.notify(Notice::Delta(text));
                }
                StreamFrame::Status { phase, detail } => {
                    self.notify(Notice::Status { phase, detail });
                }
                StreamFrame::Error {
                    message,
                    origin: ErrorOrigin::Decode,
                } => {
                    self.notify(Notice::Error(ChatError::Protocol(message)));
                }
                StreamFrame::Error {
                    message,
                    origin: ErrorOrigin::Backend,
                } => {
                    self.finish_stream(Err(ChatError::Backend(message)));
                    return;
                }
                StreamFrame::Done => {
                    self.finish_stream(Ok(()));
                    return;
                }
            }
        }
    }

    fn finish_stream(&mut self, result: Result<(), ChatError>) {
        if let Some(turn) = self.turn.take() {
            turn.cancel();
        }
        let finished = self.accumulator.finalize().cloned();
        match result {
            Ok(()) => {
                // A turn that ended without any text still gets its (empty) reply entry.
                let message = finished.unwrap_or_else(|| self.accumulator.push_assistant(""));
                self.notify(Notice::Finished(message));
            }
            Err(e) => {
                log::warn!("controller: turn failed: {}", e);
                self.notify(Notice::Error(e));
            }
        }
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        self.connection = None;
        match self.supervisor.on_close(code) {
            CloseAction::None => {
                log::info!("controller: connection closed ({} {})", code, reason);
                self.notify_link();
            }
            CloseAction::Retry { attempt, delay } => {
                // A submission is waiting on this connection: reopen now, not after the backoff.
                if self.is_awaiting_open() && self.supervisor.retry_due() {
                    log::warn!(
                        "controller: connection lost ({} {}), reopening for pending submission",
                        code,
                        reason
                    );
                    self.notify(Notice::Reconnecting {
                        attempt,
                        delay: std::time::Duration::ZERO,
                    });
                    self.open_connection();
                    return;
                }
                log::warn!(
                    "controller: connection lost ({} {}), reconnecting in {}ms (attempt {})",
                    code,
                    reason,
                    delay.as_millis(),
                    attempt
                );
                self.retry_epoch += 1;
                let epoch = self.retry_epoch;
                let timer = self.schedule(delay, Internal::Retry { epoch });
                self.retry = Some((epoch, timer));
                self.notify(Notice::Reconnecting { attempt, delay });
            }
            CloseAction::GiveUp { attempts } => {
                log::warn!("controller: giving up after {} reconnection attempts", attempts);
                self.notify_link();
                self.notify(Notice::Error(ChatError::Transport { attempts }));
                if let Some(Turn {
                    token,
                    phase: TurnPhase::AwaitingOpen { timer, .. },
                }) = self.turn.take_if(|t| matches!(t.phase, TurnPhase::AwaitingOpen { .. }))
                {
                    timer.abort();
                    self.fail_unsent(token);
                }
            }
        }
    }
}

impl<T: Transport, B: OneShotBackend> Drop for SessionController<T, B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
