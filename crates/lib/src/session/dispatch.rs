//! Request dispatcher: picks the transport for a submission and builds its payload.
//!
//! Text-only turns go over the streaming connection; turns with an image go to the one-shot
//! endpoint, which answers once with the full reply.

use anyhow::{Context, Result};
use base64::Engine;
use std::path::Path;

use super::SessionConfig;
use crate::conversation::{Conversation, Role};
use crate::protocol::{
    ContentPart, ImageUrl, MultipartMessage, OneShotRequest, StreamRequest, WireMessage,
};

/// Image attached to a submission, as a URL (usually `data:<mime>;base64,...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub url: String,
}

impl ImageAttachment {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Read an image file and encode it as a data URL.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
        Ok(Self::from_bytes(&bytes, mime_for(path)))
    }

    pub fn from_bytes(bytes: &[u8], mime: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self {
            url: format!("data:{};base64,{}", mime, encoded),
        }
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/png",
    }
}

/// What the user asked to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    pub text: String,
    pub image: Option<ImageAttachment>,
    /// Ask the server to ground the answer with a web search.
    pub search: bool,
}

impl Submission {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.image.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Stream(StreamRequest),
    OneShot(OneShotRequest),
}

/// Build the request for `submission`.
///
/// For the stream path `conversation` must already contain the user's message (appended by
/// the accumulator). For the one-shot path it holds only the prior history: the user's
/// message is added to the payload here and to the log only once the reply arrives.
pub fn plan(
    config: &SessionConfig,
    conversation: &Conversation,
    submission: &Submission,
) -> Dispatch {
    match &submission.image {
        None => Dispatch::Stream(StreamRequest {
            model: config.model.clone(),
            messages: conversation.messages.iter().map(WireMessage::from).collect(),
            conversation_id: conversation.id.to_string(),
            web_search: submission.search,
        }),
        Some(image) => {
            let mut messages: Vec<MultipartMessage> = conversation
                .messages
                .iter()
                .map(|m| MultipartMessage {
                    role: m.role,
                    content: vec![ContentPart::Text {
                        text: m.content.clone(),
                    }],
                })
                .collect();
            let mut parts = Vec::with_capacity(2);
            let text = submission.text.trim();
            if !text.is_empty() {
                parts.push(ContentPart::Text {
                    text: text.to_string(),
                });
            }
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image.url.clone(),
                },
            });
            messages.push(MultipartMessage {
                role: Role::User,
                content: parts,
            });
            Dispatch::OneShot(OneShotRequest {
                model: config.model.clone(),
                messages,
                conversation_id: conversation.id.to_string(),
                stream: false,
                web_search: submission.search,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Accumulator, ConversationId};

    fn config() -> SessionConfig {
        SessionConfig::new("m1", "ws://127.0.0.1:8000/api/ws")
    }

    #[test]
    fn text_goes_to_stream_with_full_history() {
        let mut acc = Accumulator::new(ConversationId::new("c1"));
        acc.begin_user_turn("earlier", None);
        acc.push_assistant("reply");
        acc.begin_user_turn("Hi", None);
        let sub = Submission::text("Hi");
        let Dispatch::Stream(req) = plan(&config(), acc.conversation(), &sub) else {
            panic!("expected stream dispatch");
        };
        assert_eq!(req.model, "m1");
        assert_eq!(req.conversation_id, "c1");
        let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(req.messages[2].content, "Hi");
    }

    #[test]
    fn image_goes_to_one_shot_with_parts() {
        let mut acc = Accumulator::new(ConversationId::new("c1"));
        acc.begin_user_turn("hello", None);
        let sub = Submission::text("describe")
            .with_image(ImageAttachment::from_url("data:image/png;base64,AAAA"))
            .with_search(true);
        let Dispatch::OneShot(req) = plan(&config(), acc.conversation(), &sub) else {
            panic!("expected one-shot dispatch");
        };
        assert!(!req.stream);
        assert!(req.web_search);
        assert_eq!(req.messages.len(), 2);
        let last = &req.messages[1];
        assert_eq!(last.role, Role::User);
        assert_eq!(
            last.content,
            vec![
                ContentPart::Text {
                    text: "describe".to_string()
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/png;base64,AAAA".to_string()
                    }
                },
            ]
        );
    }

    #[test]
    fn image_without_text_has_only_image_part() {
        let acc = Accumulator::new(ConversationId::new("c1"));
        let sub = Submission::default().with_image(ImageAttachment::from_url("https://x/cat.png"));
        let Dispatch::OneShot(req) = plan(&config(), acc.conversation(), &sub) else {
            panic!("expected one-shot dispatch");
        };
        assert_eq!(req.messages[0].content.len(), 1);
        assert!(matches!(req.messages[0].content[0], ContentPart::ImageUrl { .. }));
    }

    #[test]
    fn image_bytes_become_data_url() {
        let img = ImageAttachment::from_bytes(&[0x89, b'P', b'N', b'G'], "image/png");
        assert_eq!(img.url, "data:image/png;base64,iVBORw==");
        assert_eq!(mime_for(Path::new("photo.JPG")), "image/jpeg");
    }

    #[test]
    fn empty_submission_detected() {
        assert!(Submission::text("   ").is_empty());
        assert!(!Submission::default()
            .with_image(ImageAttachment::from_url("x"))
            .is_empty());
    }
}
