use chatflow_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Messaging channel an inbound message arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageProvider {
    /// Official Cloud API.
    Meta,
    /// Self-hosted HTTP gateway.
    Waha,
}

impl MessageProvider {
    /// Returns the stable wire value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Meta => "META",
            Self::Waha => "WAHA",
        }
    }
}

/// Text received from a contact, buffered until the conversation goes quiet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel the message came from.
    pub provider: MessageProvider,
    /// Receiving inbox, when the company runs several.
    pub inbox_id: Option<String>,
    /// Message body.
    pub text: String,
}

impl InboundMessage {
    /// Creates a message, rejecting blank bodies.
    pub fn new(
        provider: MessageProvider,
        inbox_id: Option<String>,
        text: impl Into<String>,
    ) -> AppResult<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(AppError::Validation(
                "inbound message text must not be empty".to_owned(),
            ));
        }

        Ok(Self {
            provider,
            inbox_id: inbox_id.filter(|inbox_id| !inbox_id.trim().is_empty()),
            text,
        })
    }
}

/// Joins a flushed batch into one prompt, oldest message first.
#[must_use]
pub fn merge_message_texts<'a>(messages: impl IntoIterator<Item = &'a InboundMessage>) -> String {
    messages
        .into_iter()
        .map(|message| message.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
