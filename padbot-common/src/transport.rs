//! Chat transport protocol
//!
//! The bot core never talks to a chat service directly. A transport
//! implementation raises [`ChatEvent`]s into the pipeline and accepts
//! outbound messages through the [`ChatTransport`] trait. Everything here is
//! service-agnostic; the concrete Twitch/IRC client lives outside the core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Events raised by the chat transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChatEvent {
    Connected,
    Disconnected,
    Reconnected,
    JoinedChannel { channel: String },
    MessageReceived { user: String, text: String },
    WhisperReceived { user: String, text: String },
    HostReceived { host: String },
    Subscription { user: String },
    Resubscription { user: String, months: u32 },
}

/// A message queued for delivery to chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub text: String,
}

/// Transport failures surfaced to the reconnect routine
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

/// Narrow interface the core uses to reach the chat service
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn send_message(&self, channel: &str, text: &str) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
}

/// Split a message at safe boundaries so no part exceeds `limit` characters
///
/// Prefers whitespace boundaries; a single overlong word is hard-split.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();

        // Hard-split a word that cannot fit on its own line
        if word_len > limit {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for chunk in chars.chunks(limit) {
                parts.push(chunk.iter().collect());
            }
            continue;
        }

        let needed = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };
        if needed > limit {
            parts.push(std::mem::take(&mut current));
            current.push_str(word);
            current_len = word_len;
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
