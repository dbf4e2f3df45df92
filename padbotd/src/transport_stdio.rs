//! Development chat transport over stdin/stdout
//!
//! Stands in for the real chat client during local runs: every stdin line
//! becomes a `MessageReceived` event (`name: text`, or plain text attributed
//! to `console`), and outbound messages print to stdout. The rest of the
//! daemon cannot tell the difference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use padbot_common::transport::{ChatEvent, ChatTransport, TransportError};

pub struct StdioTransport {
    connected: AtomicBool,
}

impl StdioTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
        })
    }

    /// Forward stdin lines as chat events until stdin closes
    pub fn spawn_reader(&self, events: mpsc::Sender<ChatEvent>) {
        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = BufReader::new(stdin).lines();
            info!("Reading chat from stdin ('name: text' or plain text)");

            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (user, text) = match line.split_once(':') {
                    Some((user, text)) if !user.trim().is_empty() => {
                        (user.trim().to_string(), text.trim().to_string())
                    }
                    _ => ("console".to_string(), line.to_string()),
                };
                if events
                    .send(ChatEvent::MessageReceived { user, text })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            debug!("Stdin closed, stdio transport reader exiting");
        });
    }
}

#[async_trait::async_trait]
impl ChatTransport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        println!("[{}] {}", channel, text);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
