//! Messaging client seam.
//!
//! - `mod.rs`: client trait, lifecycle events, helpers
//! - `browser.rs`: chromiumoxide adapter driving the messaging web client

pub mod browser;

pub use browser::BrowserClientFactory;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::models::ClientInfo;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Client not initialized")]
    NotInitialized,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Unsupported recipient: {0}")]
    UnsupportedRecipient(String),

    #[error("{0}")]
    Send(String),
}

/// Lifecycle callbacks emitted by a client while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Qr(String),
    Authenticated,
    Ready(ClientInfo),
    Disconnected(String),
    AuthFailure(String),
}

pub type EventSender = UnboundedSender<ClientEvent>;

/// A file already persisted on disk, ready to be attached.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub path: PathBuf,
    pub mime_type: String,
    pub file_name: String,
}

#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Start the client. Lifecycle events flow through the sender the
    /// factory was given.
    async fn initialize(&self) -> Result<(), ClientError>;

    /// Returns the upstream message id.
    async fn send_text(&self, chat_id: &str, body: &str) -> Result<String, ClientError>;

    async fn send_media(
        &self,
        chat_id: &str,
        media: &MediaFile,
        caption: Option<&str>,
    ) -> Result<String, ClientError>;

    /// Unlink the device from the account.
    async fn logout(&self) -> Result<(), ClientError>;

    /// Release local resources without unlinking.
    async fn destroy(&self) -> Result<(), ClientError>;
}

pub trait ClientFactory: Send + Sync {
    fn create(&self, session_id: &str, events: EventSender) -> Arc<dyn MessagingClient>;
}

/// Turn a phone number into a chat id. Values that already carry a server
/// suffix (`...@c.us`, `...@g.us`) pass through untouched.
pub fn to_chat_id(to: &str) -> String {
    if to.contains('@') {
        return to.to_string();
    }
    let digits: String = to.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{}@c.us", digits)
}
