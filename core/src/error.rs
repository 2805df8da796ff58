/// Error types for the chat client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success status from the server, with its `detail` text when present
    #[error("Request rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("No recipient selected")]
    NoRecipient,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
