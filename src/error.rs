//! Messaging error taxonomy
//!
//! Setup mistakes (`Configuration`) and transport failures (`Transport`) are fatal
//! to the process that hits them. `UnknownMessageType` and `Handler` are per-message
//! conditions: the dispatch table records them and keeps serving traffic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// Unresolvable transport type, missing plugin factory, duplicate handler or
    /// a lifecycle call made in the wrong order.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The underlying transport failed to initialize, configure or send.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound envelope whose `data.type` has no registered handler.
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),

    /// A registered handler returned an error.
    #[error("handler for '{message_type}' failed: {reason}")]
    Handler { message_type: String, reason: String },

    /// Payload that cannot be decoded into the expected shape.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl MessagingError {
    /// True for errors that must abort process startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Transport(_))
    }
}

pub type MessagingResult<T> = std::result::Result<T, MessagingError>;
