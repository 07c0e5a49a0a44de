//! Lifecycle protocol between master and workers
//!
//! Typed view over envelope payloads. Every message travels as an envelope whose
//! `data` is the serialized variant, with `type` as the routing key.
//!
//! # Message Flow
//!
//! ```text
//! Master                          Worker
//!   |                               |
//!   |-------- REGISTER (all) ------>|   (repeated every second)
//!   |<------- CONNECTED ------------|
//!   |                               |
//!   |-------- INIT ---------------->|
//!   |<------- READY ----------------|
//!   |                               |
//!   |-------- PREPARE(round) ------>|   \
//!   |<------- PREPARED -------------|    | per round
//!   |-------- TEST(round) --------->|    |
//!   |<------- TEST_RESULT ----------|   /
//!   |                               |
//!   |-------- EXIT (all) ---------->|
//! ```
//!
//! Any handler failure on a worker is reported with an `error` message.

use crate::error::{MessagingError, MessagingResult};
use crate::messaging::{MessageData, Messenger, Recipients};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::messaging::codec::PROTOCOL_VERSION;

/// Routing type names
pub mod types {
    pub const REGISTER: &str = "register";
    pub const CONNECTED: &str = "connected";
    pub const INIT: &str = "init";
    pub const READY: &str = "ready";
    pub const PREPARE: &str = "prepare";
    pub const PREPARED: &str = "prepared";
    pub const TEST: &str = "test";
    pub const TEST_RESULT: &str = "testResult";
    pub const ERROR: &str = "error";
    pub const EXIT: &str = "exit";
}

/// Lifecycle message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Master asks every listening worker to announce itself
    Register,

    /// Worker announces itself
    Connected {
        worker_id: String,
        node: String,
        #[serde(default)]
        sut: Option<String>,
    },

    /// Master asks workers to build their SUT adapter
    Init,

    /// Worker holds an adapter
    Ready { worker_id: String },

    /// Master asks workers to get ready for a round
    Prepare {
        round: usize,
        label: String,
        #[serde(default)]
        settings: Value,
    },

    Prepared { worker_id: String, round: usize },

    /// Master asks workers to execute a round
    Test {
        round: usize,
        label: String,
        #[serde(default)]
        settings: Value,
    },

    TestResult {
        worker_id: String,
        round: usize,
        #[serde(default)]
        result: Value,
    },

    /// A worker handler failed
    Error {
        worker_id: String,
        message_type: String,
        error: String,
    },

    /// Master ends the run
    Exit,
}

impl Message {
    /// Routing type of this message
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Register => types::REGISTER,
            Message::Connected { .. } => types::CONNECTED,
            Message::Init => types::INIT,
            Message::Ready { .. } => types::READY,
            Message::Prepare { .. } => types::PREPARE,
            Message::Prepared { .. } => types::PREPARED,
            Message::Test { .. } => types::TEST,
            Message::TestResult { .. } => types::TEST_RESULT,
            Message::Error { .. } => types::ERROR,
            Message::Exit => types::EXIT,
        }
    }

    /// Split into routing type and payload for [`Messenger::send`]
    pub fn into_parts(self) -> MessagingResult<(&'static str, MessageData)> {
        let message_type = self.message_type();
        let value = serde_json::to_value(&self)
            .map_err(|e| MessagingError::Malformed(format!("{}: {}", message_type, e)))?;

        match value {
            Value::Object(map) => Ok((message_type, MessageData::from(map))),
            other => Err(MessagingError::Malformed(format!(
                "{} serialized to a non-object: {}",
                message_type, other
            ))),
        }
    }

    /// Decode an inbound payload
    ///
    /// Fields the variant does not know are ignored.
    pub fn from_data(data: &MessageData) -> MessagingResult<Self> {
        serde_json::from_value(Value::Object(data.as_map().clone())).map_err(|e| {
            MessagingError::Malformed(format!(
                "{}: {}",
                data.message_type().unwrap_or("<untyped>"),
                e
            ))
        })
    }

    /// Worker that sent this message, for worker -> master variants
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Message::Connected { worker_id, .. }
            | Message::Ready { worker_id }
            | Message::Prepared { worker_id, .. }
            | Message::TestResult { worker_id, .. }
            | Message::Error { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }
}

/// Send a typed message through `messenger`
pub fn send(messenger: &Messenger, to: Recipients, message: Message) -> MessagingResult<()> {
    let (message_type, data) = message.into_parts()?;
    messenger.send(to, message_type, data)
}
