//! BenchLink - messaging core for distributed benchmark runs
//!
//! BenchLink lets one master process and N worker processes agree on the
//! lifecycle of a benchmark (initialize, prepare, execute, stop) and exchange
//! status and result data over a transport that can be swapped by configuration.
//!
//! # Architecture
//!
//! - **Messenger facade**: resolves a transport type identifier and forwards a fixed
//!   operation set (initialize, configure, send, identity) to the transport
//! - **Envelopes**: addressed, timestamped, typed units of communication
//! - **Handler tables**: route an envelope's `data.type` to an async handler bound
//!   to a shared context
//! - **Bootstraps**: master coordinator and worker service wiring the pieces together
//! - **Adapters**: SUT clients constructed by the worker on `init`

pub mod adapter;
pub mod config;
pub mod distributed;
pub mod error;
pub mod messaging;
pub mod util;

// Re-export commonly used types
pub use config::Config;
pub use error::{MessagingError, MessagingResult};
pub use messaging::{Envelope, HandlerTable, MessageData, Messenger, MessengerConfig, Recipients};

/// Result type used throughout BenchLink
pub type Result<T> = anyhow::Result<T>;
