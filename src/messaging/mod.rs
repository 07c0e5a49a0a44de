//! Messaging layer
//!
//! - [`Messenger`]: process-local facade over one transport
//! - [`Envelope`]: the unit every transport carries
//! - [`HandlerTable`]: type-keyed inbound dispatch
//! - [`TransportRegistry`]: built-in transports plus compiled-in plugin modules
//!
//! Built-in transports:
//!
//! | type | role | carrier |
//! |------|------|---------|
//! | `process-master` / `process-worker` | same OS process | tokio channels |
//! | `tcp-master` / `tcp-worker` | separate processes or hosts | length-prefixed MessagePack over TCP |

pub mod clock;
pub mod codec;
pub mod envelope;
pub mod handler;
pub mod messenger;
pub mod process;
pub mod registry;
pub mod tcp;
pub mod transport;

pub use envelope::{Envelope, MessageData, Recipients, BROADCAST};
pub use handler::{DispatchEvent, DispatchStats, HandlerTable};
pub use messenger::{Messenger, MessengerConfig};
pub use process::{ChannelHub, ProcessTransport};
pub use registry::{PluginModule, TransportFactory, TransportRegistry};
pub use tcp::TcpTransport;
pub use transport::{Dispatch, Role, Transport};
