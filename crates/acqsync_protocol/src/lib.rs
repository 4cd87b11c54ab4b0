//! Wire contract between the acquisition agent and the remote coordinator.
//!
//! The coordinator channel carries JSON text frames of a single shape:
//!
//! ```text
//! {"type": "state-update" | "state-update-partial", "attribute": <string>, "value": <any>}
//! ```
//!
//! Older coordinators label the kind with `"message"` instead of `"type"`;
//! both spellings are accepted on input, `"type"` is always written.
//! Unknown kinds decode to `None` and are ignored by the receiver.

pub mod defaults;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod paths;

pub use endpoint::websocket_url;
pub use error::{ProtocolError, Result};
pub use message::{ChannelMessage, MessageKind, StateValue, TransferProgress};
