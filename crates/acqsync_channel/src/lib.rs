//! Acqsync Channel - coordinator link and shared state
//!
//! The agent publishes what it is doing (transfer progress, completed
//! acquisition groups, counters) into a [`SharedState`]. A
//! [`PersistentChannel`] keeps a websocket open to the coordinator,
//! forwards local state changes as `state-update` frames and applies the
//! coordinator's updates back into the same state.

pub mod channel;
pub mod error;
pub mod state;

pub use channel::{Backoff, ChannelConfig, ChannelState, PersistentChannel};
pub use error::{ChannelError, Result, StateError};
pub use state::{ChangeOrigin, SharedState, StateChange, SubscriptionId};
