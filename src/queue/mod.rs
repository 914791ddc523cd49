//! Durable Queue
//!
//! Crash-recoverable, capacity-bounded storage for messages that could not
//! be delivered yet.

pub mod error;
pub mod persistor;

pub use error::QueueError;
pub use persistor::{MessageStore, Persistor};
