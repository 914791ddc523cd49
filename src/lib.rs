//! Metered Relay Library
//!
//! The on-device half of a telemetry pipeline: it takes structured events
//! from an instrumented application, enforces a data budget while on a
//! metered connection, keeps undelivered events in a durable queue, and
//! hands admitted events to a downstream publisher.

pub mod config;
pub mod limiter;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod queue;

pub use limiter::{CellularConfig, DataLimit, DataLimiter};
pub use message::{Message, Topic};
pub use queue::{MessageStore, Persistor, QueueError};
