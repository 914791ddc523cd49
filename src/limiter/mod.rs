//! Data Admission Control
//!
//! Enforces a metered-data budget per billing period. Messages that fit in
//! the current window are forwarded downstream; the rest stay in the
//! durable queue until a later period.
//!
//! # Components
//!
//! - [`budget`]: billing-cycle arithmetic and the byte budget window
//! - [`data_limit`]: configuration documents that set the budget
//! - [`state`]: the [`DataLimiter`] state machine
//! - [`store`]: persistence of the budget window across restarts

pub mod budget;
pub mod data_limit;
pub mod state;
pub mod store;

pub use budget::{day_this_month, ensure_future, next_rollover, BudgetWindow};
pub use data_limit::{CellularConfig, ConfigError, DataLimit, StorageConfig};
pub use state::{DataLimiter, State};
pub use store::{BudgetStore, FileBudgetStore, MemBudgetStore, SavedWindow, StoreError};
