//! Queue Error Types

/// Error types for durable queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Accepting the message would push usage past 90% of the limit
    #[error("storage full: {count} messages created, limit {limit} bytes")]
    StorageFull {
        /// Configured limit in bytes
        limit: u64,
        /// Number of messages this queue has created
        count: u64,
    },

    /// Message could not be serialized
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether this is a capacity failure
    pub fn is_storage_full(&self) -> bool {
        matches!(self, QueueError::StorageFull { .. })
    }
}
