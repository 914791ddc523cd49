//! Telemetry Messages
//!
//! A [`Message`] is the unit that flows through the relay: an opaque payload
//! tagged with a [`Topic`], optionally annotated with an error when the
//! message reports a failure instead of carrying application data.
//!
//! The serialized record (`{topic, bytes, error}`) is the on-disk format used
//! by the durable queue. The payload is stored base64 encoded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of event carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// Profiling tree
    Profile,
    /// Crash signal or other application event
    Event,
    /// Log line
    Log,
}

impl Topic {
    /// Broker channel that messages of this topic are published on
    pub fn channel(&self) -> &'static str {
        match self {
            Topic::Profile => "profiler",
            Topic::Event => "events",
            Topic::Log => "logs",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Profile => write!(f, "profile"),
            Topic::Event => write!(f, "event"),
            Topic::Log => write!(f, "log"),
        }
    }
}

/// A telemetry message
///
/// A message only has a storage path once it has been accepted into the
/// durable queue. In-flight messages built with [`Message::new`] have none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message is published under
    pub topic: Topic,

    /// Opaque payload
    #[serde(default, with = "base64_payload")]
    pub bytes: Vec<u8>,

    /// Set when the message describes a reporting failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Message {
    /// Create an in-memory message
    pub fn new(topic: Topic, bytes: Vec<u8>) -> Self {
        Self {
            topic,
            bytes,
            error: None,
            path: None,
        }
    }

    /// Create a message that reports a failure rather than payload data
    pub fn failure(topic: Topic, error: impl Into<String>) -> Self {
        Self {
            topic,
            bytes: Vec::new(),
            error: Some(error.into()),
            path: None,
        }
    }

    /// Backing file of this message, if it has been persisted
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the message is backed by a queue file
    pub fn is_persisted(&self) -> bool {
        self.path.is_some()
    }

    pub(crate) fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// Serialized record
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
