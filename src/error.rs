//! Error types for the client engine
//!
//! Defines crate-level errors plus the narrower configuration, scheduler
//! and shard errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Crate-level errors
///
/// Only terminal conditions escape the event loop. Transport and protocol
/// problems stay local to the connection that produced them.
#[derive(Debug, Error)]
pub enum ChatError {
    /// IO error (poll failure, socket setup)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Scheduler misuse (fatal)
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Room name could not be mapped to a server
    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    /// HTTP round trip failed
    #[error("HTTP error: {0}")]
    Http(#[from] Box<ureq::Error>),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Long-message policy cannot make progress with a zero length
    #[error("max_length must be greater than zero")]
    ZeroMaxLength,

    /// History must hold at least one message
    #[error("max_history_length must be greater than zero")]
    ZeroHistory,

    /// Recent-mode userlist needs a window
    #[error("userlist_memory must be greater than zero")]
    ZeroUserlistMemory,

    /// PM host is required when PM is enabled
    #[error("pm_host must not be empty")]
    EmptyPmHost,

    /// Ping interval must be positive
    #[error("ping_delay must be greater than zero")]
    ZeroPingDelay,

    /// Reconnect backoff bounds are inverted or zero
    #[error("reconnect backoff is invalid: initial {initial_ms}ms, max {max_ms}ms")]
    InvalidBackoff { initial_ms: u64, max_ms: u64 },

    /// Blocking pool needs at least one thread
    #[error("worker_threads must be greater than zero")]
    ZeroWorkers,
}

/// Scheduler errors
///
/// `ZeroDelayRearm` is a programming error: once raised the scheduler is
/// poisoned and every later tick fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// A zero-delay one-shot task re-armed itself from its own callback
    #[error("task '{label}' re-armed itself with zero delay; use an interval or Delay::NextTick")]
    ZeroDelayRearm { label: String },

    /// A previous misuse left the scheduler unusable
    #[error("scheduler is poisoned by an earlier misuse")]
    Poisoned,
}

/// Shard selection errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShardError {
    /// Name is empty or contains characters outside base 36
    #[error("room name '{0}' cannot be mapped to a server")]
    InvalidRoomName(String),
}

impl From<ureq::Error> for ChatError {
    fn from(err: ureq::Error) -> Self {
        ChatError::Http(Box::new(err))
    }
}
