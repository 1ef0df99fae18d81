//! Error types and result handling for graph-streams.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use graph_streams::{Error, Result};
//!
//! fn load_settings() -> Result<()> {
//!     Err(Error::Config("The `kafka.bootstrap.servers` property is empty".to_string()))
//! }
//!
//! match load_settings() {
//!     Ok(()) => println!("Loaded"),
//!     Err(Error::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for graph-streams operations.
///
/// Configuration and validation errors are fatal at startup. Extraction
/// errors abort a single transaction's event batch. Broker errors raised by
/// the topic poller are logged and never escalated.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration, surfaced before anything starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Extended configuration check failed, e.g. unreachable brokers.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A consistent before/after diff could not be computed for an entity.
    #[error("Extraction error in transaction {tx_id}: {message}")]
    Extraction {
        /// Transaction whose event batch was aborted
        tx_id: u64,
        /// Description of the offending entity or mutation
        message: String,
    },

    /// Kafka client, producer or admin error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding or decoding messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from configuration file or socket operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An event batch could not be handed to the dispatcher.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Applying an inbound message to the graph failed.
    #[error("Sink error on topic '{topic}': {message}")]
    Sink {
        /// Topic the message was consumed from
        topic: String,
        /// Description of the failure
        message: String,
    },

    /// Operation not permitted in the component's current lifecycle state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    #[error("Shutdown requested")]
    Shutdown,
}

/// A convenient Result type alias for graph-streams operations.
pub type Result<T> = std::result::Result<T, Error>;
