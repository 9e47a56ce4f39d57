use stream_common::stream::{Cursor, StreamError};
use thiserror::Error;

/// Enumeration of errors that can end a single read cycle of one consumer.
/// None of these leave `StreamReader`: the cycle reports failure and the round goes on.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("reading with cursor {cursor} failed: {error}")]
    Read { cursor: Cursor, error: StreamError },
    #[error("handler failed for message {id}, leaving it pending: {error:#}")]
    Handler { id: String, error: anyhow::Error },
    #[error("acknowledging message {id} failed: {error}")]
    Ack { id: String, error: StreamError },
}

impl ConsumerError {
    /// Identifier of the message the cycle was processing, if it got that far.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            ConsumerError::Read { .. } => None,
            ConsumerError::Handler { id, .. } | ConsumerError::Ack { id, .. } => Some(id),
        }
    }
}

/// Enumeration of errors related to starting and running a group of consumers.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("could not create consumer group {group}: {reason}")]
    GroupCreation { group: String, reason: String },
    #[error("at least one consumer is required")]
    NoConsumers,
}

/// Enumeration of errors that stop the worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to connect to the stream log: {0}")]
    Connection(#[from] StreamError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("failed to set up logging: {0}")]
    Logging(#[from] std::io::Error),
}
