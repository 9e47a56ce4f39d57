use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// The field-value pairs stored in a stream entry.
pub type Payload = HashMap<String, String>;

/// Enumeration of errors for operations against a stream log.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("consumer group already exists")]
    GroupExists,
    #[error("connection failed with: {0}")]
    Connection(String),
    #[error("{command} command failed with: {error}")]
    Command { command: String, error: String },
    #[error("{command} command timed out")]
    Timeout { command: String },
    #[error("stream log unavailable: {0}")]
    Unavailable(String),
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// A single entry as delivered to a consumer of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Identifier assigned by the log, e.g. "1-0".
    pub id: String,
    pub payload: Payload,
}

impl StreamMessage {
    pub fn new(id: &str, payload: Payload) -> Self {
        Self {
            id: id.to_owned(),
            payload,
        }
    }
}

/// Where a group read starts from.
/// Pending: entries already delivered to this consumer but not acknowledged (backlog mode).
/// New: entries never delivered to any consumer of the group (latest mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Pending,
    New,
}

impl Cursor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cursor::Pending => "0-0",
            Cursor::New => ">",
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability interface over a log exposing consumer-group semantics.
///
/// Implementations must tolerate concurrent calls: every consumer in a round
/// shares the same client.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Create `group` on `stream`, delivering entries after `start_id`.
    /// Returns `StreamError::GroupExists` if the group is already there.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> StreamResult<()>;

    /// Read at most `count` entries for `consumer` starting at `cursor`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: Cursor,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>>;

    /// Acknowledge `id`, returning how many entries were removed from the pending list.
    /// Unknown or already acknowledged ids yield 0.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> StreamResult<i64>;
}

#[async_trait]
impl<T: StreamClient + ?Sized> StreamClient for &T {
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> StreamResult<()> {
        (**self).create_group(stream, group, start_id).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: Cursor,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        (**self)
            .read_group(stream, group, consumer, cursor, count)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StreamResult<i64> {
        (**self).ack(stream, group, id).await
    }
}

#[async_trait]
impl<T: StreamClient + ?Sized> StreamClient for Arc<T> {
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> StreamResult<()> {
        (**self).create_group(stream, group, start_id).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: Cursor,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        (**self)
            .read_group(stream, group, consumer, cursor, count)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StreamResult<i64> {
        (**self).ack(stream, group, id).await
    }
}
