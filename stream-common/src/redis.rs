use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use redis::RedisError;
use tokio::time::timeout;

use crate::stream::{Cursor, Payload, StreamClient, StreamError, StreamMessage, StreamResult};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// A `StreamClient` backed by Redis Streams.
///
/// Holds one multiplexed connection; each command works on a clone of it so concurrent
/// consumers pipeline over the same socket.
#[derive(Clone)]
pub struct RedisClient {
    connection: MultiplexedConnection,
    command_timeout: Duration,
    mkstream: bool,
}

impl RedisClient {
    /// Connect to the Redis server at `addr`.
    pub async fn new(addr: &str) -> StreamResult<RedisClient> {
        let client = redis::Client::open(addr)
            .map_err(|error| StreamError::Connection(error.to_string()))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|error| StreamError::Connection(error.to_string()))?;

        Ok(RedisClient {
            connection,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            mkstream: true,
        })
    }

    /// Upper bound on the time a single command may take.
    pub fn command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Whether XGROUP CREATE should create the stream if it does not exist yet.
    pub fn mkstream(mut self, mkstream: bool) -> Self {
        self.mkstream = mkstream;
        self
    }

    async fn query<T: redis::FromRedisValue>(
        &self,
        command: &'static str,
        cmd: &redis::Cmd,
    ) -> StreamResult<T> {
        let mut connection = self.connection.clone();

        match timeout(self.command_timeout, cmd.query_async(&mut connection)).await {
            Ok(result) => result.map_err(|error| command_error(command, error)),
            Err(_) => Err(StreamError::Timeout {
                command: command.to_owned(),
            }),
        }
    }
}

fn command_error(command: &str, error: RedisError) -> StreamError {
    if error.code() == Some("BUSYGROUP") {
        return StreamError::GroupExists;
    }

    if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        return StreamError::Unavailable(error.to_string());
    }

    StreamError::Command {
        command: command.to_owned(),
        error: error.to_string(),
    }
}

/// Flatten an XREADGROUP reply into messages, keeping the order returned by the server.
/// Field values that are not strings are stringified; values that cannot be are dropped.
pub fn parse_read_reply(reply: StreamReadReply) -> Vec<StreamMessage> {
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|entry| {
            let payload: Payload = entry
                .map
                .iter()
                .filter_map(|(field, value)| {
                    redis::from_redis_value::<String>(value)
                        .ok()
                        .map(|value| (field.clone(), value))
                })
                .collect();

            StreamMessage {
                id: entry.id,
                payload,
            }
        })
        .collect()
}

#[async_trait]
impl StreamClient for RedisClient {
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> StreamResult<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start_id);
        if self.mkstream {
            cmd.arg("MKSTREAM");
        }

        self.query::<()>("XGROUP", &cmd).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: Cursor,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(cursor.as_str());

        // A read with nothing to deliver replies with nil.
        let reply: Option<StreamReadReply> = self.query("XREADGROUP", &cmd).await?;

        Ok(reply.map(parse_read_reply).unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StreamResult<i64> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(id);

        self.query("XACK", &cmd).await
    }
}
