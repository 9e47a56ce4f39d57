use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};

use crate::stream::{Cursor, Payload, StreamClient, StreamError, StreamMessage, StreamResult};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Build a payload from string pairs.
pub fn payload(fields: &[(&str, &str)]) -> Payload {
    fields
        .iter()
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .collect()
}

/// A call made against a `MemoryStreamClient`, in the order it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateGroup {
        stream: String,
        group: String,
    },
    Read {
        consumer: String,
        cursor: Cursor,
        delivered: Vec<String>,
    },
    Ack {
        id: String,
        acked: i64,
    },
}

#[derive(Default)]
struct MemoryGroup {
    /// Number of entries handed out with the `>` cursor.
    delivered: usize,
    /// (entry id, consumer) in delivery order.
    pending: Vec<(String, String)>,
}

#[derive(Default)]
struct MemoryStream {
    entries: Vec<StreamMessage>,
    groups: HashMap<String, MemoryGroup>,
    next_sequence: u64,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, MemoryStream>,
    calls: Vec<Call>,
    failing_consumers: HashSet<String>,
    fail_acks: bool,
    group_creation_failure: Option<String>,
}

/// An in-memory stream log with consumer-group semantics, for tests.
///
/// Entries get ids `1-0`, `2-0`, ... in insertion order. Reading with `>` hands out
/// entries no consumer of the group has seen and records them as pending for the
/// reader; reading with `0-0` replays the reader's own pending entries. Acknowledging
/// removes an entry from the pending list.
#[derive(Default)]
pub struct MemoryStreamClient {
    state: Mutex<State>,
}

impl MemoryStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("poisoned MemoryStreamClient mutex")
    }

    /// Append an entry to `stream`, creating the stream if needed. Returns the new id.
    pub fn add(&self, stream: &str, payload: Payload) -> String {
        let mut state = self.state();
        let stream = state.streams.entry(stream.to_owned()).or_default();
        stream.next_sequence += 1;
        let id = format!("{}-0", stream.next_sequence);
        stream.entries.push(StreamMessage::new(&id, payload));
        id
    }

    /// Make every read issued by `consumer` fail.
    pub fn fail_reads_for(&self, consumer: &str) {
        self.state().failing_consumers.insert(consumer.to_owned());
    }

    /// Make every acknowledgment fail.
    pub fn fail_acks(&self) {
        self.state().fail_acks = true;
    }

    /// Make group creation fail with something other than "group exists".
    pub fn fail_group_creation(&self, reason: &str) {
        self.state().group_creation_failure = Some(reason.to_owned());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn group_exists(&self, stream: &str, group: &str) -> bool {
        self.state()
            .streams
            .get(stream)
            .map(|stream| stream.groups.contains_key(group))
            .unwrap_or(false)
    }

    /// Ids pending on `consumer`, oldest first.
    pub fn pending(&self, stream: &str, group: &str, consumer: &str) -> Vec<String> {
        self.state()
            .streams
            .get(stream)
            .and_then(|stream| stream.groups.get(group))
            .map(|group| {
                group
                    .pending
                    .iter()
                    .filter(|(_, owner)| owner == consumer)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reads issued by `consumer` as (cursor, delivered ids).
    pub fn reads_for(&self, consumer: &str) -> Vec<(Cursor, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Read {
                    consumer: reader,
                    cursor,
                    delivered,
                } if reader == consumer => Some((cursor, delivered)),
                _ => None,
            })
            .collect()
    }

    /// Ids acknowledged so far, including acks that matched nothing.
    pub fn acks(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Ack { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }
}

fn parse_id(id: &str) -> Option<(u64, u64)> {
    let (millis, sequence) = id.split_once('-').unwrap_or((id, "0"));
    Some((millis.parse().ok()?, sequence.parse().ok()?))
}

fn no_group(stream: &str, group: &str) -> StreamError {
    StreamError::Command {
        command: "XREADGROUP".to_owned(),
        error: format!("NOGROUP No such key '{}' or consumer group '{}'", stream, group),
    }
}

#[async_trait]
impl StreamClient for MemoryStreamClient {
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> StreamResult<()> {
        {
            let mut state = self.state();
            state.calls.push(Call::CreateGroup {
                stream: stream.to_owned(),
                group: group.to_owned(),
            });

            if let Some(reason) = state.group_creation_failure.clone() {
                return Err(StreamError::Unavailable(reason));
            }

            let stream = state.streams.entry(stream.to_owned()).or_default();
            if stream.groups.contains_key(group) {
                return Err(StreamError::GroupExists);
            }

            let delivered = if start_id == "$" {
                stream.entries.len()
            } else {
                let start = parse_id(start_id).ok_or_else(|| StreamError::Command {
                    command: "XGROUP".to_owned(),
                    error: format!("invalid stream id {}", start_id),
                })?;
                stream
                    .entries
                    .iter()
                    .take_while(|entry| parse_id(&entry.id).is_some_and(|id| id <= start))
                    .count()
            };

            stream.groups.insert(
                group.to_owned(),
                MemoryGroup {
                    delivered,
                    pending: Vec::new(),
                },
            );
        }

        tokio::task::yield_now().await;
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: Cursor,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        let result = {
            let mut state = self.state();
            let failing = state.failing_consumers.contains(consumer);

            let result = if failing {
                Err(StreamError::Unavailable(format!(
                    "connection reset while reading for {}",
                    consumer
                )))
            } else {
                match state
                    .streams
                    .get_mut(stream)
                    .and_then(|memory| {
                        let MemoryStream {
                            entries, groups, ..
                        } = memory;
                        groups.get_mut(group).map(|group| (entries, group))
                    }) {
                    None => Err(no_group(stream, group)),
                    Some((entries, memory_group)) => match cursor {
                        Cursor::New => {
                            let start = memory_group.delivered;
                            let end = std::cmp::min(start + count, entries.len());
                            let messages = entries[start..end].to_vec();
                            memory_group.delivered = end;
                            memory_group.pending.extend(
                                messages
                                    .iter()
                                    .map(|message| (message.id.clone(), consumer.to_owned())),
                            );
                            Ok(messages)
                        }
                        Cursor::Pending => Ok(memory_group
                            .pending
                            .iter()
                            .filter(|(_, owner)| owner == consumer)
                            .take(count)
                            .filter_map(|(id, _)| {
                                entries.iter().find(|entry| &entry.id == id).cloned()
                            })
                            .collect()),
                    },
                }
            };

            state.calls.push(Call::Read {
                consumer: consumer.to_owned(),
                cursor,
                delivered: result
                    .as_ref()
                    .map(|messages| messages.iter().map(|m| m.id.clone()).collect())
                    .unwrap_or_default(),
            });

            result
        };

        // Give sibling consumers a chance to run, as a network round trip would.
        tokio::task::yield_now().await;
        result
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StreamResult<i64> {
        let result = {
            let mut state = self.state();

            if state.fail_acks {
                Err(StreamError::Unavailable("connection reset on XACK".to_owned()))
            } else {
                let acked = state
                    .streams
                    .get_mut(stream)
                    .and_then(|stream| stream.groups.get_mut(group))
                    .map(|group| {
                        let before = group.pending.len();
                        group.pending.retain(|(pending_id, _)| pending_id != id);
                        before - group.pending.len()
                    })
                    .unwrap_or(0);
                state.calls.push(Call::Ack {
                    id: id.to_owned(),
                    acked: acked as i64,
                });
                Ok(acked as i64)
            }
        };

        tokio::task::yield_now().await;
        result
    }
}
