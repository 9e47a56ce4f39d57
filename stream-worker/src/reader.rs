use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use stream_common::metrics::{
    CYCLES, HANDLER_DURATION, HANDLER_FAILURES, MESSAGES_ACKED, MESSAGES_RECEIVED, READS,
};
use stream_common::stream::{Cursor, StreamClient, StreamMessage};
use tracing::{error, info};

use crate::error::ConsumerError;
use crate::handler::Handler;

/// Ids acknowledged during one read cycle, split by the cursor that delivered them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub backlog: Vec<String>,
    pub latest: Vec<String>,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty() && self.latest.is_empty()
    }
}

/// Runs read-process-acknowledge cycles for the consumers of one stream and group.
pub struct StreamReader<'a, C: ?Sized> {
    client: &'a C,
    stream: &'a str,
    group: &'a str,
    /// Entries requested per read. Each cursor is read once per cycle.
    batch_size: usize,
}

impl<'a, C: StreamClient + ?Sized> StreamReader<'a, C> {
    pub fn new(client: &'a C, stream: &'a str, group: &'a str) -> Self {
        Self {
            client,
            stream,
            group,
            batch_size: 1,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run one cycle for `consumer`, returning whether it completed without failure.
    ///
    /// Failures are logged and swallowed here: a message whose handler failed is left
    /// pending, and the caller only learns that this consumer made no progress.
    pub async fn read<H: Handler + ?Sized>(
        &self,
        consumer: &str,
        handler: &H,
        check_backlog: bool,
    ) -> bool {
        let labels = [
            ("stream", self.stream.to_owned()),
            ("consumer", consumer.to_owned()),
        ];

        match self.try_read(consumer, handler, check_backlog).await {
            Ok(_) => {
                metrics::counter!(CYCLES, &[("outcome", "success".to_owned())]).increment(1);
                true
            }
            Err(err) => {
                error!(
                    stream = self.stream,
                    group = self.group,
                    consumer,
                    message_id = err.message_id(),
                    "read cycle failed: {}",
                    err
                );
                if let ConsumerError::Handler { .. } = err {
                    metrics::counter!(HANDLER_FAILURES, &labels).increment(1);
                }
                metrics::counter!(CYCLES, &[("outcome", "failure".to_owned())]).increment(1);
                false
            }
        }
    }

    /// Run one cycle for `consumer` and report what was acknowledged.
    ///
    /// With `check_backlog`, the consumer's own pending entries are read and processed
    /// first. New entries are read afterwards in every case. Processing stops at the
    /// first failure.
    pub async fn try_read<H: Handler + ?Sized>(
        &self,
        consumer: &str,
        handler: &H,
        check_backlog: bool,
    ) -> Result<CycleReport, ConsumerError> {
        let mut report = CycleReport::default();

        if check_backlog {
            info!(consumer, "checking backlog for pending messages");
            report.backlog = self
                .read_and_process(consumer, handler, Cursor::Pending)
                .await?;
        }

        info!(consumer, "checking for new messages");
        report.latest = self.read_and_process(consumer, handler, Cursor::New).await?;

        Ok(report)
    }

    async fn read_and_process<H: Handler + ?Sized>(
        &self,
        consumer: &str,
        handler: &H,
        cursor: Cursor,
    ) -> Result<Vec<String>, ConsumerError> {
        let messages = self
            .client
            .read_group(self.stream, self.group, consumer, cursor, self.batch_size)
            .await
            .map_err(|error| ConsumerError::Read { cursor, error })?;

        let labels = [
            ("stream", self.stream.to_owned()),
            ("cursor", cursor.as_str().to_owned()),
        ];
        metrics::counter!(READS, &labels).increment(1);
        metrics::counter!(MESSAGES_RECEIVED, &labels).increment(messages.len() as u64);
        info!(
            consumer,
            %cursor,
            ?messages,
            "{} received {} message(s)",
            consumer,
            messages.len()
        );

        let mut acked = Vec::with_capacity(messages.len());
        for message in messages {
            acked.push(self.process(consumer, handler, message).await?);
        }

        Ok(acked)
    }

    /// Hand one message to the handler, then acknowledge it if the handler succeeded.
    async fn process<H: Handler + ?Sized>(
        &self,
        consumer: &str,
        handler: &H,
        message: StreamMessage,
    ) -> Result<String, ConsumerError> {
        let StreamMessage { id, payload } = message;

        info!(consumer, message_id = %id, ?payload, "executing handler");
        let start = Instant::now();
        // A panicking handler fails this message only, not the round it runs in.
        let result = match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
        };
        metrics::histogram!(HANDLER_DURATION, &[("stream", self.stream.to_owned())])
            .record(start.elapsed().as_secs_f64());

        if let Err(error) = result {
            return Err(ConsumerError::Handler { id, error });
        }

        info!(consumer, message_id = %id, "acknowledging message");
        let status = match self.client.ack(self.stream, self.group, &id).await {
            Ok(status) => status,
            Err(error) => return Err(ConsumerError::Ack { id, error }),
        };
        info!(consumer, message_id = %id, status, "acknowledged message");
        metrics::counter!(MESSAGES_ACKED, &[("stream", self.stream.to_owned())]).increment(1);

        Ok(id)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use stream_common::stream::Payload;
    use stream_common::test_utils::{payload, Call, MemoryStreamClient};

    use super::*;

    const STREAM: &str = "orders";
    const GROUP: &str = "orders_consumers";

    /// Records every payload it sees and fails for the configured order id.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<Payload>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingHandler {
        fn failing_on(order_id: &'static str) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_on: Some(order_id),
            }
        }

        fn seen(&self) -> Vec<Payload> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(&self, payload: Payload) -> anyhow::Result<()> {
            let order_id = payload.get("order_id").cloned();
            self.seen.lock().unwrap().push(payload);

            match (order_id, self.fail_on) {
                (Some(order_id), Some(fail_on)) if order_id == fail_on => {
                    anyhow::bail!("refusing order {}", order_id)
                }
                _ => Ok(()),
            }
        }
    }

    async fn client_with_group() -> MemoryStreamClient {
        let client = MemoryStreamClient::new();
        client.create_group(STREAM, GROUP, "0").await.unwrap();
        client
    }

    /// Deliver the next new entry to `consumer` without acknowledging it.
    async fn deliver_without_ack(client: &MemoryStreamClient, consumer: &str) {
        client
            .read_group(STREAM, GROUP, consumer, Cursor::New, 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_stream_reads_latest_only() {
        let client = client_with_group().await;
        let handler = RecordingHandler::default();
        let reader = StreamReader::new(&client, STREAM, GROUP);

        assert!(reader.read("consumer_1", &handler, false).await);

        assert!(handler.seen().is_empty());
        assert_eq!(
            client.reads_for("consumer_1"),
            vec![(Cursor::New, Vec::<String>::new())]
        );
        assert!(client.acks().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_message_is_handled_and_acked_once() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "42")]));
        deliver_without_ack(&client, "consumer_1").await;
        let handler = RecordingHandler::default();
        let reader = StreamReader::new(&client, STREAM, GROUP);

        assert!(reader.read("consumer_1", &handler, true).await);

        assert_eq!(handler.seen(), vec![payload(&[("order_id", "42")])]);
        assert_eq!(client.acks(), vec!["1-0"]);
        assert!(client.pending(STREAM, GROUP, "consumer_1").is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_skips_ack() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "1")]));
        client.add(STREAM, payload(&[("order_id", "2")]));
        let handler = RecordingHandler::failing_on("2");
        let reader = StreamReader::new(&client, STREAM, GROUP);

        assert!(reader.read("consumer_1", &handler, false).await);
        assert!(!reader.read("consumer_1", &handler, false).await);

        assert_eq!(client.acks(), vec!["1-0"]);
        assert_eq!(client.pending(STREAM, GROUP, "consumer_1"), vec!["2-0"]);
    }

    #[tokio::test]
    async fn test_backlog_is_processed_before_new_messages() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "1")]));
        deliver_without_ack(&client, "consumer_1").await;
        client.add(STREAM, payload(&[("order_id", "2")]));
        let handler = RecordingHandler::default();
        let reader = StreamReader::new(&client, STREAM, GROUP);

        let report = reader
            .try_read("consumer_1", &handler, true)
            .await
            .expect("cycle failed");

        assert_eq!(report.backlog, vec!["1-0"]);
        assert_eq!(report.latest, vec!["2-0"]);
        assert_eq!(
            handler.seen(),
            vec![payload(&[("order_id", "1")]), payload(&[("order_id", "2")])]
        );
        let calls: Vec<Call> = client
            .calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::CreateGroup { .. }))
            .collect();
        assert_eq!(
            calls,
            vec![
                Call::Read {
                    consumer: "consumer_1".to_owned(),
                    cursor: Cursor::New,
                    delivered: vec!["1-0".to_owned()],
                },
                Call::Read {
                    consumer: "consumer_1".to_owned(),
                    cursor: Cursor::Pending,
                    delivered: vec!["1-0".to_owned()],
                },
                Call::Ack {
                    id: "1-0".to_owned(),
                    acked: 1,
                },
                Call::Read {
                    consumer: "consumer_1".to_owned(),
                    cursor: Cursor::New,
                    delivered: vec!["2-0".to_owned()],
                },
                Call::Ack {
                    id: "2-0".to_owned(),
                    acked: 1,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_backlog_falls_through_to_latest() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "7")]));
        let handler = RecordingHandler::default();
        let reader = StreamReader::new(&client, STREAM, GROUP);

        let report = reader
            .try_read("consumer_1", &handler, true)
            .await
            .expect("cycle failed");

        assert!(report.backlog.is_empty());
        assert_eq!(report.latest, vec!["1-0"]);
        assert_eq!(
            client.reads_for("consumer_1"),
            vec![
                (Cursor::Pending, Vec::<String>::new()),
                (Cursor::New, vec!["1-0".to_owned()])
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_backlog_handler_stops_the_cycle() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "1")]));
        deliver_without_ack(&client, "consumer_1").await;
        client.add(STREAM, payload(&[("order_id", "2")]));
        let handler = RecordingHandler::failing_on("1");
        let reader = StreamReader::new(&client, STREAM, GROUP);

        let result = reader.try_read("consumer_1", &handler, true).await;

        assert!(matches!(result, Err(ConsumerError::Handler { ref id, .. }) if id == "1-0"));
        assert!(client.acks().is_empty());
        // The new entry was never claimed.
        assert_eq!(client.pending(STREAM, GROUP, "consumer_1"), vec!["1-0"]);
    }

    #[tokio::test]
    async fn test_read_failure_is_reported() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "1")]));
        client.fail_reads_for("consumer_1");
        let handler = RecordingHandler::default();
        let reader = StreamReader::new(&client, STREAM, GROUP);

        assert!(!reader.read("consumer_1", &handler, false).await);
        assert!(matches!(
            reader.try_read("consumer_1", &handler, false).await,
            Err(ConsumerError::Read {
                cursor: Cursor::New,
                ..
            })
        ));
        assert!(handler.seen().is_empty());
    }

    #[tokio::test]
    async fn test_missing_group_fails_gracefully() {
        let client = MemoryStreamClient::new();
        let handler = RecordingHandler::default();
        let reader = StreamReader::new(&client, STREAM, GROUP);

        assert!(!reader.read("consumer_1", &handler, true).await);
    }

    #[tokio::test]
    async fn test_ack_failure_is_reported_after_handler_ran() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "1")]));
        client.fail_acks();
        let handler = RecordingHandler::default();
        let reader = StreamReader::new(&client, STREAM, GROUP);

        let result = reader.try_read("consumer_1", &handler, false).await;

        assert!(matches!(result, Err(ConsumerError::Ack { ref id, .. }) if id == "1-0"));
        assert_eq!(handler.seen().len(), 1);
        assert_eq!(client.pending(STREAM, GROUP, "consumer_1"), vec!["1-0"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_leaves_message_pending() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "1")]));
        async fn handler(_: Payload) -> anyhow::Result<()> {
            panic!("malformed order")
        }
        let reader = StreamReader::new(&client, STREAM, GROUP);

        let result = reader.try_read("consumer_1", &handler, false).await;

        assert!(matches!(
            result,
            Err(ConsumerError::Handler { ref id, ref error })
                if id == "1-0" && error.to_string().contains("malformed order")
        ));
        assert!(client.acks().is_empty());
        assert_eq!(client.pending(STREAM, GROUP, "consumer_1"), vec!["1-0"]);
        assert!(!reader.read("consumer_1", &handler, true).await);
    }

    /// Acknowledges the first entry itself, so the reader's own ack finds nothing.
    struct AckingHandler<'a> {
        client: &'a MemoryStreamClient,
    }

    #[async_trait]
    impl Handler for AckingHandler<'_> {
        async fn handle(&self, _: Payload) -> anyhow::Result<()> {
            self.client.ack(STREAM, GROUP, "1-0").await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_already_acknowledged_message_completes_the_cycle() {
        let client = client_with_group().await;
        client.add(STREAM, payload(&[("order_id", "1")]));
        let handler = AckingHandler { client: &client };
        let reader = StreamReader::new(&client, STREAM, GROUP);

        assert!(reader.read("consumer_1", &handler, false).await);

        let acked: Vec<i64> = client
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Ack { acked, .. } => Some(acked),
                _ => None,
            })
            .collect();
        assert_eq!(acked, vec![1, 0]);
        assert!(client.pending(STREAM, GROUP, "consumer_1").is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_reads_several_messages() {
        let client = client_with_group().await;
        for order_id in ["1", "2", "3"] {
            client.add(STREAM, payload(&[("order_id", order_id)]));
        }
        let handler = RecordingHandler::failing_on("2");
        let reader = StreamReader::new(&client, STREAM, GROUP).batch_size(3);

        assert!(!reader.read("consumer_1", &handler, false).await);

        // Entries after the failed one stay pending without being handled.
        assert_eq!(handler.seen().len(), 2);
        assert_eq!(client.acks(), vec!["1-0"]);
        assert_eq!(
            client.pending(STREAM, GROUP, "consumer_1"),
            vec!["2-0", "3-0"]
        );
    }

    #[test]
    fn test_batch_size_is_at_least_one() {
        let client = MemoryStreamClient::new();
        let reader = StreamReader::new(&client, STREAM, GROUP).batch_size(0);

        assert_eq!(reader.batch_size, 1);
    }
}
