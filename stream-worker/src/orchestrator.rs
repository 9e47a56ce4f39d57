use std::time::{self, Instant};

use futures::future::join_all;
use stream_common::health::HealthHandle;
use stream_common::metrics::ROUND_DURATION;
use stream_common::stream::{StreamClient, StreamError};
use tracing::{error, info, warn};

use crate::error::OrchestratorError;
use crate::handler::Handler;
use crate::policy::PollPolicy;
use crate::reader::StreamReader;

/// Groups are created at the start of the stream, so entries added before the first
/// start are delivered too.
const GROUP_START_ID: &str = "0";

pub const DEFAULT_POLL_INTERVAL: time::Duration = time::Duration::from_secs(5);

/// The consumer group used for a stream.
pub fn group_name(stream: &str) -> String {
    format!("{}_consumers", stream)
}

/// Names for `count` consumers: `consumer_1` to `consumer_{count}`.
pub fn consumer_names(count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("consumer_{}", n)).collect()
}

/// Outcome of trying to create the consumer group at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
    Failed(String),
}

/// Whether a `GroupCreation::Failed` outcome stops the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupCreationPolicy {
    /// Log the failure and start polling anyway. Reads fail until the group exists.
    #[default]
    Tolerant,
    Strict,
}

/// Per-consumer outcome of one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub round: u64,
    pub results: Vec<(String, bool)>,
}

impl RoundReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, ok)| *ok).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Drives a fixed set of consumers against one stream and consumer group.
///
/// Every round runs one read cycle per consumer concurrently on the current task, waits
/// for all of them, then pauses according to the poll policy. A failing consumer never
/// affects its siblings or later rounds.
pub struct GroupOrchestrator<C, H> {
    client: C,
    handler: H,
    stream: String,
    group: String,
    consumers: Vec<String>,
    poll_policy: PollPolicy,
    check_backlog: bool,
    batch_size: usize,
    group_creation_policy: GroupCreationPolicy,
    liveness: Option<HealthHandle>,
}

impl<C: StreamClient, H: Handler> GroupOrchestrator<C, H> {
    pub fn new(client: C, stream: &str, consumer_count: usize, handler: H) -> Self {
        Self {
            client,
            handler,
            stream: stream.to_owned(),
            group: group_name(stream),
            consumers: consumer_names(consumer_count),
            poll_policy: PollPolicy::build(DEFAULT_POLL_INTERVAL).provide(),
            check_backlog: false,
            batch_size: 1,
            group_creation_policy: GroupCreationPolicy::default(),
            liveness: None,
        }
    }

    pub fn poll_policy(mut self, poll_policy: PollPolicy) -> Self {
        self.poll_policy = poll_policy;
        self
    }

    /// Replay pending entries before reading new ones in every cycle.
    pub fn check_backlog(mut self, check_backlog: bool) -> Self {
        self.check_backlog = check_backlog;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn group_creation_policy(mut self, policy: GroupCreationPolicy) -> Self {
        self.group_creation_policy = policy;
        self
    }

    /// Report healthy on `liveness` after every round.
    pub fn liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumers(&self) -> &[String] {
        &self.consumers
    }

    /// Create the consumer group if it does not exist yet. Safe to call repeatedly.
    pub async fn bootstrap(&self) -> Result<GroupCreation, OrchestratorError> {
        info!(stream = %self.stream, group = %self.group, "creating consumer group");

        let outcome = match self
            .client
            .create_group(&self.stream, &self.group, GROUP_START_ID)
            .await
        {
            Ok(()) => GroupCreation::Created,
            Err(StreamError::GroupExists) => GroupCreation::AlreadyExists,
            Err(err) => GroupCreation::Failed(err.to_string()),
        };

        match &outcome {
            GroupCreation::Created => info!(group = %self.group, "created consumer group"),
            GroupCreation::AlreadyExists => {
                info!(group = %self.group, "consumer group already exists, proceeding")
            }
            GroupCreation::Failed(reason) => match self.group_creation_policy {
                GroupCreationPolicy::Strict => {
                    error!(group = %self.group, "failed to create consumer group: {}", reason);
                    return Err(OrchestratorError::GroupCreation {
                        group: self.group.clone(),
                        reason: reason.clone(),
                    });
                }
                GroupCreationPolicy::Tolerant => warn!(
                    group = %self.group,
                    "failed to create consumer group, proceeding: {}", reason
                ),
            },
        }

        Ok(outcome)
    }

    /// Run one read cycle for every consumer and wait for all of them to finish.
    pub async fn run_round(&self, round: u64) -> RoundReport {
        let reader = StreamReader::new(&self.client, &self.stream, &self.group)
            .batch_size(self.batch_size);

        info!(round, consumers = self.consumers.len(), "starting round");
        let start = Instant::now();

        let results = join_all(
            self.consumers
                .iter()
                .map(|consumer| reader.read(consumer, &self.handler, self.check_backlog)),
        )
        .await;

        metrics::histogram!(ROUND_DURATION, &[("stream", self.stream.clone())])
            .record(start.elapsed().as_secs_f64());

        let report = RoundReport {
            round,
            results: self.consumers.iter().cloned().zip(results).collect(),
        };
        info!(
            round,
            succeeded = report.succeeded(),
            failed = report.failed(),
            results = ?report.results,
            "finished round"
        );

        report
    }

    /// Bootstrap the group, then poll until the policy's round limit is reached.
    ///
    /// Without a round limit this only returns on a bootstrap error; stop it by dropping
    /// the future, which takes effect at the next suspension point.
    pub async fn run(&self) -> Result<u64, OrchestratorError> {
        if self.consumers.is_empty() {
            return Err(OrchestratorError::NoConsumers);
        }

        self.bootstrap().await?;
        info!(consumers = ?self.consumers, "created consumers");

        let mut completed = 0;
        while self.poll_policy.should_continue(completed) {
            completed += 1;
            self.run_round(completed).await;

            if let Some(liveness) = &self.liveness {
                liveness.report_healthy().await;
            }

            if !self.poll_policy.should_continue(completed) {
                break;
            }
            tokio::time::sleep(self.poll_policy.delay()).await;
        }

        info!(rounds = completed, "stopped polling");
        Ok(completed)
    }
}

/// Start `consumer_count` consumers on `stream`, polling every `poll_interval`.
///
/// Runs until the returned future is dropped.
pub async fn start_consumer<C, H>(
    client: C,
    stream: &str,
    consumer_count: usize,
    handler: H,
    poll_interval: time::Duration,
) -> Result<u64, OrchestratorError>
where
    C: StreamClient,
    H: Handler,
{
    GroupOrchestrator::new(client, stream, consumer_count, handler)
        .poll_policy(PollPolicy::build(poll_interval).provide())
        .run()
        .await
}
