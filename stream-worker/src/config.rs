use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    /// Per-command timeout on the redis connection.
    #[envconfig(default = "1000")]
    pub redis_timeout: EnvMsDuration,

    pub stream_name: NonEmptyString,

    #[envconfig(default = "3")]
    pub consumer_count: usize,

    #[envconfig(default = "5000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "0")]
    pub poll_jitter: EnvMsDuration,

    pub max_rounds: Option<u64>,

    /// Replay each consumer's pending entries before reading new ones, every round.
    #[envconfig(default = "false")]
    pub check_backlog: bool,

    #[envconfig(default = "1")]
    pub batch_size: usize,

    /// Create the stream when creating the consumer group if it does not exist.
    #[envconfig(default = "true")]
    pub mkstream: bool,

    /// Abort startup when the consumer group cannot be created for a reason other than
    /// already existing.
    #[envconfig(default = "false")]
    pub strict_group_creation: bool,

    /// POST every message to this URL. Messages are only logged when unset.
    pub webhook_url: Option<url::Url>,

    #[envconfig(default = "5000")]
    pub webhook_timeout: EnvMsDuration,

    /// Also write logs to this file. Its directory is created if missing.
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Longest expected gap between two liveness reports of the orchestrator.
    ///
    /// Each round reads once per cursor, then handles and acknowledges up to
    /// `batch_size` messages per cursor one after another, before pausing for the
    /// poll interval and jitter.
    pub fn liveness_deadline(&self) -> time::Duration {
        let cursors: u32 = if self.check_backlog { 2 } else { 1 };
        let messages = u32::try_from(self.batch_size.max(1))
            .unwrap_or(u32::MAX)
            .saturating_mul(cursors);
        let commands = cursors.saturating_add(messages);

        self.poll_interval.0
            + self.poll_jitter.0
            + self.webhook_timeout.0.saturating_mul(messages)
            + self.redis_timeout.0.saturating_mul(commands)
            + time::Duration::from_secs(30)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
