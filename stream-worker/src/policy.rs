use std::time;

use rand::Rng;

/// How often the orchestrator starts a round, and for how long it keeps going.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Fixed delay between the end of a round and the start of the next one.
    interval: time::Duration,
    /// Upper bound of a random delay added to `interval`, to spread out workers.
    jitter: time::Duration,
    /// Stop after this many rounds. Unbounded when `None`.
    max_rounds: Option<u64>,
}

impl PollPolicy {
    pub fn build(interval: time::Duration) -> PollPolicyBuilder {
        PollPolicyBuilder::new(interval)
    }

    pub fn interval(&self) -> time::Duration {
        self.interval
    }

    pub fn max_rounds(&self) -> Option<u64> {
        self.max_rounds
    }

    /// Whether another round should start after `completed` rounds.
    pub fn should_continue(&self, completed: u64) -> bool {
        self.max_rounds.map_or(true, |max| completed < max)
    }

    /// The pause before the next round.
    pub fn delay(&self) -> time::Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }

        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.interval + time::Duration::from_millis(jitter_ms)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicyBuilder::new(time::Duration::from_secs(5)).provide()
    }
}

pub struct PollPolicyBuilder {
    interval: time::Duration,
    jitter: time::Duration,
    max_rounds: Option<u64>,
}

impl PollPolicyBuilder {
    pub fn new(interval: time::Duration) -> Self {
        Self {
            interval,
            jitter: time::Duration::ZERO,
            max_rounds: None,
        }
    }

    pub fn jitter(mut self, jitter: time::Duration) -> PollPolicyBuilder {
        self.jitter = jitter;
        self
    }

    pub fn max_rounds(mut self, max_rounds: u64) -> PollPolicyBuilder {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn provide(&self) -> PollPolicy {
        PollPolicy {
            interval: self.interval,
            jitter: self.jitter,
            max_rounds: self.max_rounds,
        }
    }
}
