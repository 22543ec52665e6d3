//! Pacing of the exchange lifecycle.
//!
//! The coordinator never sleeps for a hard-coded time. It asks a
//! [`DelayStrategy`] how long to wait before each follow-up write, so the
//! interactive binary can use human-feeling pauses while tests run the whole
//! lifecycle with [`FixedDelays::zero`].

use std::time::Duration;

use rand::Rng;

/// Supplies the waits between lifecycle writes.
pub trait DelayStrategy: Send + Sync + 'static {
    /// Pause between creating the user message and marking it `sent`.
    fn ack_delay(&self) -> Duration;

    /// Pause between creating the assistant message and marking it
    /// `completed`.
    fn think_time(&self) -> Duration;
}

/// Randomized delays that mimic a responsive assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDelays {
    /// Fixed acknowledgement delay.
    pub ack: Duration,
    /// Minimum think time.
    pub think_min: Duration,
    /// Upper bound of the uniform jitter added to `think_min`.
    pub think_jitter: Duration,
}

impl Default for SimulatedDelays {
    fn default() -> Self {
        Self {
            ack: Duration::from_millis(300),
            think_min: Duration::from_millis(1500),
            think_jitter: Duration::from_millis(1000),
        }
    }
}

impl DelayStrategy for SimulatedDelays {
    fn ack_delay(&self) -> Duration {
        self.ack
    }

    fn think_time(&self) -> Duration {
        if self.think_jitter.is_zero() {
            return self.think_min;
        }
        let jitter = rand::rng().random_range(Duration::ZERO..self.think_jitter);
        self.think_min + jitter
    }
}

/// Constant delays, for tests and scripted runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelays {
    /// Returned by [`DelayStrategy::ack_delay`].
    pub ack: Duration,
    /// Returned by [`DelayStrategy::think_time`].
    pub think: Duration,
}

impl FixedDelays {
    /// No waiting at all.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            ack: Duration::ZERO,
            think: Duration::ZERO,
        }
    }
}

impl DelayStrategy for FixedDelays {
    fn ack_delay(&self) -> Duration {
        self.ack
    }

    fn think_time(&self) -> Duration {
        self.think
    }
}
