use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of automatic outcomes tolerated before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryBudget {
    /// Never give up
    Unlimited,
    /// Give up once this many units have been consumed
    Limited(u32),
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::Unlimited
    }
}

impl RetryBudget {
    /// Consume one unit. Returns `false` when the budget is already exhausted.
    pub fn try_consume(&mut self) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(0) => false,
            Self::Limited(remaining) => {
                *remaining -= 1;
                true
            }
        }
    }

    /// Units left, `None` when unlimited
    pub fn remaining(&self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Limited(remaining) => Some(*remaining),
        }
    }
}

impl From<Option<u32>> for RetryBudget {
    fn from(value: Option<u32>) -> Self {
        value.map_or(Self::Unlimited, Self::Limited)
    }
}

/// Parameters of a `connect()` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// How long one attempt may stay pending; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Timeouts tolerated before `GiveUp`
    pub timeout_retries: RetryBudget,
    /// Disconnects tolerated before `GiveUp`
    pub disconnect_retries: RetryBudget,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Limit the number of timeouts tolerated
    pub fn with_timeout_retries(mut self, retries: u32) -> Self {
        self.timeout_retries = RetryBudget::Limited(retries);
        self
    }

    /// Limit the number of disconnects tolerated
    pub fn with_disconnect_retries(mut self, retries: u32) -> Self {
        self.disconnect_retries = RetryBudget::Limited(retries);
        self
    }
}
