//! Values the engine consumes. Where they come from is the binary's business.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What to do with the correlation id carried by a duplicate creation delivery
/// for a request that is already correlated.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationPolicy {
    /// Keep the first correlation id ever assigned.
    #[default]
    PreserveFirst,
    /// Replace the stored id with the one just delivered.
    OverwriteLatest,
}

impl CorrelationPolicy {
    /// Configuration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PreserveFirst => "preserve",
            Self::OverwriteLatest => "overwrite",
        }
    }
}

impl fmt::Display for CorrelationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrelationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preserve" | "preserve_first" => Ok(Self::PreserveFirst),
            "overwrite" | "overwrite_latest" => Ok(Self::OverwriteLatest),
            other => Err(format!("unknown correlation policy: {other}")),
        }
    }
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailSafeConfig {
    /// Topic carrying "status change requested" messages. Deferred events are
    /// republished here.
    pub status_change_topic: String,
    /// Topic carrying "request created or retried" messages.
    pub new_request_topic: String,
    /// Spacing between replayed events: the event at ordinal `n` is delayed by
    /// `n * replay_interval`.
    pub replay_interval: Duration,
    /// Duplicate creation handling.
    pub correlation_policy: CorrelationPolicy,
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            status_change_topic: "failsafe-requests-change-status".to_string(),
            new_request_topic: "failsafe-requests".to_string(),
            replay_interval: Duration::from_secs(5),
            correlation_policy: CorrelationPolicy::PreserveFirst,
        }
    }
}

impl FailSafeConfig {
    /// Set the status-change topic.
    #[must_use]
    pub fn with_status_change_topic(mut self, topic: impl Into<String>) -> Self {
        self.status_change_topic = topic.into();
        self
    }

    /// Set the creation topic.
    #[must_use]
    pub fn with_new_request_topic(mut self, topic: impl Into<String>) -> Self {
        self.new_request_topic = topic.into();
        self
    }

    /// Set the replay spacing.
    #[must_use]
    pub const fn with_replay_interval(mut self, interval: Duration) -> Self {
        self.replay_interval = interval;
        self
    }

    /// Set the duplicate-creation policy.
    #[must_use]
    pub const fn with_correlation_policy(mut self, policy: CorrelationPolicy) -> Self {
        self.correlation_policy = policy;
        self
    }
}
