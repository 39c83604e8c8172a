//! Readiness of the engine's collaborators.
//!
//! A report is `Degraded` when the operator switched processing off: inbound
//! creation deliveries are parked for redelivery but the service still takes
//! traffic. It is `Unhealthy` when a store cannot be read.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Ordered from best to worst, so the overall status is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Working normally.
    Healthy,
    /// Serving, but an operator should look (processing disabled).
    Degraded,
    /// A collaborator is unreachable.
    Unhealthy,
}

/// One component's status.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Component name (`processing`, `registry`, `pending_store`).
    pub component: &'static str,
    /// Its status.
    pub status: HealthStatus,
    /// Why it is not healthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Figures worth showing next to the status, such as the backlog size.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<&'static str, String>,
}

impl HealthCheck {
    fn with_status(component: &'static str, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component,
            status,
            message,
            details: BTreeMap::new(),
        }
    }

    /// The component works.
    #[must_use]
    pub fn healthy(component: &'static str) -> Self {
        Self::with_status(component, HealthStatus::Healthy, None)
    }

    /// The component works but needs attention.
    #[must_use]
    pub fn degraded(component: &'static str, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, Some(message.into()))
    }

    /// The component is down.
    #[must_use]
    pub fn unhealthy(component: &'static str, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a detail.
    #[must_use]
    pub fn with_detail(mut self, key: &'static str, value: impl ToString) -> Self {
        self.details.insert(key, value.to_string());
        self
    }
}

/// Every check plus the overall verdict.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status among `checks`.
    pub status: HealthStatus,
    /// Per-component results.
    pub checks: Vec<HealthCheck>,
    /// When the report was taken.
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Combine checks into a report.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            timestamp: Utc::now(),
        }
    }

    /// Whether the service should receive traffic (healthy or degraded).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_healthy() {
        assert_eq!(HealthReport::new(Vec::new()).status, HealthStatus::Healthy);
    }

    #[test]
    fn degraded_report_is_still_ready() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("registry").with_detail("max_id", 4),
            HealthCheck::degraded("processing", "disabled by operator"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_ready());
        assert_eq!(report.checks[0].details.get("max_id").map(String::as_str), Some("4"));

        let report = HealthReport::new(vec![
            HealthCheck::degraded("processing", "disabled by operator"),
            HealthCheck::unhealthy("pending_store", "down"),
        ]);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.is_ready());
    }
}
