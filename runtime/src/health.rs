//! Component health for queues, workers, and the change stream.
//!
//! A [`HealthReport`] is a snapshot. Its overall status is the worst status
//! among its checks, so one unhealthy queue makes the pipeline unhealthy.

use chrono::{DateTime, Utc};
use orderflow_core::environment::Clock;
use std::collections::BTreeMap;
use std::fmt;

/// Health of one component, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Operating, but something needs an operator (dead letters, lag).
    Degraded,
    /// Not keeping up or not reachable.
    Unhealthy,
}

impl HealthStatus {
    /// `true` for [`HealthStatus::Healthy`].
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// `true` for [`HealthStatus::Degraded`].
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// `true` for [`HealthStatus::Unhealthy`].
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking one named component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Queue name, or the change handler's name.
    pub component: String,
    /// Status of the component.
    pub status: HealthStatus,
    /// Why the component is not healthy.
    pub detail: Option<String>,
    /// Gauges captured with the check, e.g. `depth` or `lag`.
    pub metadata: BTreeMap<String, String>,
}

impl HealthCheck {
    fn with_status(
        component: impl Into<String>,
        status: HealthStatus,
        detail: Option<String>,
    ) -> Self {
        Self {
            component: component.into(),
            status,
            detail,
            metadata: BTreeMap::new(),
        }
    }

    /// A healthy component.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, None)
    }

    /// A degraded component and the reason.
    #[must_use]
    pub fn degraded(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, Some(detail.into()))
    }

    /// An unhealthy component and the reason.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, Some(detail.into()))
    }

    /// Attaches a gauge. A repeated key overwrites the earlier value.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Health of the whole pipeline at one instant.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status among `checks`; healthy when there are none.
    pub status: HealthStatus,
    /// One entry per component, in the order they were checked.
    pub checks: Vec<HealthCheck>,
    /// When the snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Builds a report stamped with the current wall-clock time.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        Self::at(checks, Utc::now())
    }

    /// Builds a report stamped by `clock`.
    #[must_use]
    pub fn with_clock(checks: Vec<HealthCheck>, clock: &dyn Clock) -> Self {
        Self::at(checks, clock.now())
    }

    fn at(checks: Vec<HealthCheck>, checked_at: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            checks,
            checked_at,
        }
    }

    /// `true` when every component is healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// The check for `component`, if it was part of the report.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }

    /// Components in the given status.
    pub fn components_in(&self, status: HealthStatus) -> impl Iterator<Item = &str> {
        self.checks
            .iter()
            .filter(move |c| c.status == status)
            .map(|c| c.component.as_str())
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pipeline {} at {}", self.status, self.checked_at.to_rfc3339())?;
        for check in &self.checks {
            write!(f, "  {:<14} {}", check.component, check.status)?;
            for (key, value) in &check.metadata {
                write!(f, " {key}={value}")?;
            }
            if let Some(detail) = &check.detail {
                write!(f, " ({detail})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
