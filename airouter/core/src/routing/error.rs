//! Routing error taxonomy

use thiserror::Error;

use crate::request::RoutePath;
use crate::routing::classifier::TaskClass;

/// Errors produced inside the routing subsystem
///
/// Only [`RoutingError::AllProvidersExhausted`] ever reaches callers. The
/// other variants are handled locally (advance to the next candidate, skip
/// an optimizer cycle, revert a rule) and recorded in audit and logs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    /// Circuit open for this provider/path
    #[error("provider {provider} unavailable on {path} path")]
    ProviderUnavailable { provider: String, path: RoutePath },

    /// Attempt exceeded its budget
    #[error("provider {provider} timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    /// Compliance gate or provider refused the request
    #[error("provider {provider} blocked by compliance")]
    ComplianceBlocked { provider: String },

    /// No eligible provider could serve the request
    #[error("no eligible provider could serve request {request_id}")]
    AllProvidersExhausted { request_id: String },

    /// Optimizer lacks data for this cycle
    #[error("insufficient telemetry: {have} samples, need {need}")]
    InsufficientTelemetry { have: usize, need: usize },

    /// Applied rule change made things worse
    #[error("regression detected for {task_class}: {metric} worse by {regression_pct:.1}%")]
    RegressionDetected {
        task_class: TaskClass,
        metric: String,
        regression_pct: f64,
    },
}

impl RoutingError {
    /// Whether this error may be shown to the caller
    #[must_use]
    pub fn is_caller_visible(&self) -> bool {
        matches!(self, Self::AllProvidersExhausted { .. })
    }
}

/// Result type for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exhaustion_is_caller_visible() {
        let exhausted = RoutingError::AllProvidersExhausted {
            request_id: "req-1".into(),
        };
        assert!(exhausted.is_caller_visible());
        assert_eq!(
            exhausted.to_string(),
            "no eligible provider could serve request req-1"
        );

        let timeout = RoutingError::ProviderTimeout {
            provider: "atlas".into(),
            timeout_ms: 5000,
        };
        assert!(!timeout.is_caller_visible());
    }
}
