//! Routing Test Utilities
//!
//! Mock infrastructure for exercising the router without real providers:
//! a scriptable [`MockProvider`], in-memory audit and metrics sinks, and a
//! standard three-provider fleet.
//!
//! # Usage
//!
//! ```ignore
//! use airouter_core::routing::test_utils::MockFleet;
//!
//! let fleet = MockFleet::standard();
//! fleet.sage.fail_with(ProviderErrorKind::Unavailable);
//!
//! // After the test, verify which providers were called
//! assert_eq!(fleet.atlas.calls(), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::provider::{
    ProviderAdapter, ProviderError, ProviderErrorKind, ProviderIdentity, ProviderRegistry,
    ProviderReply, ProviderRole,
};
use crate::request::{Request, RoutePath};
use crate::sinks::{AuditEvent, AuditEventType, AuditSink, MetricsSink};
use crate::routing::metrics::MetricsReport;

// ============================================================================
// Mock Provider
// ============================================================================

/// Captured call for test verification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockCall {
    /// Request ID
    pub request_id: String,
    /// Path used
    pub path: RoutePath,
    /// Timeout handed to the adapter
    pub timeout: Duration,
}

#[derive(Debug, Default)]
struct MockBehaviour {
    /// Failure applied to every call on every path
    failure: Option<ProviderErrorKind>,
    /// Failure applied to one path only
    path_failure: HashMap<RoutePath, ProviderErrorKind>,
    /// One-shot outcomes consumed before the steady behaviour
    script: VecDeque<Result<(), ProviderErrorKind>>,
    /// Simulated latency
    latency: Duration,
    cost_usd: Option<f64>,
}

/// Scriptable provider adapter
#[derive(Debug)]
pub struct MockProvider {
    id: String,
    behaviour: Mutex<MockBehaviour>,
    history: Mutex<Vec<MockCall>>,
    probes: AtomicU64,
}

impl MockProvider {
    /// Create a healthy, instant provider
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            behaviour: Mutex::new(MockBehaviour::default()),
            history: Mutex::new(Vec::new()),
            probes: AtomicU64::new(0),
        }
    }

    /// Provider ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fail every call with `kind`
    pub fn fail_with(&self, kind: ProviderErrorKind) {
        self.behaviour.lock().failure = Some(kind);
    }

    /// Fail calls on one path with `kind`
    pub fn fail_path(&self, path: RoutePath, kind: ProviderErrorKind) {
        self.behaviour.lock().path_failure.insert(path, kind);
    }

    /// Clear all failures and scripts
    pub fn heal(&self) {
        let mut b = self.behaviour.lock();
        b.failure = None;
        b.path_failure.clear();
        b.script.clear();
    }

    /// Queue one-shot outcomes, consumed in order
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), ProviderErrorKind>>) {
        self.behaviour.lock().script.extend(outcomes);
    }

    /// Simulated latency per call
    pub fn set_latency(&self, latency: Duration) {
        self.behaviour.lock().latency = latency;
    }

    /// Cost reported on success
    pub fn set_cost(&self, cost_usd: f64) {
        self.behaviour.lock().cost_usd = Some(cost_usd);
    }

    /// Calls received (probes excluded)
    pub fn calls(&self) -> usize {
        self.history.lock().len()
    }

    /// Calls received on one path
    pub fn calls_on(&self, path: RoutePath) -> usize {
        self.history.lock().iter().filter(|c| c.path == path).count()
    }

    /// Full call history
    pub fn history(&self) -> Vec<MockCall> {
        self.history.lock().clone()
    }

    /// Health probes received
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Resolve the outcome of the next call
    fn next_outcome(&self, path: RoutePath) -> (Duration, Option<f64>, Result<(), ProviderErrorKind>) {
        let mut b = self.behaviour.lock();
        let outcome = if let Some(scripted) = b.script.pop_front() {
            scripted
        } else if let Some(kind) = b.failure {
            Err(kind)
        } else if let Some(kind) = b.path_failure.get(&path) {
            Err(*kind)
        } else {
            Ok(())
        };
        (b.latency, b.cost_usd, outcome)
    }

    async fn simulate(&self, path: RoutePath) -> Result<Option<f64>, ProviderError> {
        let (latency, cost, outcome) = self.next_outcome(path);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match outcome {
            Ok(()) => Ok(cost),
            Err(kind) => Err(ProviderError::new(
                kind,
                format!("{} simulated {kind} on {path}", self.id),
            )),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    async fn execute(
        &self,
        request: &Request,
        path: RoutePath,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        self.history.lock().push(MockCall {
            request_id: request.id.clone(),
            path,
            timeout,
        });

        let cost = self.simulate(path).await?;
        Ok(ProviderReply {
            content: format!("{} answered {}", self.id, request.id),
            cost_usd: cost,
        })
    }

    async fn probe(&self, path: RoutePath, _timeout: Duration) -> Result<(), ProviderError> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        self.simulate(path).await.map(|_| ())
    }
}

// ============================================================================
// Standard Fleet
// ============================================================================

/// Three providers, one per role, registered in a fixed order
///
/// - `atlas`: orchestrator specialist
/// - `sage`: user-task specialist
/// - `echo`: audience specialist
#[derive(Debug, Clone)]
pub struct MockFleet {
    pub atlas: Arc<MockProvider>,
    pub sage: Arc<MockProvider>,
    pub echo: Arc<MockProvider>,
}

impl MockFleet {
    /// Create the standard fleet
    pub fn standard() -> Self {
        Self {
            atlas: Arc::new(MockProvider::new("atlas")),
            sage: Arc::new(MockProvider::new("sage")),
            echo: Arc::new(MockProvider::new("echo")),
        }
    }

    /// Registry containing the fleet
    pub fn registry(&self) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderIdentity::new("atlas", ProviderRole::OrchestratorSpecialist).with_cost(0.03),
            self.atlas.clone(),
        );
        registry.register(
            ProviderIdentity::new("sage", ProviderRole::UserTaskSpecialist).with_cost(0.01),
            self.sage.clone(),
        );
        registry.register(
            ProviderIdentity::new("echo", ProviderRole::AudienceSpecialist).with_cost(0.02),
            self.echo.clone(),
        );
        registry
    }

    /// Every provider, in registration order
    pub fn all(&self) -> [&Arc<MockProvider>; 3] {
        [&self.atlas, &self.sage, &self.echo]
    }

    /// Total calls across the fleet
    pub fn total_calls(&self) -> usize {
        self.all().iter().map(|p| p.calls()).sum()
    }
}

/// Registry with the standard fleet
pub fn three_provider_registry() -> ProviderRegistry {
    MockFleet::standard().registry()
}

// ============================================================================
// Sinks
// ============================================================================

/// Audit sink that keeps every event
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events, in emission order
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of one type
    pub fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Number of events of one type
    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Metrics sink that keeps every report
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    reports: Mutex<Vec<MetricsReport>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<MetricsReport> {
        self.reports.lock().clone()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn publish(&self, report: MetricsReport) {
        self.reports.lock().push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_script_then_steady() {
        let provider = MockProvider::new("atlas");
        provider.script([Err(ProviderErrorKind::Timeout), Ok(())]);
        provider.fail_with(ProviderErrorKind::Unavailable);

        let request = Request::new("x");
        let timeout = Duration::from_secs(1);

        let first = provider.execute(&request, RoutePath::Direct, timeout).await;
        assert_eq!(first.unwrap_err().kind, ProviderErrorKind::Timeout);
        assert!(provider.execute(&request, RoutePath::Direct, timeout).await.is_ok());
        let third = provider.execute(&request, RoutePath::Direct, timeout).await;
        assert_eq!(third.unwrap_err().kind, ProviderErrorKind::Unavailable);

        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_path_failure_and_probes() {
        let provider = MockProvider::new("sage");
        provider.fail_path(RoutePath::Brokered, ProviderErrorKind::RateLimited);

        assert!(provider.probe(RoutePath::Direct, Duration::from_secs(1)).await.is_ok());
        assert!(provider.probe(RoutePath::Brokered, Duration::from_secs(1)).await.is_err());
        assert_eq!(provider.probes(), 2);
        assert_eq!(provider.calls(), 0);

        provider.heal();
        assert!(provider.probe(RoutePath::Brokered, Duration::from_secs(1)).await.is_ok());
    }

    #[test]
    fn test_memory_audit_sink() {
        let sink = MemoryAuditSink::new();
        sink.emit(AuditEvent::new(AuditEventType::RuleSwapped, serde_json::Value::Null));
        sink.emit(AuditEvent::new(AuditEventType::SloErosion, serde_json::Value::Null));

        assert_eq!(sink.count(AuditEventType::RuleSwapped), 1);
        assert_eq!(sink.events().len(), 2);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
