//! AI Router
//!
//! The request-path entry point. One call to [`AiRouter::route`] is one
//! logical request flow:
//!
//! ```text
//! classify -> order candidates -> for each candidate (strictly sequential):
//!     choose path + claim circuit -> execute with hard timeout
//!     -> record breaker + telemetry -> success? done : next candidate
//! chain exhausted -> AllProvidersExhausted
//! ```
//!
//! Fallback attempts are never issued in parallel, so one logical request
//! produces at most one billable call at a time. The only suspension point
//! is the provider call itself.
//!
//! # Cancellation
//!
//! [`AiRouter::route_until`] races the flow against a caller-supplied
//! cancellation future. Dropping the flow drops the in-flight provider call;
//! an attempt guard records the attempt as cancelled (with the latency
//! observed so far) and hands back any half-open trial it held.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::provider::{ProviderErrorKind, ProviderRegistry};
use crate::request::{ErrorKind, Request, Response, RoutePath};
use crate::routing::circuit::CircuitBreakerRegistry;
use crate::routing::classifier::{TaskClass, TaskClassifier};
use crate::routing::error::{RoutingError, RoutingResult};
use crate::routing::hybrid::{FeatureToggles, HybridRouter};
use crate::routing::metrics::RouterMetrics;
use crate::routing::policy::{CandidateChain, Exclusion, ExclusionReason, ProviderOrderingPolicy};
use crate::routing::rules::RuleStore;
use crate::routing::telemetry::{
    LatencySample, LatencyTelemetry, OperationClass, RequestRecord, SampleOutcome,
};
use crate::sinks::{AuditEvent, AuditEventType, AuditSink};

// ============================================================================
// Shared State
// ============================================================================

/// Shared registries every flow and control loop works against
///
/// Request flows, the health monitor and the optimizer never call each
/// other; they only meet here.
#[derive(Clone)]
pub struct RouterState {
    pub registry: Arc<ProviderRegistry>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub telemetry: Arc<LatencyTelemetry>,
    pub rules: Arc<RuleStore>,
    pub hybrid: Arc<HybridRouter>,
    pub policy: Arc<ProviderOrderingPolicy>,
    pub toggles: Arc<FeatureToggles>,
    pub metrics: Arc<RouterMetrics>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterState")
            .field("registry", &self.registry)
            .field("circuits", &self.circuits)
            .field("rules", &self.rules)
            .field("toggles", &self.toggles)
            .finish()
    }
}

// ============================================================================
// Attempt Tracking
// ============================================================================

/// How one attempt ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Timeout,
    /// No path of the provider admitted traffic at attempt time
    CircuitRejected,
}

/// One entry of a request's attempt log
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<RoutePath>,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ProviderErrorKind>,
    pub latency_ms: u64,
}

/// Records a cancelled sample if the attempt is dropped mid-flight
struct AttemptGuard<'a> {
    state: &'a RouterState,
    provider: &'a str,
    path: RoutePath,
    operation_class: OperationClass,
    started: Instant,
    armed: bool,
}

impl<'a> AttemptGuard<'a> {
    fn arm(
        state: &'a RouterState,
        provider: &'a str,
        path: RoutePath,
        operation_class: OperationClass,
    ) -> Self {
        Self {
            state,
            provider,
            path,
            operation_class,
            started: Instant::now(),
            armed: true,
        }
    }

    /// Attempt reached an outcome; returns elapsed ms
    fn disarm(mut self) -> u64 {
        self.armed = false;
        self.started.elapsed().as_millis() as u64
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let latency_ms = self.started.elapsed().as_millis() as u64;
        self.state.telemetry.record(LatencySample {
            provider: self.provider.to_string(),
            operation_class: self.operation_class,
            timestamp_ms: self.state.clock.now_ms(),
            latency_ms,
            outcome: SampleOutcome::Cancelled,
            cost_usd: None,
        });
        self.state.circuits.release_trial(self.provider, self.path);
        tracing::debug!(
            provider = self.provider,
            path = %self.path,
            latency_ms,
            "Attempt cancelled by caller"
        );
    }
}

/// Decrements the in-flight gauge however the flow ends
struct InFlight<'a>(&'a RouterMetrics);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a RouterMetrics) -> Self {
        metrics.in_flight.inc();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.dec();
    }
}

// ============================================================================
// Router
// ============================================================================

/// Multi-provider request router
pub struct AiRouter {
    state: RouterState,
    classifier: RwLock<TaskClassifier>,
}

impl AiRouter {
    /// Create a router over shared state
    pub fn new(state: RouterState, classifier: TaskClassifier) -> Self {
        Self {
            state,
            classifier: RwLock::new(classifier),
        }
    }

    /// Shared state
    pub fn state(&self) -> &RouterState {
        &self.state
    }

    /// Replace classification keywords and hint policy
    pub fn set_classifier(&self, classifier: TaskClassifier) {
        *self.classifier.write() = classifier;
    }

    /// Classify a request the way the router would
    pub fn classify(&self, request: &Request) -> TaskClass {
        let hint_role = request
            .explicit_provider_hint
            .as_deref()
            .and_then(|hint| self.state.registry.role_of(hint));
        self.classifier.read().classify(request, hint_role)
    }

    /// Route a request to completion
    ///
    /// The only error callers ever see is
    /// [`RoutingError::AllProvidersExhausted`].
    pub async fn route(&self, request: &Request) -> RoutingResult<Response> {
        self.route_flow(request).await
    }

    /// Route a request, abandoning it when `cancel` completes first
    ///
    /// Returns `None` if the caller cancelled.
    pub async fn route_until<C>(&self, request: &Request, cancel: C) -> Option<RoutingResult<Response>>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            () = cancel => {
                self.state.metrics.cancellations.inc();
                tracing::info!(request_id = %request.id, "Request cancelled by caller");
                None
            }
            result = self.route_flow(request) => Some(result),
        }
    }

    /// Route and fold the terminal error into the response contract
    pub async fn handle(&self, request: &Request) -> Response {
        let started = Instant::now();
        match self.route(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(request_id = %request.id, error = %err, "Answering with error response");
                Response::error(
                    request.id.clone(),
                    ErrorKind::AllProvidersExhausted,
                    started.elapsed().as_millis() as u64,
                )
            }
        }
    }

    async fn route_flow(&self, request: &Request) -> RoutingResult<Response> {
        let state = &self.state;
        let started = Instant::now();
        let _in_flight = InFlight::enter(&state.metrics);
        state.metrics.requests.inc();

        let task_class = self.classify(request);
        state.metrics.record_class(task_class);
        let operation_class = state.telemetry.operation_class(request);

        let chain = match state.policy.order(request, task_class) {
            Ok(chain) => chain,
            Err(unavailable) => {
                self.note_exclusions(request, &unavailable.excluded);
                tracing::warn!(
                    request_id = %request.id,
                    task_class = %task_class,
                    excluded = unavailable.excluded.len(),
                    "No candidate provider available"
                );
                state.audit.emit(AuditEvent::new(
                    AuditEventType::RoutingDecision,
                    serde_json::json!({
                        "requestId": request.id,
                        "taskClass": task_class,
                        "ruleVersion": unavailable.rule_version,
                        "urgencyTier": request.urgency_tier,
                        "outcome": "error",
                        "errorKind": ErrorKind::AllProvidersExhausted,
                        "excluded": unavailable.excluded.iter().map(|e| &e.provider).collect::<Vec<_>>(),
                        "attempts": [],
                    }),
                ));
                return Err(self.exhausted(request, task_class, started, false));
            }
        };
        self.note_exclusions(request, &chain.excluded);

        tracing::debug!(
            request_id = %request.id,
            task_class = %task_class,
            rule_version = chain.rule_version,
            chain = ?chain.providers,
            urgency = %request.urgency_tier,
            "Routing request"
        );

        let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(chain.providers.len());
        let mut timed_out = false;

        for (position, provider) in chain.providers.iter().enumerate() {
            let Some(decision) =
                state
                    .hybrid
                    .acquire(provider, request.urgency_tier, &chain.thresholds)
            else {
                state.metrics.circuit_rejections.inc();
                attempts.push(AttemptRecord {
                    provider: provider.clone(),
                    path: None,
                    outcome: AttemptOutcome::CircuitRejected,
                    error_kind: None,
                    latency_ms: 0,
                });
                continue;
            };
            let Some(entry) = state.registry.get(provider) else {
                state.circuits.release_trial(provider, decision.path);
                continue;
            };

            let guard = AttemptGuard::arm(state, provider, decision.path, operation_class);
            let result = tokio::time::timeout(
                decision.budget,
                entry.adapter.execute(request, decision.path, decision.budget),
            )
            .await;
            let latency_ms = guard.disarm();
            let now = state.clock.now_ms();

            match result {
                Ok(Ok(reply)) => {
                    state.circuits.record_success(provider, decision.path);
                    let cost = reply
                        .cost_usd
                        .unwrap_or_else(|| state.registry.cost_estimate(provider));
                    state.telemetry.record(LatencySample {
                        provider: provider.clone(),
                        operation_class,
                        timestamp_ms: now,
                        latency_ms,
                        outcome: SampleOutcome::Success,
                        cost_usd: Some(cost),
                    });
                    attempts.push(AttemptRecord {
                        provider: provider.clone(),
                        path: Some(decision.path),
                        outcome: AttemptOutcome::Success,
                        error_kind: None,
                        latency_ms,
                    });

                    let total_ms = started.elapsed().as_millis() as u64;
                    state.telemetry.record_request(
                        task_class,
                        RequestRecord {
                            timestamp_ms: now,
                            latency_ms: total_ms,
                            success: true,
                            timed_out,
                            served_by_primary: position == 0,
                            cost_usd: cost,
                        },
                    );
                    state.metrics.served.inc();
                    state.metrics.record_path(decision.path);
                    state.metrics.latency.record(total_ms);
                    if position > 0 {
                        state.metrics.fallbacks.inc();
                    }

                    tracing::info!(
                        request_id = %request.id,
                        task_class = %task_class,
                        provider = %provider,
                        path = %decision.path,
                        reason = %decision.reason,
                        fallbacks = position,
                        latency_ms = total_ms,
                        "Request served"
                    );
                    self.audit_decision(request, &chain, &attempts, total_ms, Some((provider, decision.path)));

                    return Ok(Response::success(
                        request.id.clone(),
                        provider.clone(),
                        decision.path,
                        total_ms,
                        reply.content,
                    ));
                }
                Ok(Err(err)) => {
                    if err.kind.counts_against_health() {
                        state.circuits.record_failure(provider, decision.path);
                        state.telemetry.record(LatencySample {
                            provider: provider.clone(),
                            operation_class,
                            timestamp_ms: now,
                            latency_ms,
                            outcome: if err.kind == ProviderErrorKind::Timeout {
                                SampleOutcome::Timeout
                            } else {
                                SampleOutcome::Failure
                            },
                            cost_usd: None,
                        });
                    } else {
                        // A refusal says nothing about provider health
                        state.circuits.release_trial(provider, decision.path);
                        state.metrics.compliance_skips.inc();
                    }
                    if err.kind == ProviderErrorKind::Timeout {
                        timed_out = true;
                        state.metrics.attempt_timeouts.inc();
                    } else {
                        state.metrics.attempt_failures.inc();
                    }

                    let internal = if err.kind == ProviderErrorKind::ComplianceBlocked {
                        RoutingError::ComplianceBlocked {
                            provider: provider.clone(),
                        }
                    } else {
                        RoutingError::ProviderUnavailable {
                            provider: provider.clone(),
                            path: decision.path,
                        }
                    };
                    self.audit_attempt_failure(request, provider, decision.path, err.kind, latency_ms, &internal);
                    tracing::warn!(
                        request_id = %request.id,
                        provider = %provider,
                        path = %decision.path,
                        kind = %err.kind,
                        error = %err.message,
                        latency_ms,
                        "Provider attempt failed, advancing chain"
                    );
                    attempts.push(AttemptRecord {
                        provider: provider.clone(),
                        path: Some(decision.path),
                        outcome: AttemptOutcome::Failed,
                        error_kind: Some(err.kind),
                        latency_ms,
                    });
                }
                Err(_elapsed) => {
                    timed_out = true;
                    state.circuits.record_failure(provider, decision.path);
                    state.telemetry.record(LatencySample {
                        provider: provider.clone(),
                        operation_class,
                        timestamp_ms: now,
                        latency_ms,
                        outcome: SampleOutcome::Timeout,
                        cost_usd: None,
                    });
                    state.metrics.attempt_timeouts.inc();

                    let internal = RoutingError::ProviderTimeout {
                        provider: provider.clone(),
                        timeout_ms: decision.budget.as_millis() as u64,
                    };
                    self.audit_attempt_failure(
                        request,
                        provider,
                        decision.path,
                        ProviderErrorKind::Timeout,
                        latency_ms,
                        &internal,
                    );
                    tracing::warn!(
                        request_id = %request.id,
                        provider = %provider,
                        path = %decision.path,
                        budget_ms = decision.budget.as_millis() as u64,
                        "Provider attempt timed out, advancing chain"
                    );
                    attempts.push(AttemptRecord {
                        provider: provider.clone(),
                        path: Some(decision.path),
                        outcome: AttemptOutcome::Timeout,
                        error_kind: Some(ProviderErrorKind::Timeout),
                        latency_ms,
                    });
                }
            }
        }

        tracing::warn!(
            request_id = %request.id,
            task_class = %task_class,
            attempts = attempts.len(),
            "All providers exhausted"
        );
        let err = self.exhausted(request, task_class, started, timed_out);
        self.audit_decision(request, &chain, &attempts, started.elapsed().as_millis() as u64, None);
        Err(err)
    }

    /// Book-keeping for a request nobody could serve
    fn exhausted(
        &self,
        request: &Request,
        task_class: TaskClass,
        started: Instant,
        timed_out: bool,
    ) -> RoutingError {
        let state = &self.state;
        let total_ms = started.elapsed().as_millis() as u64;

        state.metrics.exhausted.inc();
        state.metrics.latency.record(total_ms);
        state.telemetry.record_request(
            task_class,
            RequestRecord {
                timestamp_ms: state.clock.now_ms(),
                latency_ms: total_ms,
                success: false,
                timed_out,
                served_by_primary: false,
                cost_usd: 0.0,
            },
        );

        RoutingError::AllProvidersExhausted {
            request_id: request.id.clone(),
        }
    }

    fn note_exclusions(&self, request: &Request, excluded: &[Exclusion]) {
        for exclusion in excluded {
            if exclusion.reason == ExclusionReason::Compliance {
                self.state.metrics.compliance_skips.inc();
                self.state.audit.emit(AuditEvent::new(
                    AuditEventType::ComplianceSkipped,
                    serde_json::json!({
                        "requestId": request.id,
                        "provider": exclusion.provider,
                    }),
                ));
            }
        }
    }

    fn audit_attempt_failure(
        &self,
        request: &Request,
        provider: &str,
        path: RoutePath,
        kind: ProviderErrorKind,
        latency_ms: u64,
        internal: &RoutingError,
    ) {
        self.state.audit.emit(AuditEvent::new(
            AuditEventType::AttemptFailed,
            serde_json::json!({
                "requestId": request.id,
                "provider": provider,
                "path": path,
                "kind": kind,
                "error": internal.to_string(),
                "latencyMs": latency_ms,
            }),
        ));
    }

    fn audit_decision(
        &self,
        request: &Request,
        chain: &CandidateChain,
        attempts: &[AttemptRecord],
        latency_ms: u64,
        served: Option<(&String, RoutePath)>,
    ) {
        let payload = match served {
            Some((provider, path)) => serde_json::json!({
                "requestId": request.id,
                "taskClass": chain.task_class,
                "ruleVersion": chain.rule_version,
                "urgencyTier": request.urgency_tier,
                "chain": chain.providers,
                "providerUsed": provider,
                "path": path,
                "outcome": "success",
                "attempts": attempts,
                "latencyMs": latency_ms,
            }),
            None => serde_json::json!({
                "requestId": request.id,
                "taskClass": chain.task_class,
                "ruleVersion": chain.rule_version,
                "urgencyTier": request.urgency_tier,
                "chain": chain.providers,
                "outcome": "error",
                "errorKind": ErrorKind::AllProvidersExhausted,
                "attempts": attempts,
                "latencyMs": latency_ms,
            }),
        };
        self.state
            .audit
            .emit(AuditEvent::new(AuditEventType::RoutingDecision, payload));
    }
}

impl fmt::Debug for AiRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiRouter")
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::RouterSettings;
    use crate::provider::ProviderErrorKind;
    use crate::request::UrgencyTier;
    use crate::routing::circuit::CircuitState;
    use crate::routing::runtime::RouterRuntime;
    use crate::routing::test_utils::{MemoryAuditSink, MockFleet};

    fn runtime() -> (RouterRuntime, MockFleet, Arc<MemoryAuditSink>) {
        let fleet = MockFleet::standard();
        let audit = Arc::new(MemoryAuditSink::new());
        let runtime = RouterRuntime::builder(RouterSettings::default())
            .registry(Arc::new(fleet.registry()))
            .audit_sink(audit.clone())
            .build()
            .unwrap();
        (runtime, fleet, audit)
    }

    fn culinary() -> Request {
        Request::new("Summarize reviews")
            .with_domain("culinary")
            .with_intent("analysis")
            .with_urgency(UrgencyTier::Medium)
    }

    #[tokio::test]
    async fn test_serves_from_specialist_on_brokered_path() {
        let (runtime, fleet, audit) = runtime();
        let response = runtime.router().route(&culinary()).await.unwrap();

        assert_eq!(response.provider_used.as_deref(), Some("sage"));
        assert_eq!(response.path, Some(RoutePath::Brokered));
        assert_eq!(fleet.sage.calls(), 1);
        assert_eq!(fleet.total_calls(), 1);
        assert_eq!(audit.count(AuditEventType::RoutingDecision), 1);
    }

    #[tokio::test]
    async fn test_fallback_is_sequential_and_records_failure() {
        let (runtime, fleet, audit) = runtime();
        fleet.sage.fail_with(ProviderErrorKind::Unavailable);

        let response = runtime.router().route(&culinary()).await.unwrap();
        assert_eq!(response.provider_used.as_deref(), Some("atlas"));
        assert_eq!(fleet.sage.calls(), 1);
        assert_eq!(fleet.atlas.calls(), 1);
        assert_eq!(fleet.echo.calls(), 0);

        let state = runtime.router().state();
        assert_eq!(state.circuits.consecutive_failures("sage", RoutePath::Brokered), 1);
        assert_eq!(state.metrics.fallbacks.get(), 1);
        assert_eq!(audit.count(AuditEventType::AttemptFailed), 1);
    }

    #[tokio::test]
    async fn test_provider_compliance_refusal_keeps_circuit_closed() {
        let (runtime, fleet, _) = runtime();
        fleet.sage.fail_with(ProviderErrorKind::ComplianceBlocked);

        for _ in 0..10 {
            let response = runtime.router().route(&culinary()).await.unwrap();
            assert_eq!(response.provider_used.as_deref(), Some("atlas"));
        }
        let circuits = &runtime.router().state().circuits;
        assert_eq!(circuits.state("sage", RoutePath::Brokered), CircuitState::Closed);
        assert_eq!(circuits.consecutive_failures("sage", RoutePath::Brokered), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_hides_provider_detail() {
        let (runtime, fleet, audit) = runtime();
        for provider in fleet.all() {
            provider.fail_with(ProviderErrorKind::RateLimited);
        }

        let request = culinary().with_id("req-x");
        let err = runtime.router().route(&request).await.unwrap_err();
        assert_eq!(
            err,
            RoutingError::AllProvidersExhausted {
                request_id: "req-x".to_string()
            }
        );
        assert!(!err.to_string().contains("rate"));
        assert_eq!(fleet.total_calls(), 3);
        assert_eq!(audit.count(AuditEventType::AttemptFailed), 3);

        let response = runtime.router().handle(&request).await;
        assert!(!response.is_success());
        assert_eq!(response.error_kind, Some(ErrorKind::AllProvidersExhausted));
        assert!(response.provider_used.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_advances_chain() {
        let (runtime, fleet, _) = runtime();
        fleet.sage.set_latency(Duration::from_secs(120));

        let response = runtime.router().route(&culinary()).await.unwrap();
        assert_eq!(response.provider_used.as_deref(), Some("atlas"));

        let state = runtime.router().state();
        assert_eq!(state.metrics.attempt_timeouts.get(), 1);
        let history = fleet.sage.history();
        assert_eq!(history[0].timeout, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_records_cancelled_attempt() {
        let (runtime, fleet, _) = runtime();
        fleet.sage.set_latency(Duration::from_secs(10));

        let outcome = runtime
            .router()
            .route_until(&culinary(), tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert!(outcome.is_none());

        let state = runtime.router().state();
        assert_eq!(state.telemetry.cancelled_attempts(), 1);
        assert_eq!(state.metrics.cancellations.get(), 1);
        assert_eq!(state.metrics.in_flight.get(), 0);
        // Cancellation is not a provider failure
        assert_eq!(state.circuits.consecutive_failures("sage", RoutePath::Brokered), 0);
        assert_eq!(fleet.atlas.calls(), 0);
    }

    #[tokio::test]
    async fn test_hint_classification_is_safety_biased() {
        let (runtime, _, _) = runtime();
        let request = culinary().with_provider_hint("atlas");

        assert_eq!(runtime.router().classify(&request), TaskClass::EndUser);
        let response = runtime.router().route(&request).await.unwrap();
        // Mismatched hint is first alternate, the specialist still leads
        assert_eq!(response.provider_used.as_deref(), Some("sage"));
    }
}
