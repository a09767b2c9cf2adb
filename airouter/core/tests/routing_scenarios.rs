//! End-to-end routing scenarios against the public API
//!
//! Each test builds an isolated runtime over the mock fleet:
//! `atlas` (orchestrator), `sage` (user-task), `echo` (audience).

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use airouter_core::routing::circuit::CircuitState;
use airouter_core::routing::telemetry::{LatencySample, OperationClass, SampleOutcome};
use airouter_core::routing::test_utils::{MemoryAuditSink, MockFleet};
use airouter_core::{
    AuditEventType, DomainBlocklist, ManualClock, ProviderErrorKind, Request, RouterRuntime,
    RouterSettings, RoutePath, RoutingError, TaskClass, ToolSpec, UrgencyTier,
};

struct Harness {
    runtime: RouterRuntime,
    fleet: MockFleet,
    audit: Arc<MemoryAuditSink>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    harness_with(RouterSettings::default())
}

fn harness_with(settings: RouterSettings) -> Harness {
    let fleet = MockFleet::standard();
    let audit = Arc::new(MemoryAuditSink::new());
    let clock = Arc::new(ManualClock::new(5_000_000));
    let runtime = RouterRuntime::builder(settings)
        .registry(Arc::new(fleet.registry()))
        .audit_sink(audit.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        runtime,
        fleet,
        audit,
        clock,
    }
}

fn culinary_analysis() -> Request {
    Request::new("Which of these recipes do people like most?")
        .with_domain("culinary")
        .with_intent("analysis")
        .with_urgency(UrgencyTier::Medium)
}

fn system_orchestration() -> Request {
    Request::new("Rebalance worker pools")
        .with_domain("system")
        .with_intent("orchestration")
        .with_urgency(UrgencyTier::Emergency)
}

fn audience_request() -> Request {
    Request::new("Segment campaign reach by region")
        .with_domain("marketing")
        .with_intent("analysis")
}

// ============================================================================
// Ordering properties
// ============================================================================

#[tokio::test]
async fn orchestration_requests_start_with_the_orchestrator() {
    let h = harness();
    let router = h.runtime.router();

    for tier in UrgencyTier::ALL {
        let request = system_orchestration().with_urgency(tier);
        assert_eq!(router.classify(&request), TaskClass::Orchestration);
        let response = router.route(&request).await.unwrap();
        assert_eq!(response.provider_used.as_deref(), Some("atlas"));
    }
    assert_eq!(h.fleet.sage.calls() + h.fleet.echo.calls(), 0);
}

#[tokio::test]
async fn audience_requests_start_with_the_audience_specialist() {
    let h = harness();
    let router = h.runtime.router();

    let request = audience_request();
    assert_eq!(router.classify(&request), TaskClass::Audience);
    let response = router.route(&request).await.unwrap();
    assert_eq!(response.provider_used.as_deref(), Some("echo"));
}

#[tokio::test]
async fn emergency_with_closed_direct_circuit_never_goes_brokered() {
    let h = harness();
    let router = h.runtime.router();

    for _ in 0..10 {
        let response = router.route(&system_orchestration()).await.unwrap();
        assert_eq!(response.path, Some(RoutePath::Direct));
    }
    assert_eq!(h.fleet.atlas.calls_on(RoutePath::Brokered), 0);
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[test]
fn circuit_opens_after_threshold_and_admits_one_trial() {
    let h = harness();
    let circuits = &h.runtime.state().circuits;
    let threshold = RouterSettings::default().breaker.failure_threshold;

    for _ in 0..threshold - 1 {
        circuits.record_failure("sage", RoutePath::Direct);
    }
    assert!(circuits.is_available("sage", RoutePath::Direct));
    circuits.record_failure("sage", RoutePath::Direct);
    assert!(!circuits.is_available("sage", RoutePath::Direct));

    // Cooldown elapses: exactly one trial
    h.clock.advance(Duration::from_secs(60));
    assert!(circuits.is_available("sage", RoutePath::Direct));
    assert!(!circuits.is_available("sage", RoutePath::Direct));

    // Failing trial re-opens and restarts the cooldown
    circuits.record_failure("sage", RoutePath::Direct);
    assert_eq!(circuits.state("sage", RoutePath::Direct), CircuitState::Open);
    h.clock.advance(Duration::from_secs(30));
    assert!(!circuits.is_available("sage", RoutePath::Direct));
    h.clock.advance(Duration::from_secs(30));

    // Succeeding trial closes and resets the failure count
    assert!(circuits.is_available("sage", RoutePath::Direct));
    circuits.record_success("sage", RoutePath::Direct);
    assert_eq!(circuits.state("sage", RoutePath::Direct), CircuitState::Closed);
    assert_eq!(circuits.consecutive_failures("sage", RoutePath::Direct), 0);

    // The other path was never touched
    assert_eq!(circuits.state("sage", RoutePath::Brokered), CircuitState::Closed);
    assert!(h.audit.count(AuditEventType::CircuitTransition) >= 3);
}

#[tokio::test]
async fn repeated_failures_through_the_router_open_the_circuit() {
    let h = harness();
    h.fleet
        .sage
        .fail_path(RoutePath::Brokered, ProviderErrorKind::Unavailable);

    for _ in 0..5 {
        let response = h.runtime.router().route(&culinary_analysis()).await.unwrap();
        assert_eq!(response.provider_used.as_deref(), Some("atlas"));
    }
    let circuits = &h.runtime.state().circuits;
    assert_eq!(circuits.state("sage", RoutePath::Brokered), CircuitState::Open);

    // Medium tier now falls back to sage's direct lane
    let response = h.runtime.router().route(&culinary_analysis()).await.unwrap();
    assert_eq!(response.provider_used.as_deref(), Some("sage"));
    assert_eq!(response.path, Some(RoutePath::Direct));
}

// ============================================================================
// Telemetry
// ============================================================================

#[test]
fn p95_matches_nearest_rank_order_statistic() {
    let h = harness();
    let telemetry = &h.runtime.state().telemetry;
    let now = telemetry.now_ms();

    // Shuffled 1..=200 ms
    for i in 0..200u64 {
        let latency = (i * 73) % 200 + 1;
        telemetry.record(LatencySample {
            provider: "atlas".into(),
            operation_class: OperationClass::Generation,
            timestamp_ms: now,
            latency_ms: latency,
            outcome: SampleOutcome::Success,
            cost_usd: None,
        });
    }

    // ceil(95% of 200) = 190th smallest
    assert_eq!(
        telemetry.percentile("atlas", OperationClass::Generation, 95.0),
        Some(190)
    );
    assert_eq!(
        telemetry.percentile("atlas", OperationClass::Generation, 99.0),
        Some(198)
    );
    assert_eq!(telemetry.percentile("atlas", OperationClass::Retrieval, 95.0), None);
}

#[tokio::test]
async fn routed_samples_land_in_the_request_shape_class() {
    let h = harness();
    let router = h.runtime.router();
    let telemetry = &h.runtime.state().telemetry;

    router.route(&culinary_analysis()).await.unwrap();
    let essay = Request::new("Compare regional braising techniques in depth. ".repeat(20))
        .with_domain("culinary")
        .with_intent("analysis");
    router.route(&essay).await.unwrap();
    let grounded = culinary_analysis().with_tool(ToolSpec::new("recipe_search"));
    router.route(&grounded).await.unwrap();

    for class in [
        OperationClass::Cached,
        OperationClass::Generation,
        OperationClass::Retrieval,
    ] {
        assert!(
            telemetry.percentile("sage", class, 50.0).is_some(),
            "no {class} sample for sage"
        );
    }
}

// ============================================================================
// Optimizer
// ============================================================================

#[test]
fn optimizer_without_enough_samples_changes_nothing() {
    let h = harness();
    let state = h.runtime.state();
    let now = state.telemetry.now_ms();

    for provider in ["atlas", "sage", "echo"] {
        for _ in 0..99 {
            state.telemetry.record(LatencySample {
                provider: provider.into(),
                operation_class: OperationClass::Generation,
                timestamp_ms: now,
                latency_ms: 9_000,
                outcome: SampleOutcome::Failure,
                cost_usd: None,
            });
        }
    }
    let versions: Vec<u64> = TaskClass::ALL
        .iter()
        .map(|c| state.rules.active(*c).version)
        .collect();

    let cycle = h.runtime.optimizer().run_once();
    assert_eq!(cycle.rule_changes(), 0);
    assert_eq!(cycle.insufficient.len(), TaskClass::ALL.len());

    let after: Vec<u64> = TaskClass::ALL
        .iter()
        .map(|c| state.rules.active(*c).version)
        .collect();
    assert_eq!(versions, after);
    assert_eq!(h.audit.count(AuditEventType::RuleSwapped), 0);
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn culinary_analysis_uses_user_task_specialist_then_falls_back() {
    let h = harness();
    let router = h.runtime.router();

    let first = router.route(&culinary_analysis()).await.unwrap();
    assert_eq!(first.provider_used.as_deref(), Some("sage"));
    assert_eq!(first.path, Some(RoutePath::Brokered));
    assert!(first.is_success());

    h.runtime.state().circuits.force_open_provider("sage");

    let second = router.route(&culinary_analysis()).await.unwrap();
    assert_eq!(second.provider_used.as_deref(), Some("atlas"));
    assert_eq!(second.path, Some(RoutePath::Brokered));
    assert!(second.is_success());
    assert_eq!(h.fleet.sage.calls(), 1);
}

#[tokio::test]
async fn emergency_orchestration_falls_through_to_exhaustion() {
    let h = harness();
    let router = h.runtime.router();
    let circuits = &h.runtime.state().circuits;
    circuits.force_state("atlas", RoutePath::Direct, CircuitState::Open);

    // Orchestrator still reachable over its brokered path
    let response = router.route(&system_orchestration()).await.unwrap();
    assert_eq!(response.provider_used.as_deref(), Some("atlas"));
    assert_eq!(response.path, Some(RoutePath::Brokered));
    assert_eq!(h.fleet.atlas.calls_on(RoutePath::Direct), 0);

    // Everything behind it fails too
    h.fleet
        .atlas
        .fail_path(RoutePath::Brokered, ProviderErrorKind::Unavailable);
    h.fleet.sage.fail_with(ProviderErrorKind::Timeout);
    h.fleet.echo.fail_with(ProviderErrorKind::RateLimited);

    let request = system_orchestration().with_id("req-emergency");
    let err = router.route(&request).await.unwrap_err();
    assert_eq!(
        err,
        RoutingError::AllProvidersExhausted {
            request_id: "req-emergency".into()
        }
    );
    assert!(err.is_caller_visible());
    assert_eq!(h.fleet.sage.calls(), 1);
    assert_eq!(h.fleet.echo.calls(), 1);
}

#[tokio::test]
async fn compliance_gate_skips_provider_without_touching_health() {
    let fleet = MockFleet::standard();
    let audit = Arc::new(MemoryAuditSink::new());
    let gate = Arc::new(DomainBlocklist::new());
    gate.block("culinary", "sage");
    let runtime = RouterRuntime::builder(RouterSettings::default())
        .registry(Arc::new(fleet.registry()))
        .audit_sink(audit.clone())
        .compliance(gate)
        .build()
        .unwrap();

    let response = runtime.router().route(&culinary_analysis()).await.unwrap();
    assert_eq!(response.provider_used.as_deref(), Some("atlas"));
    assert_eq!(fleet.sage.calls(), 0);
    assert_eq!(
        runtime.state().circuits.consecutive_failures("sage", RoutePath::Brokered),
        0
    );
    assert_eq!(audit.count(AuditEventType::ComplianceSkipped), 1);
}

#[tokio::test]
async fn concurrent_flows_issue_one_call_each() {
    let h = harness();
    let router = h.runtime.router().clone();

    let flows = (0..32).map(|i| {
        let router = router.clone();
        tokio::spawn(async move {
            router
                .route(&culinary_analysis().with_id(format!("req-{i}")))
                .await
        })
    });
    for result in futures::future::join_all(flows).await {
        assert!(result.unwrap().is_ok());
    }
    assert_eq!(h.fleet.total_calls(), 32);
    assert_eq!(h.runtime.state().metrics.counters().served, 32);
}
