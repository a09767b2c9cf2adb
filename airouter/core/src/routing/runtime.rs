//! Router Runtime
//!
//! Wires the shared registries, the request-path [`AiRouter`] and the two
//! control loops together from one [`RouterSettings`].
//!
//! ```text
//!                     RouterRuntime
//!     +-------------------+-------------------+
//!     |                   |                   |
//!  AiRouter         HealthMonitor      RoutingOptimizer     metrics reporter
//!     |                   |                   |                   |
//!     +---------------- RouterState (shared) -+-------------------+
//! ```
//!
//! Background tasks are started with [`RouterRuntime::start`] and stopped
//! with [`RouterRuntime::shutdown`]. Live reconfiguration goes through
//! [`RouterRuntime::apply_live_settings`], which never interrupts
//! in-flight requests.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock};
use crate::compliance::{AllowAll, ComplianceGate};
use crate::config::RouterSettings;
use crate::provider::ProviderRegistry;
use crate::routing::circuit::CircuitBreakerRegistry;
use crate::routing::classifier::TaskClassifier;
use crate::routing::health::{HealthBoard, HealthMonitor};
use crate::routing::hybrid::{FeatureToggles, HybridRouter};
use crate::routing::metrics::{MetricsReport, RouterMetrics};
use crate::routing::optimizer::RoutingOptimizer;
use crate::routing::policy::ProviderOrderingPolicy;
use crate::routing::router::{AiRouter, RouterState};
use crate::routing::rules::{default_rules, RuleError, RuleStore};
use crate::routing::telemetry::LatencyTelemetry;
use crate::sinks::{AuditSink, MetricsSink, NullMetricsSink, TracingAuditSink};

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`RouterRuntime`]
pub struct RouterRuntimeBuilder {
    settings: RouterSettings,
    registry: Option<Arc<ProviderRegistry>>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    compliance: Option<Arc<dyn ComplianceGate>>,
    clock: Option<Arc<dyn Clock>>,
}

impl RouterRuntimeBuilder {
    /// Providers to route across (empty registry if never set)
    #[must_use]
    pub fn registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Audit event consumer (defaults to the tracing sink)
    #[must_use]
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Periodic metrics consumer (defaults to discarding)
    #[must_use]
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Compliance gate (defaults to allowing everything)
    #[must_use]
    pub fn compliance(mut self, gate: Arc<dyn ComplianceGate>) -> Self {
        self.compliance = Some(gate);
        self
    }

    /// Time source (defaults to the system clock)
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the runtime without starting background tasks
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] when the configured or derived rules are
    /// invalid, e.g. a class whose chain ends up empty.
    pub fn build(self) -> Result<RouterRuntime, RuleError> {
        let settings = self.settings;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ProviderRegistry::new()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let compliance = self.compliance.unwrap_or_else(|| Arc::new(AllowAll));
        let metrics_sink = self
            .metrics_sink
            .unwrap_or_else(|| Arc::new(NullMetricsSink));

        for provider in &settings.providers {
            if !provider.enabled {
                registry.set_enabled(&provider.id, false);
            }
        }

        let circuits = Arc::new(CircuitBreakerRegistry::new(
            settings.breaker,
            clock.clone(),
            audit.clone(),
        ));
        for id in registry.ids() {
            circuits.register(&id);
        }

        // Configured rules win; classes without one get specialist-first chains
        let mut rules = settings.rules.clone();
        for fallback in default_rules(&registry) {
            if !rules.iter().any(|r| r.task_class == fallback.task_class) {
                rules.push(fallback);
            }
        }
        let rules = Arc::new(RuleStore::from_rules(rules, audit.clone())?);

        let toggles = Arc::new(FeatureToggles::new(
            settings.optimizer_enabled,
            settings.direct_path_enabled,
        ));
        let telemetry = Arc::new(LatencyTelemetry::new(
            settings.telemetry.clone(),
            clock.clone(),
        ));
        let hybrid = Arc::new(HybridRouter::new(
            circuits.clone(),
            toggles.clone(),
            settings.hybrid,
        ));
        let policy = Arc::new(ProviderOrderingPolicy::new(
            registry.clone(),
            rules.clone(),
            hybrid.clone(),
            compliance,
            settings.pinned_classes.iter().copied(),
        ));

        let state = RouterState {
            registry,
            circuits,
            telemetry,
            rules,
            hybrid,
            policy,
            toggles,
            metrics: Arc::new(RouterMetrics::new()),
            audit,
            clock,
        };

        let board = Arc::new(HealthBoard::new());
        let router = Arc::new(AiRouter::new(
            state.clone(),
            TaskClassifier::new(settings.classifier.clone()),
        ));
        let health = Arc::new(HealthMonitor::new(
            state.clone(),
            board.clone(),
            settings.health.clone(),
        ));
        let optimizer = Arc::new(RoutingOptimizer::new(
            state.clone(),
            board,
            settings.optimizer.clone(),
        ));

        tracing::info!(
            providers = state.registry.len(),
            optimizer_enabled = settings.optimizer_enabled,
            direct_path_enabled = settings.direct_path_enabled,
            "Router runtime assembled"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(RouterRuntime {
            state,
            router,
            health,
            optimizer,
            metrics_sink,
            settings: Mutex::new(settings),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// A fully wired router with its background loops
pub struct RouterRuntime {
    state: RouterState,
    router: Arc<AiRouter>,
    health: Arc<HealthMonitor>,
    optimizer: Arc<RoutingOptimizer>,
    metrics_sink: Arc<dyn MetricsSink>,
    settings: Mutex<RouterSettings>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RouterRuntime {
    /// Start assembling a runtime
    #[must_use]
    pub fn builder(settings: RouterSettings) -> RouterRuntimeBuilder {
        RouterRuntimeBuilder {
            settings,
            registry: None,
            audit: None,
            metrics_sink: None,
            compliance: None,
            clock: None,
        }
    }

    /// Request-path entry point
    pub fn router(&self) -> &Arc<AiRouter> {
        &self.router
    }

    /// Shared registries
    pub fn state(&self) -> &RouterState {
        &self.state
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn optimizer(&self) -> &Arc<RoutingOptimizer> {
        &self.optimizer
    }

    /// Settings currently in force
    pub fn settings(&self) -> RouterSettings {
        self.settings.lock().clone()
    }

    /// Spawn the health monitor, optimizer and metrics reporter
    ///
    /// Calling this twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tracing::debug!("Router background tasks already running");
            return;
        }
        tasks.push(self.health.clone().spawn(self.shutdown_tx.subscribe()));
        tasks.push(self.optimizer.clone().spawn(self.shutdown_tx.subscribe()));
        tasks.push(self.spawn_metrics_reporter());
        tracing::info!(tasks = tasks.len(), "Router background tasks started");
    }

    fn spawn_metrics_reporter(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let sink = self.metrics_sink.clone();
        let period = self.settings.lock().report_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so reports cover a full period
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = MetricsReport::collect(
                            &state.registry,
                            &state.circuits,
                            &state.telemetry,
                            &state.metrics,
                        );
                        sink.publish(report);
                    }
                }
            }
            tracing::debug!("Metrics reporter stopped");
        })
    }

    /// Collect a metrics report now
    pub fn metrics_report(&self) -> MetricsReport {
        MetricsReport::collect(
            &self.state.registry,
            &self.state.circuits,
            &self.state.telemetry,
            &self.state.metrics,
        )
    }

    /// Apply reloaded settings to live components
    ///
    /// Thresholds, toggles, classifier keywords, pinning and provider
    /// participation take effect for the next request or cycle. Provider
    /// endpoints and the rule set are not reloaded.
    pub fn apply_live_settings(&self, settings: &RouterSettings) {
        let state = &self.state;

        state.circuits.set_config(settings.breaker);
        state.telemetry.set_slo(settings.telemetry.slo.clone());
        state
            .telemetry
            .set_operation_heuristics(settings.telemetry.operations.clone());
        state.hybrid.set_config(settings.hybrid);
        state.toggles.set_optimizer_enabled(settings.optimizer_enabled);
        state
            .toggles
            .set_direct_path_enabled(settings.direct_path_enabled);
        state.policy.set_pinned(settings.pinned_classes.iter().copied());
        self.router
            .set_classifier(TaskClassifier::new(settings.classifier.clone()));
        self.health.set_config(settings.health.clone());
        self.optimizer.set_config(settings.optimizer.clone());

        for provider in &settings.providers {
            if state.registry.get(&provider.id).is_some() {
                state.registry.set_enabled(&provider.id, provider.enabled);
            } else {
                tracing::warn!(
                    provider = %provider.id,
                    "Reloaded settings name an unregistered provider; restart to add it"
                );
            }
        }

        *self.settings.lock() = settings.clone();
        tracing::info!(
            optimizer_enabled = settings.optimizer_enabled,
            direct_path_enabled = settings.direct_path_enabled,
            "Live settings applied"
        );
    }

    /// Stop background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Router runtime stopped");
    }
}

impl std::fmt::Debug for RouterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterRuntime")
            .field("state", &self.state)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}
