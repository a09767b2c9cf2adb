#![allow(missing_docs)]
//! Provider Routing
//!
//! Request-path routing across the provider fleet plus the two control
//! loops that keep the routing rules healthy.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |     AiRouter     |  <-- classify, order, attempt with fallback
//! +--------+---------+
//!          |
//!          v
//! +------------------+      +------------------+
//! | OrderingPolicy   | ---> |    RuleStore     |  <-- versioned rules
//! +--------+---------+      +------------------+
//!          |
//!          v
//! +------------------+      +------------------+
//! |   HybridRouter   | ---> | CircuitBreakers  |  <-- per (provider, path)
//! +--------+---------+      +------------------+
//!          |
//!    +-----+-----+
//!    |           |
//!    v           v
//! +------+   +--------+
//! |Direct|   |Brokered|  <-- provider adapters
//! +------+   +--------+
//!
//! HealthMonitor  --probes-->  breakers, telemetry, HealthBoard
//! RoutingOptimizer --reads--> telemetry, HealthBoard --swaps--> RuleStore
//! ```
//!
//! # Design Principles
//!
//! 1. **Sequential fallback**: one billable attempt at a time per request
//! 2. **Shared state only**: control loops never call the request path
//! 3. **Reversible tuning**: every optimizer change can be rolled back
//! 4. **Opaque failures**: callers only ever see exhaustion

pub mod circuit;
pub mod classifier;
pub mod error;
pub mod health;
pub mod hybrid;
pub mod metrics;
pub mod optimizer;
pub mod policy;
pub mod router;
pub mod rules;
pub mod runtime;
pub mod telemetry;

// Mock providers and sinks, shared with integration tests
pub mod test_utils;

pub use circuit::{BreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use classifier::{ClassifierConfig, HintPolicy, TaskClass, TaskClassifier};
pub use error::{RoutingError, RoutingResult};
pub use health::{HealthBoard, HealthMonitor, HealthMonitorConfig, HealthReport};
pub use hybrid::{FeatureToggles, HybridConfig, HybridRouter, PathDecision, PathReason};
pub use metrics::{MetricsReport, RouterCounters, RouterMetrics};
pub use optimizer::{
    OptimizationCycle, OptimizationRecommendation, OptimizationStrategy, OptimizerConfig,
    RecommendationStatus, RoutingOptimizer,
};
pub use policy::{CandidateChain, ProviderOrderingPolicy};
pub use router::{AiRouter, AttemptOutcome, AttemptRecord, RouterState};
pub use rules::{RoutingRule, RuleAuthor, RuleError, RuleStore, RuleVersion, UrgencyThresholds};
pub use runtime::{RouterRuntime, RouterRuntimeBuilder};
pub use telemetry::{
    LatencyTelemetry, OperationClass, OperationHeuristics, SloConfig, SloStatus, TelemetryConfig,
};
