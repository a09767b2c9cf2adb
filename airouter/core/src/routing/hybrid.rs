//! Hybrid Routing Decision Engine
//!
//! Chooses between the direct fast lane and the brokered path for one
//! provider, based on the request's urgency tier and the circuit state of
//! each path.
//!
//! ```text
//! emergency / critical / high:  direct   -> brokered -> skip provider
//! medium / low:                 brokered -> direct   -> skip provider
//! ```
//!
//! The direct lane can be switched off with a feature toggle, in which case
//! it is never chosen.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::request::{RoutePath, UrgencyTier};
use crate::routing::circuit::CircuitBreakerRegistry;
use crate::routing::rules::UrgencyThresholds;

// ============================================================================
// Feature Toggles
// ============================================================================

/// Operator feature switches
#[derive(Debug)]
pub struct FeatureToggles {
    optimizer_enabled: AtomicBool,
    direct_path_enabled: AtomicBool,
}

impl FeatureToggles {
    /// Create toggles
    #[must_use]
    pub fn new(optimizer_enabled: bool, direct_path_enabled: bool) -> Self {
        Self {
            optimizer_enabled: AtomicBool::new(optimizer_enabled),
            direct_path_enabled: AtomicBool::new(direct_path_enabled),
        }
    }

    pub fn optimizer_enabled(&self) -> bool {
        self.optimizer_enabled.load(Ordering::Acquire)
    }

    pub fn set_optimizer_enabled(&self, enabled: bool) {
        self.optimizer_enabled.store(enabled, Ordering::Release);
    }

    pub fn direct_path_enabled(&self) -> bool {
        self.direct_path_enabled.load(Ordering::Acquire)
    }

    pub fn set_direct_path_enabled(&self, enabled: bool) {
        self.direct_path_enabled.store(enabled, Ordering::Release);
    }
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self::new(true, true)
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Why a path was chosen
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathReason {
    /// Time-sensitive tier on a healthy fast lane
    UrgentDirect,
    /// Time-sensitive tier, fast lane unusable
    DirectUnavailable,
    /// Medium/low tier on a healthy brokered path
    StandardBrokered,
    /// Medium/low tier, brokered path unusable
    BrokeredUnavailable,
}

impl fmt::Display for PathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UrgentDirect => f.write_str("urgent-direct"),
            Self::DirectUnavailable => f.write_str("direct-unavailable"),
            Self::StandardBrokered => f.write_str("standard-brokered"),
            Self::BrokeredUnavailable => f.write_str("brokered-unavailable"),
        }
    }
}

/// Path and budget for one attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathDecision {
    pub path: RoutePath,
    /// Hard per-attempt timeout
    pub budget: Duration,
    pub reason: PathReason,
}

/// Engine limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HybridConfig {
    /// Cap on any single attempt, whatever the tier budget says
    pub max_attempt_timeout: Duration,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            max_attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// Path selection for request attempts
pub struct HybridRouter {
    circuits: Arc<CircuitBreakerRegistry>,
    toggles: Arc<FeatureToggles>,
    config: RwLock<HybridConfig>,
}

impl HybridRouter {
    /// Create an engine
    pub fn new(
        circuits: Arc<CircuitBreakerRegistry>,
        toggles: Arc<FeatureToggles>,
        config: HybridConfig,
    ) -> Self {
        Self {
            circuits,
            toggles,
            config: RwLock::new(config),
        }
    }

    /// Replace limits
    pub fn set_config(&self, config: HybridConfig) {
        *self.config.write() = config;
    }

    /// Path preference for a tier, most preferred first
    fn preference(&self, tier: UrgencyTier) -> [RoutePath; 2] {
        if tier.is_time_sensitive() {
            [RoutePath::Direct, RoutePath::Brokered]
        } else {
            [RoutePath::Brokered, RoutePath::Direct]
        }
    }

    fn reason(tier: UrgencyTier, path: RoutePath) -> PathReason {
        match (tier.is_time_sensitive(), path) {
            (true, RoutePath::Direct) => PathReason::UrgentDirect,
            (true, RoutePath::Brokered) => PathReason::DirectUnavailable,
            (false, RoutePath::Brokered) => PathReason::StandardBrokered,
            (false, RoutePath::Direct) => PathReason::BrokeredUnavailable,
        }
    }

    /// Whether the path could be used right now (non-consuming)
    pub fn path_admissible(&self, provider: &str, path: RoutePath) -> bool {
        if path == RoutePath::Direct && !self.toggles.direct_path_enabled() {
            return false;
        }
        self.circuits.admits(provider, path)
    }

    /// Whether any path of the provider could be used right now
    pub fn has_admissible_path(&self, provider: &str) -> bool {
        RoutePath::ALL
            .iter()
            .any(|path| self.path_admissible(provider, *path))
    }

    /// Attempt budget for a tier under a rule's thresholds
    pub fn budget(&self, tier: UrgencyTier, thresholds: &UrgencyThresholds) -> Duration {
        thresholds
            .budget(tier)
            .min(self.config.read().max_attempt_timeout)
    }

    /// Preview the decision without touching circuit state
    pub fn decide(
        &self,
        provider: &str,
        tier: UrgencyTier,
        thresholds: &UrgencyThresholds,
    ) -> Option<PathDecision> {
        let budget = self.budget(tier, thresholds);
        self.preference(tier)
            .into_iter()
            .find(|path| self.path_admissible(provider, *path))
            .map(|path| PathDecision {
                path,
                budget,
                reason: Self::reason(tier, path),
            })
    }

    /// Decide and claim the circuit for one attempt
    ///
    /// Consults [`CircuitBreakerRegistry::is_available`] on the chosen
    /// path, which may consume a half-open trial. If another flow won that
    /// trial, the other path is tried. `None` means skip this provider.
    pub fn acquire(
        &self,
        provider: &str,
        tier: UrgencyTier,
        thresholds: &UrgencyThresholds,
    ) -> Option<PathDecision> {
        let budget = self.budget(tier, thresholds);

        for path in self.preference(tier) {
            if path == RoutePath::Direct && !self.toggles.direct_path_enabled() {
                continue;
            }
            if self.circuits.is_available(provider, path) {
                return Some(PathDecision {
                    path,
                    budget,
                    reason: Self::reason(tier, path),
                });
            }
        }
        None
    }
}

impl fmt::Debug for HybridRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridRouter")
            .field("toggles", &self.toggles)
            .field("config", &*self.config.read())
            .finish()
    }
}
