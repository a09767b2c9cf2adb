//! Provider Ordering Policy
//!
//! Turns the active [`RoutingRule`](crate::routing::rules::RoutingRule) of a
//! task class into the candidate chain for one request.
//!
//! # Ordering Flow
//!
//! ```text
//! 1. Start from the active rule's chain
//! 2. Pin the class specialist first (pinned classes only)
//! 3. Apply the explicit hint: matching role -> primary,
//!                             other role    -> first alternate
//! 4. Drop disabled / unknown providers
//! 5. Drop providers the compliance gate rejects (no circuit impact)
//! 6. Drop providers with no admissible path
//! 7. Nothing left -> AllProvidersUnavailable
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::compliance::ComplianceGate;
use crate::provider::{ProviderRegistry, ProviderRole};
use crate::request::Request;
use crate::routing::classifier::TaskClass;
use crate::routing::hybrid::HybridRouter;
use crate::routing::rules::{RuleStore, UrgencyThresholds};

/// Why a provider left the chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExclusionReason {
    /// Not registered
    Unknown,
    /// Participation switched off
    Disabled,
    /// Compliance gate rejected it
    Compliance,
    /// No path admits traffic
    CircuitOpen,
}

/// A provider removed from a request's chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub provider: String,
    pub reason: ExclusionReason,
}

/// Ordered candidates for one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateChain {
    pub task_class: TaskClass,
    /// Rule version the chain was derived from
    pub rule_version: u64,
    pub thresholds: UrgencyThresholds,
    /// Providers to try, in order
    pub providers: Vec<String>,
    pub excluded: Vec<Exclusion>,
}

impl CandidateChain {
    /// First candidate
    pub fn primary(&self) -> Option<&str> {
        self.providers.first().map(String::as_str)
    }

    /// Providers removed for a given reason
    pub fn excluded_for(&self, reason: ExclusionReason) -> impl Iterator<Item = &str> {
        self.excluded
            .iter()
            .filter(move |e| e.reason == reason)
            .map(|e| e.provider.as_str())
    }
}

/// No candidate survived ordering
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("all providers unavailable for {task_class}")]
pub struct AllProvidersUnavailable {
    pub task_class: TaskClass,
    pub rule_version: u64,
    pub excluded: Vec<Exclusion>,
}

/// Candidate chain builder
pub struct ProviderOrderingPolicy {
    registry: Arc<ProviderRegistry>,
    rules: Arc<RuleStore>,
    hybrid: Arc<HybridRouter>,
    compliance: Arc<dyn ComplianceGate>,
    pinned: RwLock<HashSet<TaskClass>>,
}

impl ProviderOrderingPolicy {
    /// Create a policy
    pub fn new(
        registry: Arc<ProviderRegistry>,
        rules: Arc<RuleStore>,
        hybrid: Arc<HybridRouter>,
        compliance: Arc<dyn ComplianceGate>,
        pinned: impl IntoIterator<Item = TaskClass>,
    ) -> Self {
        Self {
            registry,
            rules,
            hybrid,
            compliance,
            pinned: RwLock::new(pinned.into_iter().collect()),
        }
    }

    /// Classes whose specialist always leads the chain
    pub fn pinned(&self) -> HashSet<TaskClass> {
        self.pinned.read().clone()
    }

    /// Whether a class is pinned
    pub fn is_pinned(&self, task_class: TaskClass) -> bool {
        self.pinned.read().contains(&task_class)
    }

    /// Replace the pinned classes
    pub fn set_pinned(&self, pinned: impl IntoIterator<Item = TaskClass>) {
        *self.pinned.write() = pinned.into_iter().collect();
    }

    /// Build the candidate chain for a classified request
    pub fn order(
        &self,
        request: &Request,
        task_class: TaskClass,
    ) -> Result<CandidateChain, AllProvidersUnavailable> {
        let rule = self.rules.active(task_class);
        let mut chain = rule.rule.ordered_provider_chain.clone();
        let specialist_role = ProviderRole::specialist_for(task_class);

        if self.is_pinned(task_class) {
            if let Some(specialist) = self.registry.specialist(specialist_role) {
                move_to(&mut chain, &specialist, 0);
            }
        }

        if let Some(hint) = request.explicit_provider_hint.as_deref() {
            match self.registry.role_of(hint) {
                Some(role) if role == specialist_role => move_to(&mut chain, hint, 0),
                // Never ahead of the primary
                Some(_) => move_to(&mut chain, hint, 1),
                None => tracing::debug!(
                    request_id = %request.id,
                    hint,
                    "Ignoring hint for unknown provider"
                ),
            }
        }

        let mut providers = Vec::with_capacity(chain.len());
        let mut excluded = Vec::new();
        for provider in chain {
            let reason = match self.registry.get(&provider) {
                None => Some(ExclusionReason::Unknown),
                Some(entry) if !entry.is_enabled() => Some(ExclusionReason::Disabled),
                Some(_) if !self.compliance.is_compliant(request, &provider) => {
                    Some(ExclusionReason::Compliance)
                }
                Some(_) if !self.hybrid.has_admissible_path(&provider) => {
                    Some(ExclusionReason::CircuitOpen)
                }
                Some(_) => None,
            };

            match reason {
                Some(reason) => excluded.push(Exclusion { provider, reason }),
                None => providers.push(provider),
            }
        }

        if providers.is_empty() {
            return Err(AllProvidersUnavailable {
                task_class,
                rule_version: rule.version,
                excluded,
            });
        }

        Ok(CandidateChain {
            task_class,
            rule_version: rule.version,
            thresholds: rule.rule.urgency_thresholds,
            providers,
            excluded,
        })
    }
}

impl fmt::Debug for ProviderOrderingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderOrderingPolicy")
            .field("pinned", &self.pinned())
            .finish()
    }
}

/// Move (or insert) `provider` to index `pos`
fn move_to(chain: &mut Vec<String>, provider: &str, pos: usize) {
    if let Some(current) = chain.iter().position(|p| p == provider) {
        chain.remove(current);
    }
    let pos = pos.min(chain.len());
    chain.insert(pos, provider.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compliance::{AllowAll, DomainBlocklist};
    use crate::request::RoutePath;
    use crate::routing::circuit::{BreakerConfig, CircuitBreakerRegistry, CircuitState};
    use crate::routing::hybrid::{FeatureToggles, HybridConfig};
    use crate::routing::rules::{RoutingRule, RuleAuthor};
    use crate::routing::test_utils::{three_provider_registry, MemoryAuditSink};

    struct Fixture {
        policy: ProviderOrderingPolicy,
        registry: Arc<ProviderRegistry>,
        circuits: Arc<CircuitBreakerRegistry>,
        rules: Arc<RuleStore>,
    }

    fn fixture_with(compliance: Arc<dyn ComplianceGate>) -> Fixture {
        let audit = Arc::new(MemoryAuditSink::new());
        let registry = Arc::new(three_provider_registry());
        let circuits = Arc::new(CircuitBreakerRegistry::new(
            BreakerConfig::default(),
            Arc::new(ManualClock::new(1)),
            audit.clone(),
        ));
        let hybrid = Arc::new(HybridRouter::new(
            circuits.clone(),
            Arc::new(FeatureToggles::default()),
            HybridConfig::default(),
        ));
        let rules = Arc::new(RuleStore::with_defaults(&registry, audit).unwrap());
        let policy = ProviderOrderingPolicy::new(
            registry.clone(),
            rules.clone(),
            hybrid,
            compliance,
            [TaskClass::Orchestration, TaskClass::Audience],
        );
        Fixture {
            policy,
            registry,
            circuits,
            rules,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(AllowAll))
    }

    #[test]
    fn test_specialist_first_per_class() {
        let f = fixture();
        let request = Request::new("x");

        for (class, expected) in [
            (TaskClass::Orchestration, "atlas"),
            (TaskClass::EndUser, "sage"),
            (TaskClass::Audience, "echo"),
        ] {
            let chain = f.policy.order(&request, class).unwrap();
            assert_eq!(chain.primary(), Some(expected));
            assert_eq!(chain.providers.len(), 3);
        }
    }

    #[test]
    fn test_pinning_survives_reordered_rule() {
        let f = fixture();
        f.rules
            .swap(
                RoutingRule::new(
                    TaskClass::Audience,
                    vec!["sage".into(), "atlas".into(), "echo".into()],
                ),
                RuleAuthor::Operator,
                "test",
            )
            .unwrap();

        let chain = f.policy.order(&Request::new("x"), TaskClass::Audience).unwrap();
        assert_eq!(chain.providers, vec!["echo", "sage", "atlas"]);
    }

    #[test]
    fn test_matching_hint_is_forced_primary() {
        let f = fixture();
        f.rules
            .swap(
                RoutingRule::new(
                    TaskClass::EndUser,
                    vec!["atlas".into(), "echo".into(), "sage".into()],
                ),
                RuleAuthor::Operator,
                "test",
            )
            .unwrap();

        let request = Request::new("x").with_provider_hint("sage");
        let chain = f.policy.order(&request, TaskClass::EndUser).unwrap();
        assert_eq!(chain.providers, vec!["sage", "atlas", "echo"]);
    }

    #[test]
    fn test_mismatched_hint_is_first_alternate() {
        let f = fixture();
        let request = Request::new("x").with_provider_hint("atlas");

        let chain = f.policy.order(&request, TaskClass::Audience).unwrap();
        assert_eq!(chain.providers, vec!["echo", "atlas", "sage"]);

        let request = Request::new("x").with_provider_hint("echo");
        let chain = f.policy.order(&request, TaskClass::Orchestration).unwrap();
        assert_eq!(chain.primary(), Some("atlas"));
        assert_eq!(chain.providers[1], "echo");
    }

    #[test]
    fn test_unknown_hint_ignored() {
        let f = fixture();
        let request = Request::new("x").with_provider_hint("ghost");
        let chain = f.policy.order(&request, TaskClass::EndUser).unwrap();
        assert_eq!(chain.providers, vec!["sage", "atlas", "echo"]);
    }

    #[test]
    fn test_compliance_rejection_does_not_touch_circuits() {
        let gate = Arc::new(DomainBlocklist::new());
        gate.block("culinary", "sage");
        let f = fixture_with(gate);

        let request = Request::new("x").with_domain("culinary");
        let chain = f.policy.order(&request, TaskClass::EndUser).unwrap();

        assert_eq!(chain.providers, vec!["atlas", "echo"]);
        assert_eq!(
            chain.excluded_for(ExclusionReason::Compliance).collect::<Vec<_>>(),
            vec!["sage"]
        );
        assert_eq!(f.circuits.state("sage", RoutePath::Brokered), CircuitState::Closed);
        assert_eq!(f.circuits.consecutive_failures("sage", RoutePath::Brokered), 0);
    }

    #[test]
    fn test_open_and_disabled_providers_dropped() {
        let f = fixture();
        f.circuits.force_open_provider("atlas");
        f.registry.set_enabled("echo", false);

        let chain = f
            .policy
            .order(&Request::new("x"), TaskClass::Orchestration)
            .unwrap();
        assert_eq!(chain.providers, vec!["sage"]);
        assert_eq!(chain.excluded.len(), 2);
    }

    #[test]
    fn test_single_open_path_keeps_provider() {
        let f = fixture();
        f.circuits
            .force_state("atlas", RoutePath::Direct, CircuitState::Open);

        let chain = f
            .policy
            .order(&Request::new("x"), TaskClass::Orchestration)
            .unwrap();
        assert_eq!(chain.primary(), Some("atlas"));
    }

    #[test]
    fn test_empty_chain_is_explicit() {
        let f = fixture();
        for id in ["atlas", "sage", "echo"] {
            f.circuits.force_open_provider(id);
        }

        let err = f
            .policy
            .order(&Request::new("x"), TaskClass::EndUser)
            .unwrap_err();
        assert_eq!(err.task_class, TaskClass::EndUser);
        assert_eq!(err.excluded.len(), 3);
    }

    #[test]
    fn test_move_to() {
        let mut chain = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        move_to(&mut chain, "c", 0);
        assert_eq!(chain, vec!["c", "a", "b"]);
        move_to(&mut chain, "d", 1);
        assert_eq!(chain, vec!["c", "d", "a", "b"]);
        move_to(&mut chain, "c", 10);
        assert_eq!(chain, vec!["d", "a", "b", "c"]);
    }
}
