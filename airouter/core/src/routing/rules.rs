//! Versioned Routing Rules
//!
//! Exactly one active [`RuleVersion`] per [`TaskClass`] at all times.
//! Writers (the optimizer, the health monitor and operators) replace the
//! active version with an atomic swap of an `Arc`; readers clone the `Arc`
//! and never see a partially updated rule. The superseded version is kept
//! as the rollback target until the next successful swap.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{ProviderRegistry, ProviderRole};
use crate::request::UrgencyTier;
use crate::routing::classifier::TaskClass;
use crate::sinks::{AuditEvent, AuditEventType, AuditSink};

/// Versions kept per class for inspection
const HISTORY_LIMIT: usize = 32;

// ============================================================================
// Rule
// ============================================================================

/// Latency budget per urgency tier (ms)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrgencyThresholds {
    pub emergency_ms: u64,
    pub critical_ms: u64,
    pub high_ms: u64,
    pub medium_ms: u64,
    pub low_ms: u64,
}

impl Default for UrgencyThresholds {
    fn default() -> Self {
        Self {
            emergency_ms: UrgencyTier::Emergency.default_budget().as_millis() as u64,
            critical_ms: UrgencyTier::Critical.default_budget().as_millis() as u64,
            high_ms: UrgencyTier::High.default_budget().as_millis() as u64,
            medium_ms: UrgencyTier::Medium.default_budget().as_millis() as u64,
            low_ms: UrgencyTier::Low.default_budget().as_millis() as u64,
        }
    }
}

impl UrgencyThresholds {
    /// Budget of a tier
    #[must_use]
    pub fn budget(&self, tier: UrgencyTier) -> Duration {
        Duration::from_millis(self.get(tier))
    }

    /// Budget of a tier in ms
    #[must_use]
    pub fn get(&self, tier: UrgencyTier) -> u64 {
        match tier {
            UrgencyTier::Emergency => self.emergency_ms,
            UrgencyTier::Critical => self.critical_ms,
            UrgencyTier::High => self.high_ms,
            UrgencyTier::Medium => self.medium_ms,
            UrgencyTier::Low => self.low_ms,
        }
    }

    /// Set the budget of a tier in ms
    pub fn set(&mut self, tier: UrgencyTier, ms: u64) {
        match tier {
            UrgencyTier::Emergency => self.emergency_ms = ms,
            UrgencyTier::Critical => self.critical_ms = ms,
            UrgencyTier::High => self.high_ms = ms,
            UrgencyTier::Medium => self.medium_ms = ms,
            UrgencyTier::Low => self.low_ms = ms,
        }
    }
}

/// Ordered provider chain and urgency budgets for one task class
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub task_class: TaskClass,
    pub ordered_provider_chain: Vec<String>,
    #[serde(default)]
    pub urgency_thresholds: UrgencyThresholds,
}

impl RoutingRule {
    /// Create a rule with default thresholds
    pub fn new(task_class: TaskClass, chain: Vec<String>) -> Self {
        Self {
            task_class,
            ordered_provider_chain: chain,
            urgency_thresholds: UrgencyThresholds::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), RuleError> {
        if self.ordered_provider_chain.is_empty() {
            return Err(RuleError::EmptyChain(self.task_class));
        }
        let mut seen = HashSet::new();
        for provider in &self.ordered_provider_chain {
            if !seen.insert(provider.as_str()) {
                return Err(RuleError::DuplicateProvider {
                    task_class: self.task_class,
                    provider: provider.clone(),
                });
            }
        }
        if UrgencyTier::ALL
            .iter()
            .any(|tier| self.urgency_thresholds.get(*tier) == 0)
        {
            return Err(RuleError::ZeroThreshold(self.task_class));
        }
        Ok(())
    }
}

/// Who produced a rule version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAuthor {
    /// Initial rules at startup
    Bootstrap,
    /// Manual operator change
    Operator,
    /// Health monitor demotion
    HealthMonitor,
    /// Optimizer recommendation
    Optimizer,
    /// Automatic revert
    Rollback,
}

impl fmt::Display for RuleAuthor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrap => f.write_str("bootstrap"),
            Self::Operator => f.write_str("operator"),
            Self::HealthMonitor => f.write_str("health-monitor"),
            Self::Optimizer => f.write_str("optimizer"),
            Self::Rollback => f.write_str("rollback"),
        }
    }
}

/// An immutable, numbered rule
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleVersion {
    /// Globally unique, increasing
    pub version: u64,
    pub rule: RoutingRule,
    /// Version this one superseded
    pub previous_version: Option<u64>,
    pub author: RuleAuthor,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

/// Rule store misuse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("no rule supplied for task class {0}")]
    MissingTaskClass(TaskClass),

    #[error("rule for {0} has an empty provider chain")]
    EmptyChain(TaskClass),

    #[error("rule for {task_class} lists provider {provider} twice")]
    DuplicateProvider {
        task_class: TaskClass,
        provider: String,
    },

    #[error("rule for {0} has a zero urgency threshold")]
    ZeroThreshold(TaskClass),

    #[error("active rule for {task_class} is version {actual}, expected {expected}")]
    VersionConflict {
        task_class: TaskClass,
        expected: u64,
        actual: u64,
    },

    #[error("no previous rule version for {0}")]
    NothingToRollBack(TaskClass),
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug)]
struct RuleSlot {
    active: Arc<RuleVersion>,
    previous: Option<Arc<RuleVersion>>,
    history: VecDeque<Arc<RuleVersion>>,
}

/// Holder of the active rule for every task class
pub struct RuleStore {
    slots: [RwLock<RuleSlot>; 3],
    next_version: AtomicU64,
    audit: Arc<dyn AuditSink>,
}

impl RuleStore {
    /// Build a store from one rule per task class
    pub fn from_rules(rules: Vec<RoutingRule>, audit: Arc<dyn AuditSink>) -> Result<Self, RuleError> {
        let next_version = AtomicU64::new(1);
        let mut initial: [Option<RoutingRule>; 3] = Default::default();

        for rule in rules {
            rule.validate()?;
            let idx = slot_index(rule.task_class);
            initial[idx] = Some(rule);
        }

        let mut make_slot = |class: TaskClass| -> Result<RwLock<RuleSlot>, RuleError> {
            let rule = initial[slot_index(class)]
                .take()
                .ok_or(RuleError::MissingTaskClass(class))?;
            let version = Arc::new(RuleVersion {
                version: next_version.fetch_add(1, Ordering::AcqRel),
                rule,
                previous_version: None,
                author: RuleAuthor::Bootstrap,
                reason: "initial rule".into(),
                created_at: Utc::now(),
            });
            let mut history = VecDeque::new();
            history.push_back(version.clone());
            Ok(RwLock::new(RuleSlot {
                active: version,
                previous: None,
                history,
            }))
        };

        let slots = [
            make_slot(TaskClass::Orchestration)?,
            make_slot(TaskClass::EndUser)?,
            make_slot(TaskClass::Audience)?,
        ];

        Ok(Self {
            slots,
            next_version,
            audit,
        })
    }

    /// Default rules: the class specialist first, then every other provider
    /// in registration order
    pub fn with_defaults(registry: &ProviderRegistry, audit: Arc<dyn AuditSink>) -> Result<Self, RuleError> {
        Self::from_rules(default_rules(registry), audit)
    }

    /// Active rule of a class
    pub fn active(&self, task_class: TaskClass) -> Arc<RuleVersion> {
        self.slot(task_class).read().active.clone()
    }

    /// Rollback target of a class
    pub fn previous(&self, task_class: TaskClass) -> Option<Arc<RuleVersion>> {
        self.slot(task_class).read().previous.clone()
    }

    /// Recent versions of a class, oldest first
    pub fn history(&self, task_class: TaskClass) -> Vec<Arc<RuleVersion>> {
        self.slot(task_class).read().history.iter().cloned().collect()
    }

    /// Replace the active rule of `rule.task_class`
    pub fn swap(
        &self,
        rule: RoutingRule,
        author: RuleAuthor,
        reason: impl Into<String>,
    ) -> Result<Arc<RuleVersion>, RuleError> {
        self.swap_inner(rule, author, reason.into(), None)
    }

    /// Replace the active rule only if it is still `expected_version`
    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        rule: RoutingRule,
        author: RuleAuthor,
        reason: impl Into<String>,
    ) -> Result<Arc<RuleVersion>, RuleError> {
        self.swap_inner(rule, author, reason.into(), Some(expected_version))
    }

    fn swap_inner(
        &self,
        rule: RoutingRule,
        author: RuleAuthor,
        reason: String,
        expected: Option<u64>,
    ) -> Result<Arc<RuleVersion>, RuleError> {
        rule.validate()?;
        let task_class = rule.task_class;

        let version = {
            let mut slot = self.slot(task_class).write();
            if let Some(expected) = expected {
                if slot.active.version != expected {
                    return Err(RuleError::VersionConflict {
                        task_class,
                        expected,
                        actual: slot.active.version,
                    });
                }
            }

            let version = Arc::new(RuleVersion {
                version: self.next_version.fetch_add(1, Ordering::AcqRel),
                rule,
                previous_version: Some(slot.active.version),
                author,
                reason,
                created_at: Utc::now(),
            });
            let superseded = std::mem::replace(&mut slot.active, version.clone());
            slot.previous = Some(superseded);
            slot.history.push_back(version.clone());
            while slot.history.len() > HISTORY_LIMIT {
                slot.history.pop_front();
            }
            version
        };

        tracing::info!(
            task_class = %task_class,
            version = version.version,
            previous = ?version.previous_version,
            author = %version.author,
            chain = ?version.rule.ordered_provider_chain,
            "Routing rule swapped"
        );
        self.audit.emit(AuditEvent::new(
            AuditEventType::RuleSwapped,
            serde_json::json!({
                "taskClass": task_class,
                "version": version.version,
                "previousVersion": version.previous_version,
                "author": version.author,
                "reason": version.reason,
                "chain": version.rule.ordered_provider_chain,
                "thresholds": version.rule.urgency_thresholds,
            }),
        ));
        Ok(version)
    }

    /// Restore the rollback target of a class
    ///
    /// With `expected_active`, the rollback only happens if the active
    /// version is still the one the caller wants to undo. The restored
    /// version becomes active again under its original number and the
    /// class has no rollback target until the next swap.
    pub fn rollback(
        &self,
        task_class: TaskClass,
        expected_active: Option<u64>,
        reason: impl Into<String>,
    ) -> Result<Arc<RuleVersion>, RuleError> {
        let reason = reason.into();

        let (restored, undone) = {
            let mut slot = self.slot(task_class).write();
            if let Some(expected) = expected_active {
                if slot.active.version != expected {
                    return Err(RuleError::VersionConflict {
                        task_class,
                        expected,
                        actual: slot.active.version,
                    });
                }
            }
            let previous = slot
                .previous
                .take()
                .ok_or(RuleError::NothingToRollBack(task_class))?;
            let undone = std::mem::replace(&mut slot.active, previous.clone());
            slot.history.push_back(previous.clone());
            while slot.history.len() > HISTORY_LIMIT {
                slot.history.pop_front();
            }
            (previous, undone)
        };

        tracing::warn!(
            task_class = %task_class,
            restored = restored.version,
            undone = undone.version,
            reason = %reason,
            "Routing rule rolled back"
        );
        self.audit.emit(AuditEvent::new(
            AuditEventType::RuleRolledBack,
            serde_json::json!({
                "taskClass": task_class,
                "restoredVersion": restored.version,
                "undoneVersion": undone.version,
                "author": RuleAuthor::Rollback,
                "reason": reason,
            }),
        ));
        Ok(restored)
    }

    fn slot(&self, task_class: TaskClass) -> &RwLock<RuleSlot> {
        &self.slots[slot_index(task_class)]
    }
}

impl fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RuleStore");
        for class in TaskClass::ALL {
            d.field(class.as_str(), &self.active(class).version);
        }
        d.finish()
    }
}

fn slot_index(task_class: TaskClass) -> usize {
    match task_class {
        TaskClass::Orchestration => 0,
        TaskClass::EndUser => 1,
        TaskClass::Audience => 2,
    }
}

/// Specialist-first chains for every class
pub fn default_rules(registry: &ProviderRegistry) -> Vec<RoutingRule> {
    let ids = registry.ids();

    TaskClass::ALL
        .into_iter()
        .map(|class| {
            let specialist = registry.specialist(ProviderRole::specialist_for(class));
            let mut chain: Vec<String> = specialist.iter().cloned().collect();
            chain.extend(ids.iter().filter(|id| Some(*id) != specialist.as_ref()).cloned());
            RoutingRule::new(class, chain)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderIdentity;
    use crate::routing::test_utils::{three_provider_registry, MemoryAuditSink};

    fn store() -> (RuleStore, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let registry = three_provider_registry();
        (RuleStore::with_defaults(&registry, audit.clone()).unwrap(), audit)
    }

    #[test]
    fn test_default_chains_are_specialist_first() {
        let (store, _) = store();

        assert_eq!(
            store.active(TaskClass::Orchestration).rule.ordered_provider_chain,
            vec!["atlas", "sage", "echo"]
        );
        assert_eq!(
            store.active(TaskClass::EndUser).rule.ordered_provider_chain,
            vec!["sage", "atlas", "echo"]
        );
        assert_eq!(
            store.active(TaskClass::Audience).rule.ordered_provider_chain,
            vec!["echo", "atlas", "sage"]
        );
    }

    #[test]
    fn test_swap_retains_previous() {
        let (store, audit) = store();
        let before = store.active(TaskClass::EndUser);

        let rule = RoutingRule::new(
            TaskClass::EndUser,
            vec!["sage".into(), "echo".into(), "atlas".into()],
        );
        let after = store.swap(rule, RuleAuthor::Operator, "test").unwrap();

        assert!(after.version > before.version);
        assert_eq!(after.previous_version, Some(before.version));
        assert_eq!(store.previous(TaskClass::EndUser).unwrap().version, before.version);
        assert_eq!(audit.count(AuditEventType::RuleSwapped), 1);
    }

    #[test]
    fn test_rollback_restores_exact_version() {
        let (store, audit) = store();
        let original = store.active(TaskClass::Audience);

        let rule = RoutingRule::new(
            TaskClass::Audience,
            vec!["echo".into(), "sage".into(), "atlas".into()],
        );
        let applied = store.swap(rule, RuleAuthor::Optimizer, "reorder").unwrap();

        let restored = store
            .rollback(TaskClass::Audience, Some(applied.version), "regression")
            .unwrap();
        assert!(Arc::ptr_eq(&restored, &original));
        assert_eq!(store.active(TaskClass::Audience).version, original.version);
        assert!(store.previous(TaskClass::Audience).is_none());
        assert_eq!(audit.count(AuditEventType::RuleRolledBack), 1);

        assert_eq!(
            store.rollback(TaskClass::Audience, None, "again"),
            Err(RuleError::NothingToRollBack(TaskClass::Audience))
        );
    }

    #[test]
    fn test_compare_and_swap_conflict() {
        let (store, _) = store();
        let active = store.active(TaskClass::EndUser).version;
        let rule = store.active(TaskClass::EndUser).rule.clone();

        store
            .swap(rule.clone(), RuleAuthor::HealthMonitor, "demote")
            .unwrap();
        let err = store
            .compare_and_swap(active, rule, RuleAuthor::Optimizer, "stale")
            .unwrap_err();
        assert!(matches!(err, RuleError::VersionConflict { .. }));
    }

    #[test]
    fn test_validation() {
        let (store, _) = store();

        let empty = RoutingRule::new(TaskClass::EndUser, vec![]);
        assert_eq!(
            store.swap(empty, RuleAuthor::Operator, "bad"),
            Err(RuleError::EmptyChain(TaskClass::EndUser))
        );

        let dup = RoutingRule::new(TaskClass::EndUser, vec!["sage".into(), "sage".into()]);
        assert!(matches!(
            store.swap(dup, RuleAuthor::Operator, "bad"),
            Err(RuleError::DuplicateProvider { .. })
        ));

        let mut zero = RoutingRule::new(TaskClass::EndUser, vec!["sage".into()]);
        zero.urgency_thresholds.set(UrgencyTier::High, 0);
        assert_eq!(
            store.swap(zero, RuleAuthor::Operator, "bad"),
            Err(RuleError::ZeroThreshold(TaskClass::EndUser))
        );
    }

    #[test]
    fn test_from_rules_requires_every_class() {
        let rules = vec![RoutingRule::new(TaskClass::EndUser, vec!["sage".into()])];
        let err = RuleStore::from_rules(rules, Arc::new(MemoryAuditSink::new())).unwrap_err();
        assert_eq!(err, RuleError::MissingTaskClass(TaskClass::Orchestration));
    }

    #[test]
    fn test_empty_registry_has_no_defaults() {
        let registry = ProviderRegistry::new();
        let err = RuleStore::with_defaults(&registry, Arc::new(MemoryAuditSink::new())).unwrap_err();
        assert!(matches!(err, RuleError::EmptyChain(_)));
    }

    #[test]
    fn test_default_rules_without_specialist() {
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderIdentity::new("solo", ProviderRole::UserTaskSpecialist),
            Arc::new(crate::routing::test_utils::MockProvider::new("solo")),
        );

        let rules = default_rules(&registry);
        assert!(rules.iter().all(|r| r.ordered_provider_chain == vec!["solo"]));
    }
}
