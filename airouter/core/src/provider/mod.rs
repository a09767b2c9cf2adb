//! Provider Adapters
//!
//! Trait definitions for backend language-model providers. This abstraction
//! lets the router work with any provider without branching on provider
//! identity: everything provider-specific (API formats, auth, transport)
//! lives behind [`ProviderAdapter`].
//!
//! The router only ever looks at a provider's declared [`ProviderRole`]
//! (for ordering) and its adapter (for execution).

pub mod http;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::{Request, RoutePath};
use crate::routing::classifier::TaskClass;

pub use http::HttpProviderAdapter;

// ============================================================================
// Provider Identity
// ============================================================================

/// Declared specialisation of a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderRole {
    /// Handles system-level orchestration work
    OrchestratorSpecialist,
    /// Handles ordinary end-user tasks
    UserTaskSpecialist,
    /// Handles marketing / audience analysis
    AudienceSpecialist,
}

impl ProviderRole {
    /// The role that specialises in a task class
    #[must_use]
    pub fn specialist_for(task_class: TaskClass) -> Self {
        match task_class {
            TaskClass::Orchestration => Self::OrchestratorSpecialist,
            TaskClass::EndUser => Self::UserTaskSpecialist,
            TaskClass::Audience => Self::AudienceSpecialist,
        }
    }

    /// The task class this role specialises in
    #[must_use]
    pub fn task_class(&self) -> TaskClass {
        match self {
            Self::OrchestratorSpecialist => TaskClass::Orchestration,
            Self::UserTaskSpecialist => TaskClass::EndUser,
            Self::AudienceSpecialist => TaskClass::Audience,
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrchestratorSpecialist => f.write_str("orchestrator-specialist"),
            Self::UserTaskSpecialist => f.write_str("user-task-specialist"),
            Self::AudienceSpecialist => f.write_str("audience-specialist"),
        }
    }
}

/// Static description of a provider, loaded at startup
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderIdentity {
    /// Stable provider ID
    pub id: String,
    /// Declared role
    pub role: ProviderRole,
    /// Estimated cost of one request (USD), used until telemetry has real costs
    #[serde(default)]
    pub cost_per_request: f64,
}

impl ProviderIdentity {
    /// Create an identity
    pub fn new(id: impl Into<String>, role: ProviderRole) -> Self {
        Self {
            id: id.into(),
            role,
            cost_per_request: 0.0,
        }
    }

    /// Set the estimated cost per request
    #[must_use]
    pub fn with_cost(mut self, cost_per_request: f64) -> Self {
        self.cost_per_request = cost_per_request;
        self
    }
}

// ============================================================================
// Adapter Contract
// ============================================================================

/// Failure classification reported by adapters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderErrorKind {
    /// Provider could not be reached or refused service
    Unavailable,
    /// The call exceeded its budget
    Timeout,
    /// Provider is throttling us
    RateLimited,
    /// Provider refused the content for compliance reasons
    ComplianceBlocked,
    /// Anything else
    Other,
}

impl ProviderErrorKind {
    /// Whether this failure says something about provider health
    ///
    /// Compliance refusals are about the request, not the provider, and
    /// must never open a circuit.
    #[must_use]
    pub fn counts_against_health(&self) -> bool {
        !matches!(self, Self::ComplianceBlocked)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => f.write_str("unavailable"),
            Self::Timeout => f.write_str("timeout"),
            Self::RateLimited => f.write_str("rateLimited"),
            Self::ComplianceBlocked => f.write_str("complianceBlocked"),
            Self::Other => f.write_str("other"),
        }
    }
}

/// Error returned by a provider adapter
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("provider error ({kind}): {message}")]
pub struct ProviderError {
    /// Failure classification
    pub kind: ProviderErrorKind,
    /// Adapter-specific detail (never shown to callers)
    pub message: String,
}

impl ProviderError {
    /// Create an error
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`ProviderErrorKind::Unavailable`]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    /// Shorthand for [`ProviderErrorKind::Timeout`]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }
}

/// Successful provider output
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReply {
    /// Generated content
    pub content: String,
    /// Actual cost of the call (USD), when the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl ProviderReply {
    /// Create a reply without cost information
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            cost_usd: None,
        }
    }
}

/// Provider adapter capability
///
/// Implement this trait once per backend provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Execute a request over the given path
    ///
    /// Implementations should respect `timeout`; the router also enforces it
    /// with a hard deadline.
    async fn execute(
        &self,
        request: &Request,
        path: RoutePath,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError>;

    /// Lightweight synthetic health probe
    ///
    /// The default sends a minimal synthetic request.
    async fn probe(&self, path: RoutePath, timeout: Duration) -> Result<(), ProviderError> {
        let request = Request::new("ping")
            .with_id(format!("probe-{}", uuid::Uuid::new_v4()))
            .with_domain("system")
            .with_intent("health-probe");
        self.execute(&request, path, timeout).await.map(|_| ())
    }
}

// ============================================================================
// Provider Registry
// ============================================================================

/// A registered provider
pub struct ProviderEntry {
    /// Static identity
    pub identity: ProviderIdentity,
    /// Execution capability
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Operator participation toggle
    enabled: AtomicBool,
}

impl ProviderEntry {
    /// Whether the provider currently participates in routing
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("identity", &self.identity)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// All known providers, in registration order
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<Vec<Arc<ProviderEntry>>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a provider
    pub fn register(&self, identity: ProviderIdentity, adapter: Arc<dyn ProviderAdapter>) {
        let entry = Arc::new(ProviderEntry {
            identity,
            adapter,
            enabled: AtomicBool::new(true),
        });

        let mut entries = self.entries.write();
        if let Some(slot) = entries
            .iter_mut()
            .find(|e| e.identity.id == entry.identity.id)
        {
            *slot = entry;
        } else {
            entries.push(entry);
        }
    }

    /// Look up a provider
    pub fn get(&self, provider_id: &str) -> Option<Arc<ProviderEntry>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.identity.id == provider_id)
            .cloned()
    }

    /// Declared role of a provider
    pub fn role_of(&self, provider_id: &str) -> Option<ProviderRole> {
        self.get(provider_id).map(|e| e.identity.role)
    }

    /// First registered provider with the given role
    pub fn specialist(&self, role: ProviderRole) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|e| e.identity.role == role)
            .map(|e| e.identity.id.clone())
    }

    /// All provider IDs in registration order
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.identity.id.clone())
            .collect()
    }

    /// All entries in registration order
    pub fn entries(&self) -> Vec<Arc<ProviderEntry>> {
        self.entries.read().clone()
    }

    /// Whether a provider is registered and enabled
    pub fn is_enabled(&self, provider_id: &str) -> bool {
        self.get(provider_id).is_some_and(|e| e.is_enabled())
    }

    /// Toggle provider participation
    ///
    /// Returns `false` if the provider is unknown.
    pub fn set_enabled(&self, provider_id: &str, enabled: bool) -> bool {
        match self.get(provider_id) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Release);
                tracing::info!(provider = provider_id, enabled, "Provider participation changed");
                true
            }
            None => false,
        }
    }

    /// Static cost estimate for a provider
    pub fn cost_estimate(&self, provider_id: &str) -> f64 {
        self.get(provider_id)
            .map_or(0.0, |e| e.identity.cost_per_request)
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no provider is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ProviderAdapter for Echo {
        async fn execute(
            &self,
            request: &Request,
            _path: RoutePath,
            _timeout: Duration,
        ) -> Result<ProviderReply, ProviderError> {
            Ok(ProviderReply::new(request.prompt.clone()))
        }
    }

    #[test]
    fn test_role_task_class_mapping() {
        for class in TaskClass::ALL {
            assert_eq!(ProviderRole::specialist_for(class).task_class(), class);
        }
    }

    #[test]
    fn test_compliance_does_not_count_against_health() {
        assert!(!ProviderErrorKind::ComplianceBlocked.counts_against_health());
        assert!(ProviderErrorKind::Timeout.counts_against_health());
        assert!(ProviderErrorKind::RateLimited.counts_against_health());
    }

    #[test]
    fn test_registry_order_and_toggle() {
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderIdentity::new("atlas", ProviderRole::OrchestratorSpecialist),
            Arc::new(Echo),
        );
        registry.register(
            ProviderIdentity::new("sage", ProviderRole::UserTaskSpecialist),
            Arc::new(Echo),
        );

        assert_eq!(registry.ids(), vec!["atlas", "sage"]);
        assert_eq!(
            registry.specialist(ProviderRole::UserTaskSpecialist),
            Some("sage".to_string())
        );

        assert!(registry.set_enabled("sage", false));
        assert!(!registry.is_enabled("sage"));
        assert!(!registry.set_enabled("ghost", false));

        // Re-registering keeps position
        registry.register(
            ProviderIdentity::new("atlas", ProviderRole::OrchestratorSpecialist).with_cost(0.02),
            Arc::new(Echo),
        );
        assert_eq!(registry.ids(), vec!["atlas", "sage"]);
        assert!((registry.cost_estimate("atlas") - 0.02).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_default_probe_executes() {
        let adapter = Echo;
        assert!(adapter
            .probe(RoutePath::Direct, Duration::from_secs(1))
            .await
            .is_ok());
    }
}
