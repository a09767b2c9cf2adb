//! Request and Response Contracts
//!
//! Types exchanged with the web-application layer. A [`Request`] is created
//! at ingress, classified once, and discarded after the terminal
//! [`Response`] (or terminal error) is produced.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Urgency
// ============================================================================

/// Caller-declared urgency tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyTier {
    /// Must answer within 5s
    Emergency,
    /// Must answer within 10s
    Critical,
    /// Must answer within 15s
    High,
    /// Must answer within 30s
    #[default]
    Medium,
    /// Must answer within 60s
    Low,
}

impl UrgencyTier {
    /// All tiers, most urgent first
    pub const ALL: [UrgencyTier; 5] = [
        Self::Emergency,
        Self::Critical,
        Self::High,
        Self::Medium,
        Self::Low,
    ];

    /// Default maximum acceptable latency for this tier
    #[must_use]
    pub fn default_budget(&self) -> Duration {
        match self {
            Self::Emergency => Duration::from_secs(5),
            Self::Critical => Duration::from_secs(10),
            Self::High => Duration::from_secs(15),
            Self::Medium => Duration::from_secs(30),
            Self::Low => Duration::from_secs(60),
        }
    }

    /// Whether the tier prefers the direct fast lane
    #[must_use]
    pub fn is_time_sensitive(&self) -> bool {
        matches!(self, Self::Emergency | Self::Critical | Self::High)
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for UrgencyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Request
// ============================================================================

/// A tool the caller wants the provider to be able to call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name
    pub name: String,
    /// Optional human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolSpec {
    /// Create a tool spec with just a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// Inbound AI request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Unique request ID
    pub id: String,
    /// Prompt text
    pub prompt: String,
    /// Business domain (e.g. "culinary", "marketing", "system")
    pub domain: String,
    /// Caller intent (e.g. "analysis", "orchestration")
    pub intent: String,
    /// Provider the caller would like to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_provider_hint: Option<String>,
    /// Urgency tier
    #[serde(default)]
    pub urgency_tier: UrgencyTier,
    /// Tools the provider may call
    #[serde(default)]
    pub tools_requested: Vec<ToolSpec>,
}

impl Request {
    /// Create a request with a fresh ID and the given prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            domain: String::new(),
            intent: String::new(),
            explicit_provider_hint: None,
            urgency_tier: UrgencyTier::default(),
            tools_requested: Vec::new(),
        }
    }

    /// Set the ID
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the domain
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the intent
    #[must_use]
    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = intent.into();
        self
    }

    /// Ask for a specific provider
    #[must_use]
    pub fn with_provider_hint(mut self, provider: impl Into<String>) -> Self {
        self.explicit_provider_hint = Some(provider.into());
        self
    }

    /// Set urgency
    #[must_use]
    pub fn with_urgency(mut self, tier: UrgencyTier) -> Self {
        self.urgency_tier = tier;
        self
    }

    /// Request a tool
    #[must_use]
    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools_requested.push(tool);
        self
    }
}

// ============================================================================
// Response
// ============================================================================

/// The two ways of reaching a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePath {
    /// Low-overhead provider-specific fast lane
    Direct,
    /// Feature-rich intermediary (queuing, negotiation)
    Brokered,
}

impl RoutePath {
    /// Both paths
    pub const ALL: [RoutePath; 2] = [Self::Direct, Self::Brokered];

    /// The other path
    #[must_use]
    pub fn other(&self) -> Self {
        match self {
            Self::Direct => Self::Brokered,
            Self::Brokered => Self::Direct,
        }
    }
}

impl fmt::Display for RoutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Brokered => f.write_str("brokered"),
        }
    }
}

/// Terminal outcome reported to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// A provider served the request
    Success,
    /// No provider could serve the request
    Error,
}

/// Caller-visible error kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// No eligible provider could serve the request
    AllProvidersExhausted,
    /// The request could not be parsed
    InvalidRequest,
}

/// Response returned to the web-application layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// ID of the request this answers
    pub request_id: String,
    /// Provider that produced the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<String>,
    /// Path used to reach the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<RoutePath>,
    /// End-to-end latency including fallbacks
    pub latency_ms: u64,
    /// Success or error
    pub outcome: Outcome,
    /// Present when `outcome == Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Provider output
    #[serde(default)]
    pub content: String,
}

impl Response {
    /// Build a success response
    pub fn success(
        request_id: impl Into<String>,
        provider: impl Into<String>,
        path: RoutePath,
        latency_ms: u64,
        content: String,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            provider_used: Some(provider.into()),
            path: Some(path),
            latency_ms,
            outcome: Outcome::Success,
            error_kind: None,
            content,
        }
    }

    /// Build a terminal error response
    pub fn error(request_id: impl Into<String>, kind: ErrorKind, latency_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            provider_used: None,
            path: None,
            latency_ms,
            outcome: Outcome::Error,
            error_kind: Some(kind),
            content: String::new(),
        }
    }

    /// Whether a provider served the request
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urgency_budgets() {
        assert_eq!(UrgencyTier::Emergency.default_budget(), Duration::from_secs(5));
        assert_eq!(UrgencyTier::Low.default_budget(), Duration::from_secs(60));
        assert!(UrgencyTier::High.is_time_sensitive());
        assert!(!UrgencyTier::Medium.is_time_sensitive());
    }

    #[test]
    fn test_request_wire_format() {
        let json = r#"{
            "id": "req-1",
            "prompt": "Summarize reviews",
            "domain": "culinary",
            "intent": "analysis",
            "urgencyTier": "medium",
            "toolsRequested": [{"name": "search"}]
        }"#;

        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request.id, "req-1");
        assert_eq!(request.urgency_tier, UrgencyTier::Medium);
        assert!(request.explicit_provider_hint.is_none());
        assert_eq!(request.tools_requested, vec![ToolSpec::new("search")]);
    }

    #[test]
    fn test_missing_urgency_defaults_to_medium() {
        assert_eq!(UrgencyTier::default(), UrgencyTier::Medium);

        let request: Request =
            serde_json::from_str(r#"{"id":"r","prompt":"p","domain":"culinary","intent":"qa"}"#)
                .unwrap();
        assert_eq!(request.urgency_tier, UrgencyTier::Medium);
        assert_eq!(request.urgency_tier.default_budget(), Duration::from_secs(30));
    }

    #[test]
    fn test_error_response_omits_provider() {
        let response = Response::error("req-9", ErrorKind::AllProvidersExhausted, 12);
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["outcome"], "error");
        assert_eq!(value["errorKind"], "allProvidersExhausted");
        assert!(value.get("providerUsed").is_none());
        assert!(value.get("path").is_none());
    }
}
