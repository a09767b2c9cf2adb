//! Task Classifier
//!
//! Maps a request to a coarse [`TaskClass`] from its domain, intent and
//! (optionally) the role of an explicitly hinted provider. Classification
//! is pure and runs once per request.
//!
//! # Precedence
//!
//! ```text
//! 1. hint names an orchestrator  --> orchestration, only if the request is
//!                                    system-level (SafetyBiased) or always
//!                                    (HintOverrides)
//! 2. system domain / orchestration intent --> orchestration
//! 3. marketing / audience domain          --> audience
//! 4. anything else                        --> end-user
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderRole;
use crate::request::Request;

/// Coarse category of request purpose
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskClass {
    /// System-level orchestration
    Orchestration,
    /// Ordinary end-user work
    EndUser,
    /// Marketing / audience analysis
    Audience,
}

impl TaskClass {
    /// All task classes
    pub const ALL: [TaskClass; 3] = [Self::Orchestration, Self::EndUser, Self::Audience];

    /// Stable kebab-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestration => "orchestration",
            Self::EndUser => "end-user",
            Self::Audience => "audience",
        }
    }
}

impl fmt::Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much weight an explicit provider hint carries in classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HintPolicy {
    /// A hint never pulls a non-system request into orchestration handling
    #[default]
    SafetyBiased,
    /// The hinted provider's role decides the class
    HintOverrides,
}

/// Keyword lists and hint policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Domains treated as system-level
    pub orchestration_domains: Vec<String>,
    /// Intents treated as orchestration
    pub orchestration_intents: Vec<String>,
    /// Domains indicating marketing or audience analysis
    pub audience_domains: Vec<String>,
    /// Intents indicating audience analysis
    pub audience_intents: Vec<String>,
    /// Hint weighting
    pub hint_policy: HintPolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            orchestration_domains: vec!["system".into()],
            orchestration_intents: vec![
                "orchestration".into(),
                "orchestrate".into(),
                "coordination".into(),
            ],
            audience_domains: vec![
                "marketing".into(),
                "audience".into(),
                "advertising".into(),
                "campaign".into(),
                "social".into(),
                "demographics".into(),
            ],
            audience_intents: vec!["audience-analysis".into()],
            hint_policy: HintPolicy::SafetyBiased,
        }
    }
}

/// Heuristic task classifier
#[derive(Clone, Debug, Default)]
pub struct TaskClassifier {
    config: ClassifierConfig,
}

impl TaskClassifier {
    /// Create a classifier
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify a request
    ///
    /// `hint_role` is the declared role of the provider named in
    /// `explicit_provider_hint`, if any.
    #[must_use]
    pub fn classify(&self, request: &Request, hint_role: Option<ProviderRole>) -> TaskClass {
        let system_level = self.is_system_level(request);

        if let Some(role) = hint_role {
            match self.config.hint_policy {
                HintPolicy::HintOverrides => return role.task_class(),
                HintPolicy::SafetyBiased => {
                    if role == ProviderRole::OrchestratorSpecialist && system_level {
                        return TaskClass::Orchestration;
                    }
                }
            }
        }

        if system_level {
            TaskClass::Orchestration
        } else if self.is_audience(request) {
            TaskClass::Audience
        } else {
            TaskClass::EndUser
        }
    }

    fn is_system_level(&self, request: &Request) -> bool {
        matches_any(&request.domain, &self.config.orchestration_domains)
            || matches_any(&request.intent, &self.config.orchestration_intents)
    }

    fn is_audience(&self, request: &Request) -> bool {
        matches_any(&request.domain, &self.config.audience_domains)
            || matches_any(&request.intent, &self.config.audience_intents)
    }
}

/// Case-insensitive match of the whole value or any of its segments
///
/// `"marketing/emea"` matches `"marketing"`; `"supermarketing"` does not.
fn matches_any(value: &str, keywords: &[String]) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }

    keywords.iter().any(|keyword| {
        value.eq_ignore_ascii_case(keyword)
            || value
                .split(|c: char| matches!(c, '/' | '.' | ':' | ' ' | '_'))
                .any(|segment| segment.eq_ignore_ascii_case(keyword))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(domain: &str, intent: &str) -> Request {
        Request::new("test").with_domain(domain).with_intent(intent)
    }

    #[test]
    fn test_default_rules() {
        let classifier = TaskClassifier::default();

        assert_eq!(
            classifier.classify(&req("system", "orchestration"), None),
            TaskClass::Orchestration
        );
        assert_eq!(
            classifier.classify(&req("SYSTEM", "status"), None),
            TaskClass::Orchestration
        );
        assert_eq!(
            classifier.classify(&req("billing", "orchestration"), None),
            TaskClass::Orchestration
        );
        assert_eq!(
            classifier.classify(&req("marketing", "analysis"), None),
            TaskClass::Audience
        );
        assert_eq!(
            classifier.classify(&req("culinary", "analysis"), None),
            TaskClass::EndUser
        );
        assert_eq!(classifier.classify(&req("", ""), None), TaskClass::EndUser);
    }

    #[test]
    fn test_segment_matching() {
        let classifier = TaskClassifier::default();

        assert_eq!(
            classifier.classify(&req("marketing/emea", "report"), None),
            TaskClass::Audience
        );
        assert_eq!(
            classifier.classify(&req("supermarketing", "report"), None),
            TaskClass::EndUser
        );
    }

    #[test]
    fn test_safety_biased_hint_never_forces_orchestration() {
        let classifier = TaskClassifier::default();

        let culinary = req("culinary", "analysis");
        assert_eq!(
            classifier.classify(&culinary, Some(ProviderRole::OrchestratorSpecialist)),
            TaskClass::EndUser
        );

        let system = req("system", "status");
        assert_eq!(
            classifier.classify(&system, Some(ProviderRole::OrchestratorSpecialist)),
            TaskClass::Orchestration
        );

        // A user-task hint does not pull a system request out of orchestration
        assert_eq!(
            classifier.classify(&system, Some(ProviderRole::UserTaskSpecialist)),
            TaskClass::Orchestration
        );
    }

    #[test]
    fn test_hint_overrides_policy() {
        let classifier = TaskClassifier::new(ClassifierConfig {
            hint_policy: HintPolicy::HintOverrides,
            ..ClassifierConfig::default()
        });

        assert_eq!(
            classifier.classify(
                &req("culinary", "analysis"),
                Some(ProviderRole::AudienceSpecialist)
            ),
            TaskClass::Audience
        );
    }

    #[test]
    fn test_custom_keywords() {
        let classifier = TaskClassifier::new(ClassifierConfig {
            orchestration_domains: vec!["platform".into()],
            ..ClassifierConfig::default()
        });

        assert_eq!(
            classifier.classify(&req("platform", "deploy"), None),
            TaskClass::Orchestration
        );
        assert_eq!(
            classifier.classify(&req("system", "deploy"), None),
            TaskClass::EndUser
        );
    }
}
