//! TOML Configuration File Support
//!
//! Loads router settings from `$XDG_CONFIG_HOME/airouter/router.toml`
//! (typically `~/.config/airouter/router.toml`).
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`AIROUTER_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! Every field is optional. A missing file is not an error.
//!
//! # Example Configuration
//!
//! ```toml
//! [circuit_breaker]
//! failure_threshold = 5
//! cooldown_secs = 60
//!
//! [telemetry]
//! max_samples = 10000
//! slo_target = 0.99
//! generation_objective_ms = 15000
//! short_prompt_chars = 200
//! retrieval_markers = ["knowledge", "documents"]
//!
//! [hybrid]
//! direct_path_enabled = true
//! max_attempt_timeout_ms = 60000
//!
//! [health]
//! interval_secs = 30
//! probe_timeout_ms = 5000
//!
//! [optimizer]
//! enabled = true
//! interval_secs = 900
//! strategy = "adaptive"
//!
//! [classifier]
//! hint_policy = "safety-biased"
//! pinned_classes = ["orchestration", "audience"]
//!
//! [[providers]]
//! id = "atlas"
//! role = "orchestrator-specialist"
//! cost_per_request = 0.03
//! direct_endpoint = "https://atlas.internal/v1/direct"
//! brokered_endpoint = "https://broker.internal/atlas"
//! api_key_env = "ATLAS_API_KEY"
//!
//! [[rules]]
//! task_class = "end-user"
//! providers = ["sage", "atlas", "echo"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderRole;
use crate::request::UrgencyTier;
use crate::routing::circuit::BreakerConfig;
use crate::routing::classifier::{ClassifierConfig, HintPolicy, TaskClass};
use crate::routing::health::HealthMonitorConfig;
use crate::routing::hybrid::HybridConfig;
use crate::routing::optimizer::{OptimizationStrategy, OptimizerConfig};
use crate::routing::rules::RoutingRule;
use crate::routing::telemetry::TelemetryConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where configuration values came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[circuit_breaker]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerToml {
    /// Consecutive failures that open a circuit
    pub failure_threshold: Option<u32>,
    /// Seconds an open circuit waits before a trial
    pub cooldown_secs: Option<u64>,
}

/// `[telemetry]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryToml {
    pub max_samples: Option<usize>,
    pub max_age_secs: Option<u64>,
    pub slo_target: Option<f64>,
    pub cached_objective_ms: Option<u64>,
    pub retrieval_objective_ms: Option<u64>,
    pub generation_objective_ms: Option<u64>,
    pub short_horizon_secs: Option<u64>,
    pub long_horizon_secs: Option<u64>,
    pub critical_burn_rate: Option<f64>,
    pub warning_burn_rate: Option<f64>,
    /// Seconds between metrics reports
    pub report_interval_secs: Option<u64>,
    /// Longest prompt still classed as cached
    pub short_prompt_chars: Option<usize>,
    /// Prompt fragments that mark a retrieval request
    pub retrieval_markers: Option<Vec<String>>,
}

/// `[hybrid]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridToml {
    /// Whether the direct fast lane may be used
    pub direct_path_enabled: Option<bool>,
    /// Cap on any single attempt
    pub max_attempt_timeout_ms: Option<u64>,
}

/// `[health]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    pub interval_secs: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub lookback_secs: Option<u64>,
    pub demotion_cycles: Option<u32>,
    pub bottleneck_success_rate: Option<f64>,
    pub bottleneck_min_samples: Option<usize>,
}

/// `[optimizer]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerToml {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub min_samples: Option<usize>,
    pub max_changes_per_cycle: Option<usize>,
    pub regression_tolerance: Option<f64>,
    pub collateral_tolerance: Option<f64>,
    pub observation_window_secs: Option<u64>,
    pub lookback_secs: Option<u64>,
    pub strategy: Option<OptimizationStrategy>,
    pub min_improvement: Option<f64>,
    pub latency_target_ms: Option<u64>,
    pub success_rate_target: Option<f64>,
    pub cost_target_usd: Option<f64>,
    pub min_threshold_ms: Option<u64>,
    pub max_threshold_ms: Option<u64>,
}

/// `[classifier]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierToml {
    pub orchestration_domains: Option<Vec<String>>,
    pub orchestration_intents: Option<Vec<String>>,
    pub audience_domains: Option<Vec<String>>,
    pub audience_intents: Option<Vec<String>>,
    pub hint_policy: Option<HintPolicy>,
    /// Classes whose specialist always leads the chain
    pub pinned_classes: Option<Vec<TaskClass>>,
}

/// `[[providers]]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderToml {
    pub id: String,
    pub role: ProviderRole,
    #[serde(default)]
    pub cost_per_request: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Fast-lane endpoint
    #[serde(default)]
    pub direct_endpoint: Option<String>,
    /// Broker endpoint
    #[serde(default)]
    pub brokered_endpoint: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// `[[rules]]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleToml {
    pub task_class: TaskClass,
    pub providers: Vec<String>,
    #[serde(default)]
    pub emergency_ms: Option<u64>,
    #[serde(default)]
    pub critical_ms: Option<u64>,
    #[serde(default)]
    pub high_ms: Option<u64>,
    #[serde(default)]
    pub medium_ms: Option<u64>,
    #[serde(default)]
    pub low_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    pub circuit_breaker: CircuitBreakerToml,
    pub telemetry: TelemetryToml,
    pub hybrid: HybridToml,
    pub health: HealthToml,
    pub optimizer: OptimizerToml,
    pub classifier: ClassifierToml,
    pub providers: Vec<ProviderToml>,
    pub rules: Vec<RuleToml>,
}

// =============================================================================
// Resolved Settings
// =============================================================================

/// One configured provider
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderSettings {
    pub id: String,
    pub role: ProviderRole,
    pub cost_per_request: f64,
    pub enabled: bool,
    pub direct_endpoint: Option<String>,
    pub brokered_endpoint: Option<String>,
    pub api_key_env: Option<String>,
}

impl From<&ProviderToml> for ProviderSettings {
    fn from(toml: &ProviderToml) -> Self {
        Self {
            id: toml.id.clone(),
            role: toml.role,
            cost_per_request: toml.cost_per_request.unwrap_or(0.0),
            enabled: toml.enabled.unwrap_or(true),
            direct_endpoint: toml.direct_endpoint.clone(),
            brokered_endpoint: toml.brokered_endpoint.clone(),
            api_key_env: toml.api_key_env.clone(),
        }
    }
}

/// Fully resolved router configuration
#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub breaker: BreakerConfig,
    pub telemetry: TelemetryConfig,
    pub hybrid: HybridConfig,
    pub health: HealthMonitorConfig,
    pub optimizer: OptimizerConfig,
    pub classifier: ClassifierConfig,

    /// Optimizer feature toggle
    pub optimizer_enabled: bool,
    /// Direct fast-lane feature toggle
    pub direct_path_enabled: bool,
    /// Classes whose specialist is pinned first
    pub pinned_classes: Vec<TaskClass>,
    /// Time between metrics reports
    pub report_interval: Duration,

    pub providers: Vec<ProviderSettings>,
    /// Initial rules; classes left out get specialist-first defaults
    pub rules: Vec<RoutingRule>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            telemetry: TelemetryConfig::default(),
            hybrid: HybridConfig::default(),
            health: HealthMonitorConfig::default(),
            optimizer: OptimizerConfig::default(),
            classifier: ClassifierConfig::default(),
            optimizer_enabled: true,
            direct_path_enabled: true,
            pinned_classes: vec![TaskClass::Orchestration, TaskClass::Audience],
            report_interval: Duration::from_secs(60),
            providers: Vec::new(),
            rules: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RouterSettings {
    /// Create settings with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary source of these settings
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject nonsensical values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::ValidationError(msg.into()))
        }
        let fraction = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);

        if self.breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.breaker.cooldown.is_zero() {
            return invalid("circuit_breaker.cooldown_secs must be positive");
        }

        let slo = &self.telemetry.slo;
        if self.telemetry.max_samples == 0 {
            return invalid("telemetry.max_samples must be at least 1");
        }
        if !(slo.target > 0.0 && slo.target < 1.0) {
            return invalid("telemetry.slo_target must be between 0 and 1 (exclusive)");
        }
        if slo.short_horizon > slo.long_horizon {
            return invalid("telemetry.short_horizon_secs must not exceed long_horizon_secs");
        }
        if slo.critical_burn_rate <= 0.0 || slo.warning_burn_rate <= 0.0 {
            return invalid("telemetry burn-rate thresholds must be positive");
        }
        if self.report_interval.is_zero() {
            return invalid("telemetry.report_interval_secs must be positive");
        }

        if self.hybrid.max_attempt_timeout.is_zero() {
            return invalid("hybrid.max_attempt_timeout_ms must be positive");
        }

        if self.health.interval.is_zero() || self.health.probe_timeout.is_zero() {
            return invalid("health.interval_secs and health.probe_timeout_ms must be positive");
        }
        if !fraction(self.health.bottleneck_success_rate) {
            return invalid("health.bottleneck_success_rate must be within [0, 1]");
        }

        let opt = &self.optimizer;
        if opt.interval.is_zero() || opt.observation_window.is_zero() {
            return invalid("optimizer.interval_secs and observation_window_secs must be positive");
        }
        if !fraction(opt.regression_tolerance) || !fraction(opt.collateral_tolerance) {
            return invalid("optimizer tolerances must be within [0, 1]");
        }
        if !fraction(opt.success_rate_target) || !fraction(opt.min_improvement) {
            return invalid("optimizer.success_rate_target and min_improvement must be within [0, 1]");
        }
        if opt.min_threshold_ms == 0 || opt.min_threshold_ms > opt.max_threshold_ms {
            return invalid("optimizer threshold bounds must satisfy 0 < min <= max");
        }

        let mut ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return invalid("provider id must not be empty");
            }
            if !ids.insert(provider.id.as_str()) {
                return invalid(format!("provider '{}' is configured twice", provider.id));
            }
            if provider.direct_endpoint.is_none() && provider.brokered_endpoint.is_none() {
                return invalid(format!("provider '{}' has no endpoint", provider.id));
            }
            if !(provider.cost_per_request.is_finite() && provider.cost_per_request >= 0.0) {
                return invalid(format!("provider '{}' has a negative cost", provider.id));
            }
        }

        let mut ruled = HashSet::new();
        for rule in &self.rules {
            if !ruled.insert(rule.task_class) {
                return invalid(format!("rule for {} is configured twice", rule.task_class));
            }
            rule.validate()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            if !self.providers.is_empty() {
                if let Some(unknown) = rule
                    .ordered_provider_chain
                    .iter()
                    .find(|p| !ids.contains(p.as_str()))
                {
                    return invalid(format!(
                        "rule for {} names unknown provider '{unknown}'",
                        rule.task_class
                    ));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/airouter/router.toml`, falling back to
/// `~/.config/airouter/router.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("airouter").join("router.toml"))
}

/// Load settings from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if the result fails validation.
pub fn load_settings() -> Result<RouterSettings, ConfigError> {
    load_settings_from_path(default_config_path().as_deref())
}

/// Load settings from a specific path and the process environment
///
/// # Errors
///
/// Same as [`load_settings`].
pub fn load_settings_from_path(path: Option<&Path>) -> Result<RouterSettings, ConfigError> {
    load_settings_with_env(path, |key| std::env::var(key).ok())
}

/// Load settings with an injectable environment lookup
///
/// # Errors
///
/// Same as [`load_settings`].
pub fn load_settings_with_env<E>(path: Option<&Path>, env: E) -> Result<RouterSettings, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let mut settings = RouterSettings::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            let toml_config: RouterToml = toml::from_str(&content)?;
            apply_toml_config(&mut settings, &toml_config);
            settings.config_file_path = Some(config_path.to_path_buf());
            settings.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                providers = settings.providers.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut settings, env)?;
    settings.validate()?;
    Ok(settings)
}

/// Parse settings from a TOML string (no environment)
///
/// # Errors
///
/// Returns an error if the string cannot be parsed or fails validation.
pub fn parse_settings(content: &str) -> Result<RouterSettings, ConfigError> {
    let toml_config: RouterToml = toml::from_str(content)?;
    let mut settings = RouterSettings::default();
    apply_toml_config(&mut settings, &toml_config);
    settings.source = ConfigSource::File;
    settings.validate()?;
    Ok(settings)
}

/// Apply TOML values over `settings`
fn apply_toml_config(settings: &mut RouterSettings, toml: &RouterToml) {
    let cb = &toml.circuit_breaker;
    if let Some(threshold) = cb.failure_threshold {
        settings.breaker.failure_threshold = threshold;
    }
    if let Some(secs) = cb.cooldown_secs {
        settings.breaker.cooldown = Duration::from_secs(secs);
    }

    let t = &toml.telemetry;
    let slo = &mut settings.telemetry.slo;
    if let Some(n) = t.max_samples {
        settings.telemetry.max_samples = n;
    }
    if let Some(secs) = t.max_age_secs {
        settings.telemetry.max_age = Duration::from_secs(secs);
    }
    if let Some(target) = t.slo_target {
        slo.target = target;
    }
    if let Some(ms) = t.cached_objective_ms {
        slo.cached_objective = Duration::from_millis(ms);
    }
    if let Some(ms) = t.retrieval_objective_ms {
        slo.retrieval_objective = Duration::from_millis(ms);
    }
    if let Some(ms) = t.generation_objective_ms {
        slo.generation_objective = Duration::from_millis(ms);
    }
    if let Some(secs) = t.short_horizon_secs {
        slo.short_horizon = Duration::from_secs(secs);
    }
    if let Some(secs) = t.long_horizon_secs {
        slo.long_horizon = Duration::from_secs(secs);
    }
    if let Some(rate) = t.critical_burn_rate {
        slo.critical_burn_rate = rate;
    }
    if let Some(rate) = t.warning_burn_rate {
        slo.warning_burn_rate = rate;
    }
    if let Some(secs) = t.report_interval_secs {
        settings.report_interval = Duration::from_secs(secs);
    }
    if let Some(chars) = t.short_prompt_chars {
        settings.telemetry.operations.short_prompt_chars = chars;
    }
    if let Some(markers) = &t.retrieval_markers {
        settings.telemetry.operations.retrieval_markers =
            markers.iter().map(|m| m.to_lowercase()).collect();
    }

    if let Some(enabled) = toml.hybrid.direct_path_enabled {
        settings.direct_path_enabled = enabled;
    }
    if let Some(ms) = toml.hybrid.max_attempt_timeout_ms {
        settings.hybrid.max_attempt_timeout = Duration::from_millis(ms);
    }

    let h = &toml.health;
    if let Some(secs) = h.interval_secs {
        settings.health.interval = Duration::from_secs(secs);
    }
    if let Some(ms) = h.probe_timeout_ms {
        settings.health.probe_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = h.lookback_secs {
        settings.health.lookback = Duration::from_secs(secs);
    }
    if let Some(n) = h.demotion_cycles {
        settings.health.demotion_cycles = n;
    }
    if let Some(rate) = h.bottleneck_success_rate {
        settings.health.bottleneck_success_rate = rate;
    }
    if let Some(n) = h.bottleneck_min_samples {
        settings.health.bottleneck_min_samples = n;
    }

    let o = &toml.optimizer;
    let opt = &mut settings.optimizer;
    if let Some(enabled) = o.enabled {
        settings.optimizer_enabled = enabled;
    }
    if let Some(secs) = o.interval_secs {
        opt.interval = Duration::from_secs(secs);
    }
    if let Some(n) = o.min_samples {
        opt.min_samples = n;
    }
    if let Some(n) = o.max_changes_per_cycle {
        opt.max_changes_per_cycle = n;
    }
    if let Some(v) = o.regression_tolerance {
        opt.regression_tolerance = v;
    }
    if let Some(v) = o.collateral_tolerance {
        opt.collateral_tolerance = v;
    }
    if let Some(secs) = o.observation_window_secs {
        opt.observation_window = Duration::from_secs(secs);
    }
    if let Some(secs) = o.lookback_secs {
        opt.lookback = Duration::from_secs(secs);
    }
    if let Some(strategy) = o.strategy {
        opt.strategy = strategy;
    }
    if let Some(v) = o.min_improvement {
        opt.min_improvement = v;
    }
    if let Some(ms) = o.latency_target_ms {
        opt.latency_target_ms = ms;
    }
    if let Some(v) = o.success_rate_target {
        opt.success_rate_target = v;
    }
    if let Some(v) = o.cost_target_usd {
        opt.cost_target_usd = v;
    }
    if let Some(ms) = o.min_threshold_ms {
        opt.min_threshold_ms = ms;
    }
    if let Some(ms) = o.max_threshold_ms {
        opt.max_threshold_ms = ms;
    }

    let c = &toml.classifier;
    if let Some(v) = &c.orchestration_domains {
        settings.classifier.orchestration_domains = v.clone();
    }
    if let Some(v) = &c.orchestration_intents {
        settings.classifier.orchestration_intents = v.clone();
    }
    if let Some(v) = &c.audience_domains {
        settings.classifier.audience_domains = v.clone();
    }
    if let Some(v) = &c.audience_intents {
        settings.classifier.audience_intents = v.clone();
    }
    if let Some(policy) = c.hint_policy {
        settings.classifier.hint_policy = policy;
    }
    if let Some(pinned) = &c.pinned_classes {
        settings.pinned_classes = pinned.clone();
    }

    if !toml.providers.is_empty() {
        settings.providers = toml.providers.iter().map(ProviderSettings::from).collect();
    }
    if !toml.rules.is_empty() {
        settings.rules = toml.rules.iter().map(rule_from_toml).collect();
    }
}

fn rule_from_toml(toml: &RuleToml) -> RoutingRule {
    let mut rule = RoutingRule::new(toml.task_class, toml.providers.clone());
    let tiers = [
        (UrgencyTier::Emergency, toml.emergency_ms),
        (UrgencyTier::Critical, toml.critical_ms),
        (UrgencyTier::High, toml.high_ms),
        (UrgencyTier::Medium, toml.medium_ms),
        (UrgencyTier::Low, toml.low_ms),
    ];
    for (tier, ms) in tiers {
        if let Some(ms) = ms {
            rule.urgency_thresholds.set(tier, ms);
        }
    }
    rule
}

/// Apply `AIROUTER_*` environment overrides
fn apply_env_config<E>(settings: &mut RouterSettings, env: E) -> Result<(), ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
        raw.trim()
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!("{key}: cannot parse '{raw}'")))
    }
    fn flag(raw: &str) -> bool {
        let raw = raw.trim().to_ascii_lowercase();
        raw != "0" && raw != "false" && raw != "off" && raw != "no"
    }

    let mut touched = false;

    if let Some(raw) = env("AIROUTER_FAILURE_THRESHOLD") {
        settings.breaker.failure_threshold = parse("AIROUTER_FAILURE_THRESHOLD", &raw)?;
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_COOLDOWN_SECS") {
        settings.breaker.cooldown = Duration::from_secs(parse("AIROUTER_COOLDOWN_SECS", &raw)?);
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_DIRECT_PATH") {
        settings.direct_path_enabled = flag(&raw);
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_MAX_ATTEMPT_TIMEOUT_MS") {
        settings.hybrid.max_attempt_timeout =
            Duration::from_millis(parse("AIROUTER_MAX_ATTEMPT_TIMEOUT_MS", &raw)?);
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_HEALTH_INTERVAL_SECS") {
        settings.health.interval =
            Duration::from_secs(parse("AIROUTER_HEALTH_INTERVAL_SECS", &raw)?);
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_OPTIMIZER") {
        settings.optimizer_enabled = flag(&raw);
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_OPTIMIZER_INTERVAL_SECS") {
        settings.optimizer.interval =
            Duration::from_secs(parse("AIROUTER_OPTIMIZER_INTERVAL_SECS", &raw)?);
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_OPTIMIZER_STRATEGY") {
        settings.optimizer.strategy = raw
            .parse()
            .map_err(ConfigError::ValidationError)?;
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_MIN_SAMPLES") {
        settings.optimizer.min_samples = parse("AIROUTER_MIN_SAMPLES", &raw)?;
        touched = true;
    }
    if let Some(raw) = env("AIROUTER_MAX_CHANGES_PER_CYCLE") {
        settings.optimizer.max_changes_per_cycle = parse("AIROUTER_MAX_CHANGES_PER_CYCLE", &raw)?;
        touched = true;
    }

    if touched {
        settings.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_settings`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub failure_threshold: Option<u32>,
    pub cooldown_secs: Option<u64>,
    pub direct_path_enabled: Option<bool>,
    pub optimizer_enabled: Option<bool>,
    pub optimizer_interval_secs: Option<u64>,
    pub strategy: Option<OptimizationStrategy>,
    pub health_interval_secs: Option<u64>,
}

impl ConfigOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn with_direct_path_enabled(mut self, enabled: bool) -> Self {
        self.direct_path_enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_optimizer_enabled(mut self, enabled: bool) -> Self {
        self.optimizer_enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_optimizer_interval_secs(mut self, secs: u64) -> Self {
        self.optimizer_interval_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: OptimizationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_health_interval_secs(mut self, secs: u64) -> Self {
        self.health_interval_secs = Some(secs);
        self
    }

    /// Whether any override is set
    pub fn is_empty(&self) -> bool {
        self.failure_threshold.is_none()
            && self.cooldown_secs.is_none()
            && self.direct_path_enabled.is_none()
            && self.optimizer_enabled.is_none()
            && self.optimizer_interval_secs.is_none()
            && self.strategy.is_none()
            && self.health_interval_secs.is_none()
    }

    /// Apply overrides and re-validate
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an override is out of range.
    pub fn apply(&self, settings: &mut RouterSettings) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Ok(());
        }
        settings.source = ConfigSource::Cli;

        if let Some(threshold) = self.failure_threshold {
            settings.breaker.failure_threshold = threshold;
        }
        if let Some(secs) = self.cooldown_secs {
            settings.breaker.cooldown = Duration::from_secs(secs);
        }
        if let Some(enabled) = self.direct_path_enabled {
            settings.direct_path_enabled = enabled;
        }
        if let Some(enabled) = self.optimizer_enabled {
            settings.optimizer_enabled = enabled;
        }
        if let Some(secs) = self.optimizer_interval_secs {
            settings.optimizer.interval = Duration::from_secs(secs);
        }
        if let Some(strategy) = self.strategy {
            settings.optimizer.strategy = strategy;
        }
        if let Some(secs) = self.health_interval_secs {
            settings.health.interval = Duration::from_secs(secs);
        }
        settings.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
