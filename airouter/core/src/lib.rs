//! AI Router Core - Multi-Provider Request Routing
//!
//! Routes AI requests across a fleet of heterogeneous language-model
//! providers. Each request is classified, matched to a versioned routing
//! rule and attempted against an ordered chain of providers with strictly
//! sequential fallback. Two background loops keep the rules healthy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Callers                             │
//! │        daemon (Unix socket)   │   embedding application      │
//! └───────────────────────────────┼──────────────────────────────┘
//!                                 │ Request / Response
//! ┌───────────────────────────────┼──────────────────────────────┐
//! │                        ROUTER CORE                           │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌─────────┐ │
//! │  │ Classifier │→ │  Ordering  │→ │   Hybrid   │→ │Provider │ │
//! │  │            │  │   Policy   │  │  (paths)   │  │Adapters │ │
//! │  └────────────┘  └─────┬──────┘  └─────┬──────┘  └─────────┘ │
//! │                        │               │                     │
//! │   ┌────────────┐  ┌────┴──────┐  ┌─────┴──────┐              │
//! │   │ Telemetry  │  │ RuleStore │  │  Circuits  │              │
//! │   └─────┬──────┘  └────┬──────┘  └─────┬──────┘              │
//! │         │   ┌──────────┴────────┐      │                     │
//! │         └── │ Health / Optimizer│ ─────┘                     │
//! │             └───────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use airouter_core::{
//!     load_settings, HttpProviderAdapter, ProviderIdentity, ProviderRegistry,
//!     Request, RouterRuntime,
//! };
//!
//! let settings = load_settings()?;
//! let registry = Arc::new(ProviderRegistry::new());
//! for p in &settings.providers {
//!     registry.register(
//!         ProviderIdentity::new(&p.id, p.role).with_cost(p.cost_per_request),
//!         Arc::new(HttpProviderAdapter::from_settings(p)?),
//!     );
//! }
//!
//! let runtime = RouterRuntime::builder(settings).registry(registry).build()?;
//! runtime.start();
//!
//! let response = runtime.router().handle(&Request::new("Summarize reviews")).await;
//! ```
//!
//! # Module Overview
//!
//! - [`request`]: Request, response and urgency types
//! - [`provider`]: Provider adapter trait, registry and HTTP adapter
//! - [`routing`]: Classification, ordering, circuits, telemetry, control loops
//! - [`compliance`]: External compliance gate
//! - [`sinks`]: Audit and metrics consumers
//! - [`clock`]: Injectable time source
//! - [`config`]: TOML, environment and CLI configuration

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod compliance;
pub mod config;
pub mod provider;
pub mod request;
pub mod routing;
pub mod sinks;

// Request exports
pub use request::{ErrorKind, Outcome, Request, Response, RoutePath, ToolSpec, UrgencyTier};

// Provider exports
pub use provider::{
    HttpProviderAdapter, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderIdentity,
    ProviderRegistry, ProviderReply, ProviderRole,
};

// Routing exports
pub use routing::{
    AiRouter, OptimizationStrategy, RouterRuntime, RouterState, RoutingError, RoutingResult,
    TaskClass,
};

// Sink and gate exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use compliance::{AllowAll, ComplianceGate, DomainBlocklist};
pub use sinks::{
    AuditEvent, AuditEventType, AuditSink, ChannelAuditSink, MetricsSink, NullAuditSink,
    NullMetricsSink, TracingAuditSink, TracingMetricsSink,
};

// Config exports
pub use config::{
    default_config_path, load_settings, load_settings_from_path, ConfigError, ConfigOverrides,
    ConfigSource, ProviderSettings, RouterSettings,
};
