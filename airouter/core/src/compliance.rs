//! Compliance Gate
//!
//! Compliance evaluation itself happens outside the router. The ordering
//! policy consults a [`ComplianceGate`] before admitting a provider to a
//! request's candidate chain. A rejection removes the provider for that
//! request only and is never treated as a health failure.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::request::Request;

/// External compliance decision
pub trait ComplianceGate: Send + Sync {
    /// Whether `provider` may serve `request`
    fn is_compliant(&self, request: &Request, provider: &str) -> bool;
}

/// Gate that admits every provider
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ComplianceGate for AllowAll {
    fn is_compliant(&self, _request: &Request, _provider: &str) -> bool {
        true
    }
}

/// Gate that blocks a fixed set of providers for given domains
///
/// Useful for static residency rules ("marketing data never goes to X").
#[derive(Debug, Default)]
pub struct DomainBlocklist {
    blocked: RwLock<HashSet<(String, String)>>,
}

impl DomainBlocklist {
    /// Create an empty blocklist
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `provider` for requests in `domain`
    pub fn block(&self, domain: impl Into<String>, provider: impl Into<String>) {
        self.blocked
            .write()
            .insert((domain.into().to_ascii_lowercase(), provider.into()));
    }
}

impl ComplianceGate for DomainBlocklist {
    fn is_compliant(&self, request: &Request, provider: &str) -> bool {
        let key = (request.domain.to_ascii_lowercase(), provider.to_string());
        !self.blocked.read().contains(&key)
    }
}
