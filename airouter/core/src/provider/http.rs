//! HTTP Provider Adapter
//!
//! Generic JSON-over-HTTP adapter. Each provider exposes one endpoint per
//! path; a provider configured with a single endpoint serves both paths
//! through it.
//!
//! # Wire format
//!
//! ```text
//! POST {endpoint}
//! { "request": { "id": ..., "prompt": ..., ... }, "path": "direct" }
//!
//! 200 { "content": "...", "costUsd": 0.012 }
//!
//! GET {endpoint}/health      (probe; any 2xx is healthy)
//! ```
//!
//! # Status mapping
//!
//! | HTTP           | [`ProviderErrorKind`] |
//! |----------------|-----------------------|
//! | 429            | `RateLimited`         |
//! | 403, 451       | `ComplianceBlocked`   |
//! | 502, 503, 504  | `Unavailable`         |
//! | 408            | `Timeout`             |
//! | other non-2xx  | `Other`               |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use super::{ProviderAdapter, ProviderError, ProviderErrorKind, ProviderReply};
use crate::config::ProviderSettings;
use crate::request::{Request, RoutePath};

/// Body of an execution call
#[derive(Serialize)]
struct ExecuteBody<'a> {
    request: &'a Request,
    path: RoutePath,
}

/// JSON-over-HTTP provider
#[derive(Clone)]
pub struct HttpProviderAdapter {
    id: String,
    direct_endpoint: String,
    brokered_endpoint: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpProviderAdapter {
    /// Create an adapter
    ///
    /// # Errors
    ///
    /// Fails when neither endpoint is given or the HTTP client cannot be
    /// built.
    pub fn new(
        id: impl Into<String>,
        direct_endpoint: Option<String>,
        brokered_endpoint: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let id = id.into();
        let (direct, brokered) = match (direct_endpoint, brokered_endpoint) {
            (Some(d), Some(b)) => (d, b),
            (Some(d), None) => (d.clone(), d),
            (None, Some(b)) => (b.clone(), b),
            (None, None) => {
                return Err(ProviderError::new(
                    ProviderErrorKind::Other,
                    format!("provider {id} has no endpoint"),
                ))
            }
        };

        // Per-call timeouts are set on each request
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Other, e.to_string()))?;

        Ok(Self {
            id,
            direct_endpoint: trim_slash(direct),
            brokered_endpoint: trim_slash(brokered),
            api_key,
            http_client,
        })
    }

    /// Create from configured settings, reading the API key from the
    /// environment variable the settings name
    ///
    /// # Errors
    ///
    /// Same as [`HttpProviderAdapter::new`].
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        if settings.api_key_env.is_some() && api_key.is_none() {
            tracing::warn!(
                provider = %settings.id,
                "API key variable configured but not set; calling without credentials"
            );
        }
        Self::new(
            settings.id.clone(),
            settings.direct_endpoint.clone(),
            settings.brokered_endpoint.clone(),
            api_key,
        )
    }

    /// Endpoint used for a path
    pub fn endpoint(&self, path: RoutePath) -> &str {
        match path {
            RoutePath::Direct => &self.direct_endpoint,
            RoutePath::Brokered => &self.brokered_endpoint,
        }
    }

    fn health_url(&self, path: RoutePath) -> String {
        format!("{}/health", self.endpoint(path))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn transport_error(&self, path: RoutePath, error: &reqwest::Error) -> ProviderError {
        let kind = if error.is_timeout() {
            ProviderErrorKind::Timeout
        } else if error.is_connect() || error.is_request() {
            ProviderErrorKind::Unavailable
        } else {
            ProviderErrorKind::Other
        };
        ProviderError::new(kind, format!("{} on {path}: {error}", self.id))
    }
}

impl std::fmt::Debug for HttpProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProviderAdapter")
            .field("id", &self.id)
            .field("direct_endpoint", &self.direct_endpoint)
            .field("brokered_endpoint", &self.brokered_endpoint)
            .field("authenticated", &self.api_key.is_some())
            .finish()
    }
}

/// Map a non-success HTTP status to an error kind
pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        429 => ProviderErrorKind::RateLimited,
        403 | 451 => ProviderErrorKind::ComplianceBlocked,
        502..=504 => ProviderErrorKind::Unavailable,
        408 => ProviderErrorKind::Timeout,
        _ => ProviderErrorKind::Other,
    }
}

fn trim_slash(mut endpoint: String) -> String {
    while endpoint.ends_with('/') {
        endpoint.pop();
    }
    endpoint
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn execute(
        &self,
        request: &Request,
        path: RoutePath,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let body = ExecuteBody { request, path };
        let response = self
            .authorize(self.http_client.post(self.endpoint(path)))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(path, &e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                classify_status(status),
                format!("{} returned {status} on {path}: {detail}", self.id),
            ));
        }

        response
            .json::<ProviderReply>()
            .await
            .map_err(|e| self.transport_error(path, &e))
    }

    async fn probe(&self, path: RoutePath, timeout: Duration) -> Result<(), ProviderError> {
        let response = self
            .authorize(self.http_client.get(self.health_url(path)))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(path, &e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProviderError::new(
                classify_status(status),
                format!("{} health check returned {status} on {path}", self.id),
            ))
        }
    }
}
