use std::fmt;

use serde::Deserialize;

use crate::{ControlError, ControlResult};

/// Whether connections verify the API server's TLS certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// Accept any certificate the server presents.
    #[default]
    SkipVerify,
    Verify,
}

/// Endpoint and credential for one cluster. Immutable once built.
#[derive(Clone, Deserialize)]
pub struct ConnectionProfile {
    api_endpoint: String,
    bearer_token: String,
    #[serde(default)]
    tls: TlsPolicy,
}

impl ConnectionProfile {
    pub fn new(api_endpoint: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self { api_endpoint: api_endpoint.into(), bearer_token: bearer_token.into(), tls: TlsPolicy::default() }
    }

    pub fn with_tls_policy(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    pub fn api_endpoint(&self) -> &str {
        &self.api_endpoint
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        self.tls
    }

    /// A profile without a bearer token cannot authenticate anything.
    pub fn validate(&self) -> ControlResult<()> {
        if self.bearer_token.is_empty() {
            return Err(ControlError::Configuration(format!(
                "connection profile for {:?} has an empty bearer token",
                self.api_endpoint
            )));
        }
        Ok(())
    }

    /// Fresh connection settings for a single operation. Nothing is cached.
    pub fn derive_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: normalize_host(&self.api_endpoint),
            bearer_token: self.bearer_token.clone(),
            accept_invalid_certs: self.tls == TlsPolicy::SkipVerify,
        }
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("api_endpoint", &self.api_endpoint)
            .field("bearer_token", &"<redacted>")
            .field("tls", &self.tls)
            .finish()
    }
}

/// Connection settings derived from a [`ConnectionProfile`].
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Endpoint with a URL scheme.
    pub host: String,
    pub bearer_token: String,
    pub accept_invalid_certs: bool,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("bearer_token", &"<redacted>")
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

/// Prepends `https://` unless the endpoint already names an http(s) scheme.
/// An empty endpoint is not replaced by any default host.
pub fn normalize_host(endpoint: &str) -> String {
    let lower = endpoint.get(..8).unwrap_or(endpoint).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}
