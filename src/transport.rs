//! Network client configuration shared by the Git and REST collaborators.
//!
//! Settings such as insecure TLS are carried in a value handed to each client
//! at construction time instead of being toggled process-wide.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to configure TLS: {0}")]
    Tls(#[from] native_tls::Error),
}

/// Transport settings for one invocation.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Accept invalid TLS certificates (self-signed Enterprise Server installs).
    pub insecure: bool,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            user_agent: format!("action-sync/{}", crate::VERSION),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl TransportConfig {
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Build an HTTP agent for the REST API.
    ///
    /// Redirects are never followed automatically: callers need to see them
    /// (asset downloads, membership checks, the connectivity probe).
    pub fn agent(&self) -> Result<ureq::Agent, TransportError> {
        let mut builder = ureq::AgentBuilder::new()
            .user_agent(&self.user_agent)
            .redirects(0)
            .timeout_connect(self.connect_timeout)
            .timeout_read(self.read_timeout);
        if self.insecure {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            builder = builder.tls_connector(Arc::new(connector));
        }
        Ok(builder.build())
    }
}
