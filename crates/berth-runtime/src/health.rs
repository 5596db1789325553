//! Readiness polling for a freshly started workspace.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 30,
        }
    }
}

/// One readiness check against a host port.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, port: u16) -> bool;
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET http://<host>:<port><path>`; any 2xx or 3xx counts as healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Ok(Self {
            client,
            host: host.into(),
            path,
        })
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, self.path)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, port: u16) -> bool {
        match self.client.get(self.url(port)).send().await {
            Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
            Err(e) => {
                debug!(port, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Poll until healthy or attempts run out. Returns whether it became healthy.
pub async fn wait_until_healthy(probe: &dyn HealthProbe, port: u16, policy: HealthPolicy) -> bool {
    for attempt in 1..=policy.max_attempts {
        if probe.probe(port).await {
            debug!(port, attempt, "workspace healthy");
            return true;
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    warn!(
        port,
        attempts = policy.max_attempts,
        "workspace did not become healthy; continuing"
    );
    false
}
