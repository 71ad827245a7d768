use std::{future::Future, time::Duration};

use crate::config::ServiceSpec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthError {
    #[error("health check timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("health endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("health endpoint returned HTTP {0}")]
    Status(u16),
    #[error("health endpoint reported {0}")]
    Body(String),
}

/// One readiness/liveness probe of the supervised service.
pub trait HealthProbe: Send + Sync + 'static {
    fn check(&self) -> impl Future<Output = Result<(), HealthError>> + Send;
}

/// HTTP GET probe: 2xx is healthy, anything else (or no answer) is not.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    expect_status: Option<String>,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            timeout,
            expect_status: None,
        })
    }

    pub fn from_spec(spec: &ServiceSpec) -> anyhow::Result<Self> {
        let mut probe = Self::new(&spec.health_url, spec.health_timeout)?;
        probe.expect_status = spec.health_expect_status.clone();
        Ok(probe)
    }

    pub fn expect_status(mut self, status: impl Into<String>) -> Self {
        self.expect_status = Some(status.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn check_body(&self, resp: reqwest::Response, expected: &str) -> Result<(), HealthError> {
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| HealthError::Body(format!("unreadable body ({e})")))?;
        match body.get("status").and_then(|v| v.as_str()) {
            Some(s) if s == expected => Ok(()),
            Some(s) => Err(HealthError::Body(format!("status {s:?}"))),
            None => Err(HealthError::Body("no status field".to_string())),
        }
    }
}

impl HealthProbe for HttpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let resp = match self.client.get(&self.url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(HealthError::Timeout(self.timeout)),
            Err(e) => return Err(HealthError::Unreachable(e.to_string())),
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(HealthError::Status(status.as_u16()));
        }

        match &self.expect_status {
            Some(expected) => self.check_body(resp, expected).await,
            None => Ok(()),
        }
    }
}
