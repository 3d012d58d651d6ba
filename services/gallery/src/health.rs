use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Tri-state health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Unknown,
}

/// Result of one probe run
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeReport {
    pub fn new(status: HealthStatus, detail: Option<String>) -> Self {
        Self {
            status,
            detail,
            checked_at: Utc::now(),
        }
    }
}

/// Pluggable health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> ProbeReport;
}

/// Probe that issues a GET against a configured URL
pub struct HttpProbe {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpProbe {
    pub fn new(url: Option<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> ProbeReport {
        let Some(ref url) = self.url else {
            return ProbeReport::new(HealthStatus::Unknown, None);
        };

        match self.client.get(url).send().await {
            Ok(response) => classify(response.status().as_u16()),
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe request failed");
                ProbeReport::new(HealthStatus::Down, Some(e.to_string()))
            }
        }
    }
}

/// 2xx is up; anything else is down with the status code as detail
fn classify(status_code: u16) -> ProbeReport {
    if (200..300).contains(&status_code) {
        ProbeReport::new(HealthStatus::Up, None)
    } else {
        ProbeReport::new(
            HealthStatus::Down,
            Some(format!("HTTP status code {}", status_code)),
        )
    }
}
