use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::HealthConfig;
use crate::error::HealthError;

/// One liveness check against the backend
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, port: u16) -> Result<(), HealthError>;
}

/// `GET http://<host>:<port><path>`, healthy on exactly 200
pub struct HttpHealthProbe {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(host: &str, path: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        // The timeout covers the whole request, so a hung backend aborts it
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;

        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        Ok(Self {
            client,
            host: host.to_string(),
            path,
        })
    }

    pub fn from_config(config: &HealthConfig) -> Result<Self, reqwest::Error> {
        Self::new(&config.host, &config.path, config.timeout())
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, self.path)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, port: u16) -> Result<(), HealthError> {
        let url = self.url(port);
        debug!("Health check: GET {}", url);

        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status == 200 {
                    Ok(())
                } else {
                    Err(HealthError::BadStatus(status))
                }
            }
            Err(e) if e.is_timeout() => Err(HealthError::Timeout),
            Err(e) => Err(HealthError::Unreachable(e.to_string())),
        }
    }
}
