use crate::error::{ConnectorError, Result};
use crate::types::Credentials;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Unicast HTTP surface of a device
///
/// Discovery probes and the generation 1 client go through this trait so
/// they can be exercised against recorded fixtures.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// `GET http://{address}{path}?{query}` and decode the body as JSON
    async fn get_json(
        &self,
        address: &str,
        path: &str,
        query: &[(String, String)],
        credentials: Option<&Credentials>,
    ) -> Result<serde_json::Value>;
}

/// [`HttpTransport`] backed by `reqwest`
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_json(
        &self,
        address: &str,
        path: &str,
        query: &[(String, String)],
        credentials: Option<&Credentials>,
    ) -> Result<serde_json::Value> {
        let url = format!("http://{}{}", address, path);

        let mut request = self.client.get(&url).query(query).timeout(self.timeout);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let start = std::time::Instant::now();
        let response = request.send().await;
        tracing::debug!(
            "GET {} completed in {:?}: {:?}",
            url,
            start.elapsed(),
            response.as_ref().map(|r| r.status())
        );

        let response = response?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::HttpStatus {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            ConnectorError::InvalidPayload(format!("{} returned malformed JSON: {}", path, e))
        })
    }
}
