//! Transport to the database write endpoint

use crate::{BridgeError, Result};
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Url};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Sends an encoded payload to the database.
///
/// Implementations classify failures as
/// [`BridgeError::RetryableTransport`] or
/// [`BridgeError::NonRetryableTransport`].
pub trait Transport: Send + Sync + 'static {
    fn send(&self, payload: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// InfluxDB v2 endpoint settings
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8086`
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// API token; sent as `Authorization: Token <token>`
    pub token: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            org: String::new(),
            bucket: String::new(),
            token: None,
            request_timeout: Duration::from_millis(crate::config::REQUEST_TIMEOUT_MS),
        }
    }
}

/// Map an HTTP status to the write outcome
pub fn classify_status(status: u16, body: &str) -> Result<()> {
    match status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(BridgeError::RetryableTransport(format!(
            "status {}: {}",
            status,
            body.trim()
        ))),
        _ => Err(BridgeError::NonRetryableTransport {
            status,
            message: body.trim().to_string(),
        }),
    }
}

/// Line protocol over HTTP to `/api/v2/write`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    write_url: Url,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| BridgeError::Config(format!("invalid influx url {:?}: {}", config.url, e)))?;
        let mut write_url = base
            .join("api/v2/write")
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BridgeError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            write_url,
            token: config.token.clone(),
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

impl Transport for HttpTransport {
    async fn send(&self, payload: Bytes) -> Result<()> {
        let size = payload.len();
        let mut request = self
            .client
            .post(self.write_url.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(payload);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::RetryableTransport(e.to_string()))?;

        let status = response.status().as_u16();
        debug!(status, bytes = size, "Write response");
        if (200..300).contains(&status) {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(204, "").is_ok());
        assert!(matches!(
            classify_status(503, "unavailable"),
            Err(BridgeError::RetryableTransport(_))
        ));
        assert!(matches!(
            classify_status(429, ""),
            Err(BridgeError::RetryableTransport(_))
        ));
        assert!(matches!(
            classify_status(408, ""),
            Err(BridgeError::RetryableTransport(_))
        ));
        assert!(matches!(
            classify_status(400, "partial write: field type conflict"),
            Err(BridgeError::NonRetryableTransport { status: 400, .. })
        ));
        assert!(matches!(
            classify_status(401, ""),
            Err(BridgeError::NonRetryableTransport { status: 401, .. })
        ));
    }

    #[test]
    fn test_write_url() {
        let config = InfluxConfig {
            url: "http://influx.local:8086/".into(),
            org: "helium".into(),
            bucket: "validators".into(),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.write_url().as_str(),
            "http://influx.local:8086/api/v2/write?org=helium&bucket=validators&precision=ns"
        );
    }

    #[test]
    fn test_invalid_url() {
        let config = InfluxConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(HttpTransport::new(&config), Err(BridgeError::Config(_))));
    }
}
