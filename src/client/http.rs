//! HTTP transport backed by reqwest
//!
//! A plain client: it does not report operation counts, so it is handed to
//! the manager as [`Created::Plain`](super::Created::Plain).

use super::transport::Transport;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Default per-request timeout
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary of one HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body_len: usize,
}

/// reqwest client with its own connection pool
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Build a transport with the given request timeout
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }

    /// Build a transport with the default timeout
    pub fn with_defaults() -> anyhow::Result<Self> {
        Self::new(DEFAULT_HTTP_TIMEOUT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue a GET and read the full body
    pub async fn get(&self, url: &str) -> Result<HttpReply, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        Ok(HttpReply {
            status,
            body_len: body.len(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn close(&self, force: bool) -> anyhow::Result<()> {
        // Idle connections go away with the last handle to the pool
        tracing::debug!(force, "Releasing HTTP transport");
        Ok(())
    }
}
