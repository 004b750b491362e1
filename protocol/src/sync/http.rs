//! JSON-over-HTTP transport to a `harvest-node` authority.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::messages::{
    ErrorBody, ExchangeRequest, ExchangeResponse, SessionOpenRequest, SessionOpenResponse,
};
use super::transport::{AuthorityTransport, TransportError};

pub const OPEN_PATH: &str = "/v1/sync/open";
pub const EXCHANGE_PATH: &str = "/v1/sync/exchange";

/// Device-side HTTP client.
///
/// Timeouts are applied by the sync engine, not here.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, TransportError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            let body: Option<ErrorBody> = resp.json().await.ok();
            return Err(match body {
                Some(b) => TransportError::Server {
                    message: b.error,
                    retryable: b.retryable,
                },
                None => TransportError::Server {
                    message: format!("HTTP {status}"),
                    retryable: status.is_server_error(),
                },
            });
        }
        resp.json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::Unreachable(err.to_string())
    }
}

#[async_trait]
impl AuthorityTransport for HttpTransport {
    async fn open_session(
        &self,
        req: SessionOpenRequest,
    ) -> Result<SessionOpenResponse, TransportError> {
        self.post(OPEN_PATH, &req).await
    }

    async fn exchange(&self, req: ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
        self.post(EXCHANGE_PATH, &req).await
    }
}
