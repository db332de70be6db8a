//! `UpstreamRequester`: opens a byte-stream GET against the brokerage API
//! (spec §4.2). Grounded on `xrpc_proxy.rs`'s header-forwarding/bearer
//! request shape and `federation/upstream.rs`'s `connect_timeout` +
//! `CancellationToken` pattern, adapted from a WebSocket connect loop to a
//! single `reqwest::Response::bytes_stream()` open.

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{error::MuxError, token_provider::TokenProvider};

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// An open upstream connection: the byte stream plus a handle that both
/// aborts the underlying request and releases any buffered data.
pub struct OpenStream {
    pub body: ByteStream,
    pub cancel: CancellationToken,
}

/// The multiplexer's collaborator for opening upstream byte streams.
/// Pulled out as a trait (rather than the concrete [`UpstreamRequester`])
/// so `Multiplexer` can be exercised against a fake upstream in tests
/// without a live brokerage connection or token endpoint.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn open_stream(&self, user_id: &str, url: &str) -> Result<OpenStream, MuxError>;
}

#[derive(Clone)]
pub struct UpstreamRequester {
    http: Client,
    token_provider: std::sync::Arc<TokenProvider>,
}

impl UpstreamRequester {
    pub fn new(http: Client, token_provider: std::sync::Arc<TokenProvider>) -> Self {
        Self {
            http,
            token_provider,
        }
    }
}

#[async_trait]
impl Requester for UpstreamRequester {
    /// Opens a GET stream against `url` on behalf of `user_id`, retrying
    /// once on 401 after a token refresh.
    async fn open_stream(&self, user_id: &str, url: &str) -> Result<OpenStream, MuxError> {
        let token = self.token_provider.get_token(user_id).await?;

        match self.try_open(url, &token).await {
            Ok(open) => Ok(open),
            Err(TryOpenError::Unauthorized) => {
                let (fresh_token, _) = self.token_provider.refresh(user_id).await?;
                match self.try_open(url, &fresh_token).await {
                    Ok(open) => Ok(open),
                    Err(TryOpenError::Unauthorized) => {
                        Err(MuxError::Unauthorized("upstream rejected refreshed token".into()))
                    }
                    Err(other) => Err(other.into_mux_error()),
                }
            }
            Err(other) => Err(other.into_mux_error()),
        }
    }
}

impl UpstreamRequester {
    async fn try_open(&self, url: &str, token: &str) -> Result<OpenStream, TryOpenError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TryOpenError::Timeout
                } else {
                    TryOpenError::Network(e.to_string())
                }
            })?;

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(TryOpenError::Unauthorized);
        }

        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let parsed: Option<Value> = serde_json::from_str(&body_text).ok();
            return Err(TryOpenError::UpstreamStatus {
                status: status.as_u16(),
                body: parsed
                    .map(|v| v.to_string())
                    .unwrap_or(body_text),
            });
        }

        let cancel = CancellationToken::new();
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));

        Ok(OpenStream {
            body: Box::pin(stream),
            cancel,
        })
    }
}

enum TryOpenError {
    Timeout,
    Network(String),
    Unauthorized,
    UpstreamStatus { status: u16, body: String },
}

impl TryOpenError {
    fn into_mux_error(self) -> MuxError {
        match self {
            TryOpenError::Timeout => MuxError::GatewayTimeout,
            TryOpenError::Network(msg) => MuxError::BadGateway(msg),
            TryOpenError::Unauthorized => MuxError::Unauthorized("upstream returned 401".into()),
            TryOpenError::UpstreamStatus { status, body } => {
                MuxError::UpstreamStatus { status, body }
            }
        }
    }
}

/// Cancels the upstream request and lets the HTTP/2 layer settle before the
/// stream is dropped: see spec §9 / the critical implementation note in
/// §4.2. Callers MUST call this before dropping an [`OpenStream`], not after.
pub async fn cancel_and_settle(cancel: &CancellationToken, settle_delay: Duration) {
    cancel.cancel();
    tokio::time::sleep(settle_delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_open_error_maps_to_expected_mux_error() {
        assert!(matches!(
            TryOpenError::Timeout.into_mux_error(),
            MuxError::GatewayTimeout
        ));
        assert!(matches!(
            TryOpenError::Unauthorized.into_mux_error(),
            MuxError::Unauthorized(_)
        ));
        assert!(matches!(
            TryOpenError::UpstreamStatus {
                status: 500,
                body: "oops".into()
            }
            .into_mux_error(),
            MuxError::UpstreamStatus { status: 500, .. }
        ));
    }
}
