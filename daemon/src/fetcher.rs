use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use areg_common::error::ApiError;

use crate::config::{
    FETCH_CONNECT_TIMEOUT, FETCH_MAX_BYTES, FETCH_MAX_REDIRECTS, FETCH_TOTAL_TIMEOUT,
};

#[derive(Clone, Debug)]
pub struct FetchLimits {
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub max_bytes: usize,
    pub max_redirects: usize,
    /// Peer-sync fetches may only follow redirects on the same host;
    /// publisher-supplied URLs may go anywhere.
    pub same_host_only: bool,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            connect_timeout: FETCH_CONNECT_TIMEOUT,
            total_timeout: FETCH_TOTAL_TIMEOUT,
            max_bytes: FETCH_MAX_BYTES,
            max_redirects: FETCH_MAX_REDIRECTS,
            same_host_only: false,
        }
    }
}

impl FetchLimits {
    pub fn peer_sync() -> Self {
        Self {
            same_host_only: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url")]
    InvalidUrl,
    #[error("fetch timed out")]
    Timeout,
    #[error("response exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("redirect to another host refused")]
    CrossHostRedirect,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response is not valid JSON")]
    InvalidJson,
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

/// Outbound HTTP port used for card fetches, peer index pages and JWKS.
/// Stateless: no caching, no retries; callers own both policies.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch_json(
        &self,
        url: &Url,
        bearer: Option<&str>,
        limits: &FetchLimits,
    ) -> Result<Value, FetchError>;
}

pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, FetchError> {
        // Redirects are followed manually so the same-host policy and the
        // redirect budget stay enforceable.
        let client = Client::builder()
            .connect_timeout(FETCH_CONNECT_TIMEOUT)
            .redirect(Policy::none())
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    async fn fetch_inner(
        &self,
        origin: &Url,
        bearer: Option<&str>,
        limits: &FetchLimits,
    ) -> Result<Value, FetchError> {
        let mut current = origin.clone();
        for _ in 0..=limits.max_redirects {
            let mut request = self.client.get(current.clone());
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(FetchError::InvalidUrl)?;
                let next = current.join(location).map_err(|_| FetchError::InvalidUrl)?;
                if limits.same_host_only && next.host_str() != origin.host_str() {
                    return Err(FetchError::CrossHostRedirect);
                }
                current = next;
                continue;
            }
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }

            // Stream the body under the hard size cap; Content-Length is a
            // hint, not a promise.
            if let Some(len) = response.content_length() {
                if len as usize > limits.max_bytes {
                    return Err(FetchError::TooLarge {
                        limit: limits.max_bytes,
                    });
                }
            }
            let mut body: Vec<u8> = Vec::new();
            let mut response = response;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?
            {
                if body.len() + chunk.len() > limits.max_bytes {
                    return Err(FetchError::TooLarge {
                        limit: limits.max_bytes,
                    });
                }
                body.extend_from_slice(&chunk);
            }

            return serde_json::from_slice(&body).map_err(|_| FetchError::InvalidJson);
        }
        Err(FetchError::TooManyRedirects)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch_json(
        &self,
        url: &Url,
        bearer: Option<&str>,
        limits: &FetchLimits,
    ) -> Result<Value, FetchError> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(FetchError::InvalidUrl);
        }
        match tokio::time::timeout(limits.total_timeout, self.fetch_inner(url, bearer, limits))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }
}
