//! Plain HTTP(S) source backend and the response handling shared with the
//! object store backend

use super::{ByteRange, ByteStream, StorageBackend, skip_prefix};
use crate::error::{CacheError, CacheResult};
use crate::models::{BackendKind, SourceUri};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderMap, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

const USER_AGENT: &str = concat!("model-cache/", env!("CARGO_PKG_VERSION"));

/// Shared reqwest client settings
///
/// No overall request timeout: multi-gigabyte bodies legitimately take long.
pub(crate) fn build_client() -> CacheResult<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Send a ranged GET and turn the response into a byte stream
pub(crate) async fn send_ranged(
    request: RequestBuilder,
    uri: &SourceUri,
    range: ByteRange,
) -> CacheResult<ByteStream> {
    let request = if range.is_full() {
        request
    } else {
        request.header(RANGE, range.header_value())
    };

    let response = request
        .send()
        .await
        .map_err(|e| CacheError::unavailable(uri.to_string(), e))?;
    let response = check_status(response, uri)?;

    // A server may ignore the Range header and send the whole object
    let skip = if response.status() == StatusCode::PARTIAL_CONTENT {
        0
    } else {
        range.start
    };
    if skip > 0 {
        tracing::debug!(uri = %uri, skip, "Server ignored range request, skipping prefix");
    }

    let label = uri.to_string();
    let stream: ByteStream = Box::pin(
        response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| CacheError::unavailable(label.clone(), e))),
    );
    let stream = skip_prefix(stream, skip);

    let limited: ByteStream = match range.end {
        Some(end) => {
            let mut remaining = end.saturating_sub(range.start);
            Box::pin(stream.filter_map(move |chunk| {
                let out = match chunk {
                    Ok(mut bytes) => {
                        if remaining == 0 {
                            None
                        } else {
                            if bytes.len() as u64 > remaining {
                                bytes.truncate(remaining as usize);
                            }
                            remaining -= bytes.len() as u64;
                            Some(Ok(bytes))
                        }
                    }
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(out)
            }))
        }
        None => stream,
    };
    Ok(limited)
}

/// Send a HEAD request; `Ok(None)` when the object does not exist
pub(crate) async fn send_head(request: RequestBuilder, uri: &SourceUri) -> CacheResult<Option<Response>> {
    let response = request
        .send()
        .await
        .map_err(|e| CacheError::unavailable(uri.to_string(), e))?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    check_status(response, uri).map(Some)
}

/// Object size from a HEAD response
pub(crate) fn content_length(headers: &HeaderMap, uri: &SourceUri) -> CacheResult<u64> {
    let raw = headers.get(CONTENT_LENGTH).ok_or_else(|| {
        CacheError::unavailable(uri.to_string(), "response carries no Content-Length")
    })?;
    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            CacheError::unavailable(uri.to_string(), format!("invalid Content-Length {:?}", raw))
        })
}

/// Map HTTP status codes onto cache error kinds
fn check_status(response: Response, uri: &SourceUri) -> CacheResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(CacheError::not_found(
            uri.to_string(),
            format!("source returned HTTP {}", status),
        )),
        _ => Err(CacheError::unavailable(
            uri.to_string(),
            format!("HTTP {}", status),
        )),
    }
}

/// Fetches artifacts from plain HTTP(S) URLs
///
/// Works with HuggingFace `resolve/` URLs; the bearer token (if any) is read
/// from the environment on every request.
pub struct HttpStorage {
    client: Client,
    bearer_token_env: Option<String>,
}

impl HttpStorage {
    pub fn new(bearer_token_env: Option<String>) -> CacheResult<Self> {
        Ok(Self {
            client: build_client()?,
            bearer_token_env,
        })
    }

    fn url<'a>(&self, uri: &'a SourceUri) -> CacheResult<&'a str> {
        match uri {
            SourceUri::Http { url } => Ok(url),
            other => Err(CacheError::Config(format!(
                "http backend cannot serve '{}'",
                other
            ))),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .bearer_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        match token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl StorageBackend for HttpStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    async fn fetch(&self, uri: &SourceUri, range: ByteRange) -> CacheResult<ByteStream> {
        let url = self.url(uri)?;
        tracing::debug!(url = %url, range = %range, "Fetching HTTP source");
        send_ranged(self.authorize(self.client.get(url)), uri, range).await
    }

    async fn exists(&self, uri: &SourceUri) -> CacheResult<bool> {
        let url = self.url(uri)?;
        Ok(send_head(self.authorize(self.client.head(url)), uri)
            .await?
            .is_some())
    }

    async fn size(&self, uri: &SourceUri) -> CacheResult<u64> {
        let url = self.url(uri)?;
        match send_head(self.authorize(self.client.head(url)), uri).await? {
            Some(response) => content_length(response.headers(), uri),
            None => Err(CacheError::not_found(uri.to_string(), "source returned HTTP 404")),
        }
    }
}
