//! S3-compatible object store backend (AWS S3, MinIO, Ceph RGW, R2, ...)
//!
//! Requests are path-style (`{endpoint}/{bucket}/{key}`) and signed with SigV4.
//! Credentials are looked up in the environment on every request so rotated
//! secrets are picked up without a restart.

use super::http::{build_client, content_length, send_head, send_ranged};
use super::sigv4::{self, Credentials, EMPTY_PAYLOAD_SHA256, SigningRequest};
use super::{ByteRange, ByteStream, StorageBackend};
use crate::config::ObjectStoreConfig;
use crate::error::{CacheError, CacheResult};
use crate::models::{BackendKind, SourceUri};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Url};

/// Where object store credentials come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsRef {
    /// Unsigned requests (public buckets)
    Anonymous,
    /// Names of environment variables read at call time
    Env {
        access_key_var: String,
        secret_key_var: String,
        session_token_var: String,
    },
}

impl CredentialsRef {
    /// Resolve to concrete credentials; `None` means send unsigned
    pub fn resolve(&self) -> Option<Credentials> {
        match self {
            Self::Anonymous => None,
            Self::Env {
                access_key_var,
                secret_key_var,
                session_token_var,
            } => {
                let access_key = std::env::var(access_key_var).ok()?;
                let secret_key = std::env::var(secret_key_var).ok()?;
                if access_key.is_empty() || secret_key.is_empty() {
                    return None;
                }
                let session_token = std::env::var(session_token_var)
                    .ok()
                    .filter(|t| !t.is_empty());
                Some(Credentials {
                    access_key,
                    secret_key,
                    session_token,
                })
            }
        }
    }
}

/// S3-compatible object store reached over HTTP
pub struct ObjectStoreStorage {
    client: Client,
    endpoint: Url,
    region: String,
    credentials: CredentialsRef,
}

impl ObjectStoreStorage {
    pub fn new(endpoint: &str, region: String, credentials: CredentialsRef) -> CacheResult<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            CacheError::Config(format!("invalid object store endpoint '{}': {}", endpoint, e))
        })?;
        if endpoint.host_str().is_none() {
            return Err(CacheError::Config(format!(
                "object store endpoint '{}' has no host",
                endpoint
            )));
        }
        Ok(Self {
            client: build_client()?,
            endpoint,
            region,
            credentials,
        })
    }

    pub fn from_config(config: &ObjectStoreConfig) -> CacheResult<Self> {
        let credentials = if config.anonymous {
            CredentialsRef::Anonymous
        } else {
            CredentialsRef::Env {
                access_key_var: config.access_key_env.clone(),
                secret_key_var: config.secret_key_env.clone(),
                session_token_var: config.session_token_env.clone(),
            }
        };
        Self::new(&config.endpoint, config.region.clone(), credentials)
    }

    /// Encoded request path and full URL for an object
    fn object_url(&self, uri: &SourceUri) -> CacheResult<(String, Url)> {
        let SourceUri::ObjectStore { bucket, key } = uri else {
            return Err(CacheError::Config(format!(
                "object store backend cannot serve '{}'",
                uri
            )));
        };

        let base_path = self.endpoint.path().trim_end_matches('/');
        let path = format!(
            "{}/{}/{}",
            base_path,
            sigv4::encode_path(bucket),
            sigv4::encode_path(key)
        );

        let mut url = self.endpoint.clone();
        url.set_path(&path);
        url.set_query(None);
        Ok((path, url))
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Build a (possibly signed) request
    fn request(&self, method: Method, uri: &SourceUri, range: ByteRange) -> CacheResult<RequestBuilder> {
        let (path, url) = self.object_url(uri)?;
        let mut builder = self.client.request(method.clone(), url);

        let Some(credentials) = self.credentials.resolve() else {
            if self.credentials != CredentialsRef::Anonymous {
                tracing::warn!(uri = %uri, "Object store credentials not set, sending unsigned request");
            }
            return Ok(builder);
        };

        let now = chrono::Utc::now();
        let mut headers: Vec<(&str, String)> = vec![
            ("host", self.host_header()),
            ("x-amz-content-sha256", EMPTY_PAYLOAD_SHA256.to_string()),
            ("x-amz-date", sigv4::amz_date(now)),
        ];
        if !range.is_full() {
            headers.push(("range", range.header_value()));
        }
        if let Some(token) = &credentials.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }

        let authorization = sigv4::authorization(
            &SigningRequest {
                method: method.as_str(),
                canonical_uri: &path,
                headers: &headers,
                payload_sha256: EMPTY_PAYLOAD_SHA256,
            },
            &credentials,
            &self.region,
            "s3",
            now,
        );

        // reqwest sets Host itself; Range is added by send_ranged
        for (name, value) in headers {
            if name != "host" && name != "range" {
                builder = builder.header(name, value);
            }
        }
        Ok(builder.header(reqwest::header::AUTHORIZATION, authorization))
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    async fn fetch(&self, uri: &SourceUri, range: ByteRange) -> CacheResult<ByteStream> {
        tracing::debug!(uri = %uri, range = %range, endpoint = %self.endpoint, "Fetching object");
        let request = self.request(Method::GET, uri, range)?;
        send_ranged(request, uri, range).await
    }

    async fn exists(&self, uri: &SourceUri) -> CacheResult<bool> {
        let request = self.request(Method::HEAD, uri, ByteRange::full())?;
        Ok(send_head(request, uri).await?.is_some())
    }

    async fn size(&self, uri: &SourceUri) -> CacheResult<u64> {
        let request = self.request(Method::HEAD, uri, ByteRange::full())?;
        match send_head(request, uri).await? {
            Some(response) => content_length(response.headers(), uri),
            None => Err(CacheError::not_found(uri.to_string(), "object does not exist")),
        }
    }
}
