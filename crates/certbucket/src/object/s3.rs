//! S3-compatible object store over HTTP.
//!
//! Requests use path-style addressing (`{endpoint}/{bucket}/{key}`), which
//! works with MinIO, Ceph RGW, Garage and AWS S3 alike, and are signed with
//! AWS Signature Version 4.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

use super::sigv4::{self, Credentials, RequestParts};
use super::{ObjectMeta, ObjectStore};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};

/// Longest error body kept in [`StorageError::Backend`] messages.
const MAX_ERROR_BODY: usize = 512;

/// Object store backed by an S3-compatible service.
#[derive(Debug)]
pub struct S3ObjectStore {
    client: reqwest::Client,
    base: Url,
    bucket: String,
    region: String,
    credentials: Credentials,
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
    size: u64,
    last_modified: DateTime<Utc>,
}

impl S3ObjectStore {
    /// Build a client for the configured endpoint.
    ///
    /// The endpoint may be `host[:port]`, in which case `https` is used
    /// unless `insecure` is set, or a full URL with an explicit scheme.
    /// No request is sent.
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::Config("bucket name is empty".to_string()));
        }

        let endpoint = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            let scheme = if config.insecure { "http" } else { "https" };
            format!("{}://{}", scheme, config.endpoint)
        };
        let base = Url::parse(&endpoint).map_err(|e| {
            StorageError::Config(format!("invalid endpoint '{}': {}", config.endpoint, e))
        })?;
        if base.host_str().is_none() {
            return Err(StorageError::Config(format!(
                "endpoint '{}' has no host",
                config.endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StorageError::Config(format!("failed to build HTTP client: {}", e)))?;

        debug!(
            endpoint = %base,
            bucket = %config.bucket,
            region = %config.region,
            "Created S3 object store"
        );

        Ok(Self {
            client,
            base,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            credentials: Credentials {
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key.clone(),
            },
        })
    }

    /// The bucket this store writes to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Check that the bucket exists, giving up after `timeout`.
    pub async fn bucket_exists(&self, timeout: Duration) -> StorageResult<bool> {
        let request = self.send(Method::HEAD, None, Vec::new(), Bytes::new());
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| StorageError::Transport(format!("bucket check timed out after {:?}", timeout)))??;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(backend_error(response).await),
        }
    }

    fn url_for(&self, key: Option<&str>, query: &[(String, String)]) -> Url {
        let base_path = self.base.path().trim_end_matches('/');
        let raw_path = match key {
            Some(key) => format!("{}/{}/{}", base_path, self.bucket, key),
            None => format!("{}/{}", base_path, self.bucket),
        };

        let mut url = self.base.clone();
        url.set_path(&sigv4::encode_path(&raw_path));
        if query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&sigv4::canonical_query(query)));
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: Vec<(String, String)>,
        body: Bytes,
    ) -> StorageResult<Response> {
        let url = self.url_for(key, &query);
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(StorageError::Config(format!("endpoint '{}' has no host", url)));
            }
        };

        let hash = sigv4::payload_hash(&body);
        let signed = sigv4::sign(
            &self.credentials,
            &self.region,
            &RequestParts {
                method: method.as_str(),
                host: &host,
                path: url.path(),
                query: &query,
                payload_hash: &hash,
            },
            Utc::now(),
        )?;

        trace!(method = %method, url = %url, size = body.len(), "Sending S3 request");

        let response = self
            .client
            .request(method, url)
            .header("authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .body(body)
            .send()
            .await?;

        trace!(status = %response.status(), "S3 response");
        Ok(response)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let response = self.send(Method::GET, Some(key), Vec::new(), Bytes::new()).await?;
        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            _ => Err(backend_error(response).await),
        }
    }

    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()> {
        let response = self.send(Method::PUT, Some(key), Vec::new(), body).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(backend_error(response).await)
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let response = self
            .send(Method::DELETE, Some(key), Vec::new(), Bytes::new())
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(backend_error(response).await),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = continuation.take() {
                query.push(("continuation-token".to_string(), token));
            }

            let response = self.send(Method::GET, None, query, Bytes::new()).await?;
            if !response.status().is_success() {
                return Err(backend_error(response).await);
            }

            let body = response.text().await?;
            let page: ListBucketResult = quick_xml::de::from_str(&body)
                .map_err(|e| StorageError::InvalidResponse(format!("list objects: {}", e)))?;

            objects.extend(page.contents.into_iter().map(|entry| ObjectMeta {
                key: entry.key,
                size: entry.size,
                modified: entry.last_modified,
            }));

            match page.next_continuation_token {
                Some(token) if page.is_truncated => continuation = Some(token),
                _ => break,
            }
        }

        debug!(prefix = %prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn stat(&self, key: &str) -> StorageResult<ObjectMeta> {
        let response = self
            .send(Method::HEAD, Some(key), Vec::new(), Bytes::new())
            .await?;
        match response.status() {
            status if status.is_success() => {
                let headers = response.headers();
                let size = headers
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| {
                        StorageError::InvalidResponse(format!("missing Content-Length for '{}'", key))
                    })?;
                let modified = headers
                    .get(reqwest::header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                    .map(|v| v.with_timezone(&Utc))
                    .ok_or_else(|| {
                        StorageError::InvalidResponse(format!("missing Last-Modified for '{}'", key))
                    })?;
                Ok(ObjectMeta {
                    key: key.to_string(),
                    size,
                    modified,
                })
            }
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            _ => Err(backend_error(response).await),
        }
    }
}

async fn backend_error(response: Response) -> StorageError {
    let status = response.status();
    let mut message = response.text().await.unwrap_or_default();
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("unknown").to_string();
    }
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    StorageError::Backend {
        status: status.as_u16(),
        message,
    }
}
