//! Calendar document store + HTTP fetch utilities for YAEF.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid document key {0:?}")]
    InvalidKey(String),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable read / replace of named documents.
///
/// `write` replaces the whole document atomically; readers never observe a
/// partially written document. There is no versioning, so callers must keep to
/// one writer per document.
#[async_trait]
pub trait Store: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn write(&self, key: &str, document: &[u8]) -> Result<(), StoreError>;
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// One `<key>.json` file per document under `root`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.document_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                action: "reading",
                path,
                source,
            }),
        }
    }

    /// Writes to a temp file beside the target, then renames over it.
    async fn write(&self, key: &str, document: &[u8]) -> Result<(), StoreError> {
        let path = self.document_path(key)?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                action: "creating store directory",
                path: self.root.clone(),
                source,
            })?;

        let temp_path = self
            .root
            .join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        if let Err(source) = write_temp_file(&temp_path, document).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                action: "writing temp document",
                path: temp_path,
                source,
            });
        }

        match fs::rename(&temp_path, &path).await {
            Ok(()) => {
                debug!(key, bytes = document.len(), "document replaced");
                Ok(())
            }
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Io {
                    action: "atomically renaming document",
                    path,
                    source,
                })
            }
        }
    }
}

async fn write_temp_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// In-process store, mainly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Vec<u8>>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: &str, document: impl Into<Vec<u8>>) {
        self.documents
            .lock()
            .await
            .insert(key.to_string(), document.into());
    }

    pub async fn write_count(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        Ok(self.documents.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, document: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        self.documents
            .lock()
            .await
            .insert(key.to_string(), document.to_vec());
        *self.writes.lock().await += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// Single-attempt HTTP client presenting a desktop browser request profile.
/// There are no retries; the next scheduled sync is the retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.8,*/*;q=0.7",
            ),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_query(url, &[]).await
    }

    pub async fn fetch_with_query(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send("GET", url, self.client.get(url).query(query)).await
    }

    /// POSTs `body` as JSON; status handling matches [`HttpFetcher::fetch`].
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        self.send("POST", url, self.client.post(url).query(query).json(body))
            .await
    }

    async fn send(
        &self,
        method: &'static str,
        url: &str,
        request: RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method, url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn missing_document_reads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        assert!(store.read("earnings").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn atomic_write_replaces_whole_document() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("data"));

        store.write("earnings", br#"{"a":1}"#).await.expect("first write");
        store.write("earnings", br#"{"b":2}"#).await.expect("second write");

        let bytes = store.read("earnings").await.expect("read").expect("present");
        assert_eq!(bytes, br#"{"b":2}"#);

        let leftovers = std::fs::read_dir(store.root())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        assert!(store.document_path("earnings").unwrap().exists());
    }

    #[tokio::test]
    async fn document_keys_cannot_escape_the_root() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        let err = store.write("../evil", b"{}").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn memory_store_counts_writes() {
        let store = MemoryStore::new();
        store.write("economics", b"{}").await.unwrap();
        assert_eq!(store.read("economics").await.unwrap().as_deref(), Some(&b"{}"[..]));
        assert_eq!(store.write_count().await, 1);
    }

    #[tokio::test]
    async fn fetch_sends_browser_profile_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendar"))
            .and(query_param("offset", "100"))
            .and(header_exists("user-agent"))
            .and(header_exists("accept-language"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<table></table>"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = fetcher
            .fetch_with_query(&format!("{}/calendar", server.uri()), &[("offset", "100".to_string())])
            .await
            .expect("fetch");
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.text(), "<table></table>");
    }

    #[tokio::test]
    async fn post_json_sends_body_and_query() {
        let server = MockServer::start().await;
        let query = json!({"offset": 0, "size": 100});
        Mock::given(method("POST"))
            .and(path("/visualization"))
            .and(query_param("lang", "en-US"))
            .and(header("content-type", "application/json"))
            .and(body_json(&query))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = fetcher
            .post_json(
                &format!("{}/visualization", server.uri()),
                &[("lang", "en-US".to_string())],
                &query,
            )
            .await
            .expect("post");
        assert_eq!(resp.text(), "{}");
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(err.status(), Some(503));
    }
}
