//! CouchDB HTTP client.
//!
//! Implements [`DocumentStore`] over the CouchDB REST API using reqwest.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::models::{DesignDocument, IndexRow, QueryOptions, Revision};
use crate::store::DocumentStore;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// View query response.
#[derive(Debug, Deserialize)]
struct ViewResponse {
    #[serde(default)]
    rows: Vec<IndexRow>,
}

/// `_all_docs` / `_design_docs` response.
#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    #[serde(default)]
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
    #[serde(default)]
    doc: Option<Value>,
}

/// Response to a document write.
#[derive(Debug, Deserialize)]
struct PutResponse {
    rev: String,
}

/// The CouchDB-backed document store.
pub struct CouchStore {
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
    timeout_seconds: u64,
    http_client: reqwest::Client,
}

impl CouchStore {
    /// Create a client for the server at `config.url`.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| {
                StoreError::Transport(format!("invalid store URL {}: {}", config.url, e))
            })?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to create HTTP client: {}", e)))?;

        info!("Using CouchDB at {}", base_url);

        Ok(Self {
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            timeout_seconds: config.timeout_seconds,
            http_client,
        })
    }

    /// Build a URL from path segments, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                StoreError::Transport(format!("store URL cannot be a base: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http_client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    /// Send a request and map error statuses onto [`StoreError`].
    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response, StoreError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Transport(format!("{} timed out after {}s", what, self.timeout_seconds))
            } else if e.is_connect() {
                StoreError::Transport(format!("cannot connect to CouchDB at {}", self.base_url))
            } else {
                StoreError::Transport(format!("{}: {}", what, e))
            }
        })?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(what.to_string())),
            StatusCode::CONFLICT => Err(StoreError::Conflict(what.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Http {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: Response,
        what: &str,
    ) -> Result<T, StoreError> {
        response
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("{}: {}", what, e)))
    }
}

/// Encode view query options as CouchDB query-string parameters.
///
/// Keys are JSON-encoded, as CouchDB expects.
pub(crate) fn query_pairs(options: &QueryOptions) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();

    if let Some(key) = &options.key {
        pairs.push(("key", key.to_string()));
    }
    if let Some(start) = &options.start_key {
        pairs.push(("start_key", start.to_string()));
    }
    if let Some(end) = &options.end_key {
        pairs.push(("end_key", end.to_string()));
    }
    if let Some(reduce) = options.reduce {
        pairs.push(("reduce", reduce.to_string()));
    }
    if let Some(group) = options.group {
        pairs.push(("group", group.to_string()));
    }
    if options.include_docs {
        pairs.push(("include_docs", "true".to_string()));
    }
    if let Some(limit) = options.limit {
        pairs.push(("limit", limit.to_string()));
    }
    if options.stale_ok {
        // Equivalent of the deprecated stale=ok.
        pairs.push(("stable", "true".to_string()));
        pairs.push(("update", "false".to_string()));
    }

    pairs
}

#[async_trait]
impl DocumentStore for CouchStore {
    async fn list_design_documents(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let what = format!("{}/_design_docs", database);
        let url = self.url(&[database, "_design_docs"])?;
        let response = self.send(self.request(Method::GET, url), &what).await?;
        let body: AllDocsResponse = Self::decode(response, &what).await?;

        Ok(body
            .rows
            .into_iter()
            .filter_map(|row| row.id.strip_prefix("_design/").map(str::to_string))
            .collect())
    }

    async fn get_design_document(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<DesignDocument>, StoreError> {
        let what = format!("{}/_design/{}", database, name);
        let url = self.url(&[database, "_design", name])?;

        match self.send(self.request(Method::GET, url), &what).await {
            Ok(response) => Ok(Some(Self::decode(response, &what).await?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_design_document(
        &self,
        database: &str,
        doc: &DesignDocument,
    ) -> Result<Revision, StoreError> {
        let what = format!("{}/{}", database, doc.id);
        let url = self.url(&[database, "_design", doc.name()])?;

        debug!("PUT {} (rev {:?})", what, doc.rev);
        let response = self
            .send(self.request(Method::PUT, url).json(doc), &what)
            .await?;
        let body: PutResponse = Self::decode(response, &what).await?;

        Ok(body.rev)
    }

    async fn query_index(
        &self,
        database: &str,
        design: &str,
        view: &str,
        options: &QueryOptions,
    ) -> Result<Vec<IndexRow>, StoreError> {
        let url = match &options.partition {
            Some(partition) => self.url(&[
                database,
                "_partition",
                partition,
                "_design",
                design,
                "_view",
                view,
            ])?,
            None => self.url(&[database, "_design", design, "_view", view])?,
        };
        let what = format!("{}/_design/{}/_view/{}", database, design, view);

        let request = self
            .request(Method::GET, url)
            .query(&query_pairs(options));
        let response = self.send(request, &what).await?;
        let body: ViewResponse = Self::decode(response, &what).await?;

        debug!("{} returned {} rows", what, body.rows.len());
        Ok(body.rows)
    }

    async fn list_all_documents(&self, database: &str) -> Result<Vec<Value>, StoreError> {
        let what = format!("{}/_all_docs", database);
        let url = self.url(&[database, "_all_docs"])?;
        let request = self
            .request(Method::GET, url)
            .query(&[("include_docs", "true")]);
        let response = self.send(request, &what).await?;
        let body: AllDocsResponse = Self::decode(response, &what).await?;

        Ok(body
            .rows
            .into_iter()
            .filter(|row| !row.id.starts_with("_design/"))
            .filter_map(|row| row.doc)
            .collect())
    }
}
