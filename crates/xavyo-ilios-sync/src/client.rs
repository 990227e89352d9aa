//! Read-only Ilios API client.
//!
//! [`DirectoryClient`] is the seam the expander and identity mapper depend on;
//! [`IliosClient`] implements it over HTTP with reqwest. Tests and embedders can
//! provide their own implementation.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument, warn};

use crate::config::{ApiToken, IliosConfig};
use crate::error::{IliosError, IliosResult};
use crate::ids::RemoteId;
use crate::models::{RemoteNode, ResourceKind};

/// Query parameter carrying each id of a batch request.
pub const ID_FILTER_PARAM: &str = "filters[id][]";

/// Typed read access to the remote directory.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Fetch a single record.
    ///
    /// Returns [`IliosError::NotFound`] when the record does not exist.
    async fn fetch(&self, kind: ResourceKind, id: RemoteId) -> IliosResult<RemoteNode>;

    /// Fetch several records of one kind.
    ///
    /// Ids without a record are absent from the returned map.
    async fn fetch_batch(
        &self,
        kind: ResourceKind,
        ids: &BTreeSet<RemoteId>,
    ) -> IliosResult<HashMap<RemoteId, RemoteNode>>;
}

/// HTTP client for the Ilios v3 REST API.
#[derive(Debug, Clone)]
pub struct IliosClient {
    http_client: Client,
    base_url: String,
    token: ApiToken,
    max_batch_size: usize,
}

impl IliosClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &IliosConfig) -> IliosResult<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent("xavyo-ilios-sync/1.0")
            .build()
            .map_err(|e| IliosError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self::with_http_client(config, http_client))
    }

    /// Create a client with a pre-built `reqwest::Client` (for testing).
    #[must_use]
    pub fn with_http_client(config: &IliosConfig, http_client: Client) -> Self {
        Self {
            http_client,
            base_url: config.api_base_url(),
            token: config.api_token.clone(),
            max_batch_size: config.max_batch_size.max(1),
        }
    }

    /// Root of the versioned API.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn record_url(&self, kind: ResourceKind, id: RemoteId) -> String {
        format!("{}/{}/{}", self.base_url, kind.endpoint(), id)
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/{}", self.base_url, kind.endpoint())
    }

    /// GET a URL and return the decoded body, or `None` on 404.
    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> IliosResult<Option<serde_json::Value>> {
        if self.token.is_expired_at(Utc::now()) {
            return Err(IliosError::RemoteUnavailable(
                "API token has expired".to_string(),
            ));
        }

        debug!(url = %url, params = query.len(), "Ilios GET");
        let mut builder = self.http_client.get(url).bearer_auth(self.token.expose());
        if !query.is_empty() {
            builder = builder.query(query);
        }
        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            return serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| IliosError::Parse(format!("Failed to parse response: {e}")));
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());

        match status {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(status = %status, "Ilios rejected API token");
                Err(IliosError::RemoteUnavailable(format!(
                    "Authentication failed ({status}): {body}"
                )))
            }
            _ => Err(IliosError::RemoteUnavailable(if body.is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {body}")
            })),
        }
    }
}

#[async_trait]
impl DirectoryClient for IliosClient {
    #[instrument(skip(self))]
    async fn fetch(&self, kind: ResourceKind, id: RemoteId) -> IliosResult<RemoteNode> {
        let url = self.record_url(kind, id);
        let body = self
            .get_json(&url, &[])
            .await?
            .ok_or(IliosError::NotFound { kind, id })?;

        RemoteNode::from_envelope(kind, body)?
            .into_iter()
            .find(|node| node.id() == id)
            .ok_or(IliosError::NotFound { kind, id })
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn fetch_batch(
        &self,
        kind: ResourceKind,
        ids: &BTreeSet<RemoteId>,
    ) -> IliosResult<HashMap<RemoteId, RemoteNode>> {
        let mut found = HashMap::with_capacity(ids.len());
        if ids.is_empty() {
            return Ok(found);
        }

        let url = self.collection_url(kind);
        let ordered: Vec<RemoteId> = ids.iter().copied().collect();

        for chunk in ordered.chunks(self.max_batch_size) {
            let query: Vec<(&str, String)> = chunk
                .iter()
                .map(|id| (ID_FILTER_PARAM, id.to_string()))
                .collect();

            let Some(body) = self.get_json(&url, &query).await? else {
                debug!(kind = %kind, "Batch endpoint returned 404, treating as empty");
                continue;
            };

            for node in RemoteNode::from_envelope(kind, body)? {
                if ids.contains(&node.id()) {
                    found.insert(node.id(), node);
                }
            }
        }

        debug!(
            kind = %kind,
            requested = ids.len(),
            found = found.len(),
            "Fetched batch"
        );
        Ok(found)
    }
}
