//! Vector store client.
//!
//! Writes one point per page into a Qdrant-style HTTP store. Each point
//! carries the page's multi-vector under the `original` name and, when
//! mean pooling is enabled, the pooled row/column variants used for
//! two-stage retrieval. The collection itself is created out-of-band; the
//! ingest preflight only verifies its configured dimension.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::pipeline::types::MultiVector;

/// Named vectors stored with each point.
#[derive(Debug, Clone, Serialize)]
pub struct PointVectors {
    pub original: MultiVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_pooling_rows: Option<MultiVector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_pooling_columns: Option<MultiVector>,
}

/// One page record ready for upsert.
#[derive(Debug, Clone, Serialize)]
pub struct PointRecord {
    /// The page's `image_id`; primary key in the store.
    pub id: String,
    #[serde(rename = "vector")]
    pub vectors: PointVectors,
    pub payload: serde_json::Value,
}

/// Client for the vector store.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert a batch of points into the collection.
    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()>;

    /// Configured dimension of the collection's `original` vector.
    async fn collection_dim(&self, collection: &str) -> Result<usize>;
}

#[derive(Debug, Serialize)]
struct UpsertRequest {
    points: Vec<PointRecord>,
}

/// Qdrant HTTP implementation of [`VectorStore`].
pub struct QdrantHttpStore {
    endpoint: String,
    client: reqwest::Client,
}

impl QdrantHttpStore {
    pub fn new(endpoint: &str, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Check if the store answers collection listing.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/collections", self.endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl VectorStore for QdrantHttpStore {
    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()> {
        let url = format!("{}/collections/{}/points?wait=true", self.endpoint, collection);
        let response = self
            .client
            .put(&url)
            .json(&UpsertRequest { points })
            .send()
            .await
            .with_context(|| format!("Upsert to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Vector store rejected upsert ({}): {}", status, body);
        }
        Ok(())
    }

    async fn collection_dim(&self, collection: &str) -> Result<usize> {
        let url = format!("{}/collections/{}", self.endpoint, collection);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Collection info request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Collection {} not available", collection))?;

        let body: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse collection info")?;

        // The `original` vector config carries the model dimension; named
        // vector configs live under result.config.params.vectors.
        let size = body
            .pointer("/result/config/params/vectors/original/size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                anyhow!(
                    "Collection {} has no 'original' vector size in its config",
                    collection
                )
            })?;
        Ok(size as usize)
    }
}
