//! Object store client for page images and OCR artifacts.
//!
//! Objects live under a hierarchical key scheme so everything belonging to
//! a page sits under one prefix:
//! `{document_id}/{page_number}/{role}.{ext}` with roles `page`, `thumb`,
//! `figure_N`, and `elements.json`.

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Build the object key for a page-scoped artifact.
pub fn page_object_key(document_id: &str, page_number: u32, role: &str, ext: &str) -> String {
    format!("{}/{}/{}.{}", document_id, page_number, role, ext)
}

/// Key for the per-page OCR element dump.
pub fn elements_object_key(document_id: &str, page_number: u32) -> String {
    format!("{}/{}/elements.json", document_id, page_number)
}

/// Client for the object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload one object and return its public URL.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

/// MinIO-compatible HTTP object store.
///
/// Uploads with plain PUTs and derives public URLs as
/// `{public_base}/{bucket}/{key}`; the bucket is expected to exist with a
/// public read policy.
pub struct HttpObjectStore {
    endpoint: String,
    public_base: String,
    bucket: String,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        public_base: &str,
        bucket: &str,
        timeout: std::time::Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            public_base: public_base.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            client,
        }
    }

    /// Check if the store endpoint is reachable.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/{}", self.endpoint, self.bucket);
        match self.client.head(&url).send().await {
            Ok(_) => true,
            Err(e) => !e.is_connect(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.public_base, self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let url = format!("{}/{}/{}", self.endpoint, self.bucket, key);
        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Upload to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Object store rejected {}", key))?;

        Ok(self.object_url(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_object_key_scheme() {
        assert_eq!(
            page_object_key("doc-1", 3, "page", "jpg"),
            "doc-1/3/page.jpg"
        );
        assert_eq!(
            page_object_key("doc-1", 3, "figure_2", "png"),
            "doc-1/3/figure_2.png"
        );
        assert_eq!(elements_object_key("doc-1", 3), "doc-1/3/elements.json");
    }
}
