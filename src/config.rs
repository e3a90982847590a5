//! Configuration for pagedex.
//!
//! Loaded from a TOML file with serde defaults so a minimal config only
//! names the service endpoints. Everything is validated once before the
//! pipeline is constructed.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::imaging::PageImageFormat;

/// Batching and backpressure knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Pages per batch. Also the per-stage inner fan-out (storage uploads,
    /// OCR requests).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches allowed in flight at once; bounds peak memory to roughly
    /// `max_in_flight_batches * batch_size` decoded pages.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_batches: usize,
    /// Hard cap on how long the upsert stage waits for a registry entry.
    #[serde(default = "default_join_wait")]
    pub max_join_wait_seconds: f64,
    /// Rasterization resolution.
    #[serde(default = "default_decode_dpi")]
    pub decode_dpi: u32,
}

fn default_batch_size() -> usize {
    4
}
fn default_max_in_flight() -> usize {
    1
}
fn default_join_wait() -> f64 {
    30.0
}
fn default_decode_dpi() -> u32 {
    150
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_in_flight_batches: default_max_in_flight(),
            max_join_wait_seconds: default_join_wait(),
            decode_dpi: default_decode_dpi(),
        }
    }
}

impl IngestionConfig {
    /// Capacity of each stage queue.
    pub fn queue_capacity(&self) -> usize {
        (self.max_in_flight_batches * 2).max(2)
    }

    pub fn join_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_join_wait_seconds)
    }
}

/// Page image encoding settings shared by the storage and OCR stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub format: PageImageFormat,
    /// Compression quality for lossy formats (1-100).
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Max thumbnail width in pixels; absent disables thumbnails.
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: Option<u32>,
}

fn default_quality() -> u8 {
    75
}
fn default_thumbnail_width() -> Option<u32> {
    Some(crate::imaging::DEFAULT_THUMBNAIL_WIDTH)
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            format: PageImageFormat::default(),
            quality: default_quality(),
            thumbnail_width: default_thumbnail_width(),
        }
    }
}

/// Embedding service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    /// Compute mean-pooled row/column prefetch vectors.
    #[serde(default = "default_true")]
    pub mean_pooling: bool,
    #[serde(default = "default_embed_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_embedding_endpoint() -> String {
    "http://localhost:7001".to_string()
}
fn default_true() -> bool {
    true
}
fn default_embed_timeout() -> u64 {
    300
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            mean_pooling: default_true(),
            request_timeout_seconds: default_embed_timeout(),
        }
    }
}

/// OCR service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ocr_endpoint")]
    pub endpoint: String,
    /// Processing mode (quality/speed preset).
    #[serde(default = "default_ocr_mode")]
    pub mode: String,
    /// Task type (markdown, plain_ocr, ...).
    #[serde(default = "default_ocr_task")]
    pub task: String,
    #[serde(default = "default_true")]
    pub include_grounding: bool,
    /// Ask the service to extract figure crops.
    #[serde(default)]
    pub include_images: bool,
    /// Persist per-page region lists and figure crops to the object store.
    #[serde(default)]
    pub store_elements: bool,
    #[serde(default = "default_ocr_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_ocr_endpoint() -> String {
    "http://localhost:7002".to_string()
}
fn default_ocr_mode() -> String {
    "gundam".to_string()
}
fn default_ocr_task() -> String {
    "markdown".to_string()
}
fn default_ocr_timeout() -> u64 {
    300
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            endpoint: default_ocr_endpoint(),
            mode: default_ocr_mode(),
            task: default_ocr_task(),
            include_grounding: default_true(),
            include_images: false,
            store_elements: false,
            request_timeout_seconds: default_ocr_timeout(),
        }
    }
}

/// Object store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,
    /// Base for public URLs; defaults to `endpoint` when empty.
    #[serde(default)]
    pub public_base: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Extra upload attempts per page after the first.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_store_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_store_endpoint() -> String {
    "http://localhost:9000".to_string()
}
fn default_bucket() -> String {
    "pagedex".to_string()
}
fn default_retries() -> u32 {
    2
}
fn default_store_timeout() -> u64 {
    60
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_store_endpoint(),
            public_base: String::new(),
            bucket: default_bucket(),
            retries: default_retries(),
            request_timeout_seconds: default_store_timeout(),
        }
    }
}

impl ObjectStoreConfig {
    pub fn public_base(&self) -> &str {
        if self.public_base.is_empty() {
            &self.endpoint
        } else {
            &self.public_base
        }
    }
}

/// Vector store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_vector_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_vector_endpoint() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "pages".to_string()
}
fn default_vector_timeout() -> u64 {
    120
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_vector_endpoint(),
            collection: default_collection(),
            request_timeout_seconds: default_vector_timeout(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges and endpoints the pipeline depends on.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ingestion.batch_size < 1 {
            bail!("ingestion.batch_size must be at least 1");
        }
        if self.ingestion.max_in_flight_batches < 1 {
            bail!("ingestion.max_in_flight_batches must be at least 1");
        }
        if self.ingestion.max_join_wait_seconds <= 0.0 {
            bail!("ingestion.max_join_wait_seconds must be positive");
        }
        if !(1..=100).contains(&self.image.quality) {
            bail!("image.quality must be between 1 and 100");
        }
        if self.image.thumbnail_width == Some(0) {
            bail!("image.thumbnail_width must be positive when set");
        }

        validate_endpoint("embedding.endpoint", &self.embedding.endpoint)?;
        if self.ocr.enabled {
            validate_endpoint("ocr.endpoint", &self.ocr.endpoint)?;
        }
        validate_endpoint("object_store.endpoint", &self.object_store.endpoint)?;
        if !self.object_store.public_base.is_empty() {
            validate_endpoint("object_store.public_base", &self.object_store.public_base)?;
        }
        validate_endpoint("vector_store.endpoint", &self.vector_store.endpoint)?;
        Ok(())
    }
}

fn validate_endpoint(name: &str, value: &str) -> anyhow::Result<()> {
    let url =
        Url::parse(value).with_context(|| format!("{} is not a valid URL: {}", name, value))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("{} must be an http or https URL, got {}", name, value);
    }
    Ok(())
}
