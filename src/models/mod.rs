//! Record types shared between the pipeline and external stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a page image ended up, recorded in the vector-store payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStorage {
    /// Uploaded to the object store; `image_url` points at it.
    ObjectStore,
    /// Upload failed or never ran; no URL available.
    None,
}

impl ImageStorage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectStore => "object_store",
            Self::None => "none",
        }
    }
}

/// Per-page storage result published into the image registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Same as the page's `image_id`.
    pub page_id: String,
    pub image_url: Option<String>,
    pub storage: ImageStorage,
    pub content_type: String,
    pub byte_size: usize,
    pub width: u32,
    pub height: u32,
    pub thumbnail_url: Option<String>,
}

impl ImageRecord {
    /// Fallback record for a page whose upload never surfaced.
    pub fn missing(page_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            image_url: None,
            storage: ImageStorage::None,
            content_type: String::new(),
            byte_size: 0,
            width: 0,
            height: 0,
            thumbnail_url: None,
        }
    }
}

/// A labelled axis-aligned region on a page, in the OCR service's own
/// coordinate space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRegion {
    pub id: String,
    pub label: String,
    /// `[x1, y1, x2, y2]`, raw as returned by the OCR service.
    pub bbox: [i32; 4],
}

/// Per-page OCR result published into the ocr registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPageResult {
    pub text: String,
    pub markdown: String,
    pub raw_text: String,
    pub regions: Vec<OcrRegion>,
}

/// Outcome of a completed ingestion.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: String,
    pub job_id: String,
    pub filename: String,
    pub total_pages: u32,
    pub total_batches: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed: std::time::Duration,
}

impl IngestReport {
    /// Pages per second over the whole run, for summary output.
    pub fn pages_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_pages as f64 / secs
        } else {
            0.0
        }
    }
}
