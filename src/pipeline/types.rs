//! Data types flowing between pipeline stages.

use image::DynamicImage;

/// Join key for registries and completion accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub document_id: String,
    pub batch_id: u32,
}

impl BatchKey {
    pub fn new(document_id: impl Into<String>, batch_id: u32) -> Self {
        Self {
            document_id: document_id.into(),
            batch_id,
        }
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.document_id, self.batch_id)
    }
}

/// Per-page metadata assembled at rasterization time and carried
/// verbatim through every stage.
#[derive(Debug, Clone)]
pub struct PageMetadata {
    pub document_id: String,
    /// Same value as the page's entry in `PageBatch::image_ids`.
    pub page_id: String,
    pub filename: String,
    /// 1-indexed page number within the document.
    pub page_number: u32,
    pub total_pages: u32,
    pub page_width_px: u32,
    pub page_height_px: u32,
    pub file_size_bytes: u64,
}

/// A batch of rasterized pages ready for processing.
///
/// Each consumer stage receives its own copy; images are never shared
/// mutably across stages. `image_ids` carry identical content in every
/// copy so downstream joins stay valid.
#[derive(Debug, Clone)]
pub struct PageBatch {
    pub document_id: String,
    pub filename: String,
    /// Batch sequence number within the document, starting at 0.
    pub batch_id: u32,
    /// First page number in the batch (1-indexed).
    pub page_start: u32,
    pub images: Vec<DynamicImage>,
    /// Unique ID per page, generated at rasterization and shared across stages.
    pub image_ids: Vec<String>,
    pub metadata: Vec<PageMetadata>,
    pub total_pages: u32,
    pub file_size_bytes: u64,
}

impl PageBatch {
    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.document_id.clone(), self.batch_id)
    }

    pub fn num_pages(&self) -> usize {
        self.images.len()
    }

    /// Last page number in the batch (1-indexed, inclusive).
    pub fn page_end(&self) -> u32 {
        self.page_start + self.images.len() as u32 - 1
    }
}

/// One multi-vector embedding: a sequence of token vectors for a page.
pub type MultiVector = Vec<Vec<f32>>;

/// A batch with embeddings generated, ready for upsert.
#[derive(Debug, Clone)]
pub struct EmbeddedBatch {
    pub document_id: String,
    pub filename: String,
    pub batch_id: u32,
    pub page_start: u32,
    pub original_embeddings: Vec<MultiVector>,
    /// Present iff mean-pooling prefetch vectors are enabled.
    pub pooled_by_rows: Option<Vec<MultiVector>>,
    pub pooled_by_columns: Option<Vec<MultiVector>>,
    pub image_ids: Vec<String>,
    pub metadata: Vec<PageMetadata>,
}

impl EmbeddedBatch {
    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.document_id.clone(), self.batch_id)
    }

    pub fn num_pages(&self) -> usize {
        self.image_ids.len()
    }

    pub fn page_end(&self) -> u32 {
        self.page_start + self.image_ids.len() as u32 - 1
    }
}
