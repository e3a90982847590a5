//! pagedex - multimodal PDF ingestion for visual retrieval indexes.
//!
//! Ingests PDF documents into a multimodal retrieval index: every page
//! gets a multi-vector visual embedding, a stored rasterized image, and
//! an OCR result with labelled region bounding boxes, joined per page
//! into a single vector-store record. The streaming pipeline overlaps
//! embedding, storage, and OCR so results land while later pages are
//! still decoding.

pub mod cli;
pub mod config;
pub mod imaging;
pub mod models;
pub mod pdf;
pub mod pipeline;
pub mod services;

pub use config::Config;
pub use models::IngestReport;
pub use pipeline::{
    CancelFlag, EventSender, IngestOptions, PipelineError, PipelineEvent, PipelineServices,
    StreamingPipeline,
};
