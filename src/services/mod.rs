//! Clients for the external services the pipeline depends on.
//!
//! Each backend is an opaque request/response service behind a trait, so
//! the pipeline can be exercised with in-memory substitutes in tests.

pub mod embedder;
pub mod object_store;
pub mod ocr;
pub mod vector_store;

pub use embedder::{EmbeddingClient, HttpEmbeddingClient};
pub use object_store::{HttpObjectStore, ObjectStore};
pub use ocr::{HttpOcrClient, OcrClient};
pub use vector_store::{PointRecord, QdrantHttpStore, VectorStore};
