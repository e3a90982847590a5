//! Streaming ingestion pipeline.
//!
//! A four-stage, queue-coupled scheduler: the rasterizer broadcasts page
//! batches to the embedding, storage, and OCR stages, whose per-batch
//! results the upsert stage joins through two shared registries keyed by
//! `(document_id, batch_id)`. An admission semaphore bounds in-flight
//! batches; a per-batch completion tracker releases permits and reports
//! progress. Overlapping the GPU-bound embedding, I/O-bound storage, and
//! GPU-bound OCR work is what gets first results out in seconds instead
//! of waiting for the whole document.

pub mod embedding;
pub mod error;
pub mod events;
pub mod ocr;
pub mod queue;
pub mod rasterizer;
pub mod registry;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod upsert;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::imaging::ImageEncoder;
use crate::models::IngestReport;
use crate::pdf::PageDecoder;
use crate::services::embedder::EmbeddingClient;
use crate::services::object_store::ObjectStore;
use crate::services::ocr::OcrClient;
use crate::services::vector_store::VectorStore;

pub use error::{PipelineError, StageKind};
pub use events::{EventSender, PipelineEvent};
pub use tracker::ProgressFn;

use embedding::EmbeddingStage;
use error::FailureSlot;
use ocr::OcrStage;
use queue::{bounded, StopFlag};
use rasterizer::PdfRasterizer;
use registry::BatchRegistry;
use storage::StorageStage;
use tracker::CompletionTracker;
use upsert::UpsertStage;

/// How long consumer loops wait on their queue before re-checking the
/// stop flag.
pub(crate) const STAGE_POLL: Duration = Duration::from_millis(250);

/// How long the coordinator waits for each worker during teardown.
const WORKER_JOIN_WAIT: Duration = Duration::from_secs(5);

/// How often the coordinator re-checks completion, failure, and
/// cancellation while draining.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Cooperative cancellation handle for an ingestion job.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The pipeline stops at the next page boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The external collaborators a pipeline runs against.
pub struct PipelineServices {
    pub decoder: Arc<dyn PageDecoder>,
    pub embedder: Arc<dyn EmbeddingClient>,
    /// Absent means OCR runs in placeholder mode when enabled.
    pub ocr: Option<Arc<dyn OcrClient>>,
    pub object_store: Arc<dyn ObjectStore>,
    pub vector_store: Arc<dyn VectorStore>,
}

/// Per-job options for [`StreamingPipeline::ingest`].
pub struct IngestOptions {
    /// Job identifier recorded in every payload; generated when absent.
    pub job_id: Option<String>,
    pub cancel: CancelFlag,
    /// Invoked with the cumulative completed page count, once per batch.
    pub progress: Option<Arc<ProgressFn>>,
    pub events: EventSender,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            cancel: CancelFlag::new(),
            progress: None,
            events: EventSender::disabled(),
        }
    }
}

/// Orchestrates the streaming PDF processing pipeline.
///
/// Owns no stage logic itself: it wires queues, registries, the admission
/// semaphore, and the completion tracker together, runs the stage
/// workers, and turns their shared failure state into one typed result
/// for the caller.
pub struct StreamingPipeline {
    services: PipelineServices,
    config: Config,
}

impl StreamingPipeline {
    pub fn new(services: PipelineServices, config: Config) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Self { services, config })
    }

    /// Verify the embedding model's dimension matches the target
    /// collection before any work is admitted.
    pub async fn preflight(&self) -> Result<(), PipelineError> {
        let info = self
            .services
            .embedder
            .model_info()
            .await
            .map_err(|e| PipelineError::Internal(format!("Embedding service probe failed: {:#}", e)))?;
        let collection_dim = self
            .services
            .vector_store
            .collection_dim(&self.config.vector_store.collection)
            .await
            .map_err(|e| PipelineError::Internal(format!("Vector store probe failed: {:#}", e)))?;

        if info.dim != collection_dim {
            return Err(PipelineError::DimensionMismatch {
                model_dim: info.dim,
                collection_dim,
            });
        }
        Ok(())
    }

    /// Process one PDF through the streaming pipeline.
    pub async fn ingest(
        &self,
        pdf_path: &Path,
        filename: &str,
        document_id: &str,
        options: IngestOptions,
    ) -> Result<IngestReport, PipelineError> {
        let IngestOptions {
            job_id,
            cancel,
            progress,
            events,
        } = options;
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let started_at = Utc::now();
        let start = Instant::now();
        tracing::debug!(
            "Processing PDF: {} (document_id: {}, job_id: {})",
            filename,
            document_id,
            job_id
        );

        let ingestion = &self.config.ingestion;
        let ocr_active = self.config.ocr.enabled;
        let capacity = ingestion.queue_capacity();

        let stop = StopFlag::new();
        let failures = FailureSlot::new();
        let admission = Arc::new(Semaphore::new(ingestion.max_in_flight_batches));

        let encoder = Arc::new(ImageEncoder::new(
            self.config.image.format,
            self.config.image.quality,
            self.config.image.thumbnail_width,
        ));

        let image_registry = Arc::new(BatchRegistry::new());
        let ocr_registry = ocr_active.then(|| Arc::new(BatchRegistry::new()));

        // Terminal stages: storage and upsert always; OCR when enabled.
        let num_terminal_stages = if ocr_active { 3 } else { 2 };
        let tracker = Arc::new(CompletionTracker::new(
            num_terminal_stages,
            Arc::clone(&admission),
            progress,
            events.clone(),
        ));

        let (embed_tx, embed_rx) = bounded(capacity);
        let (store_tx, store_rx) = bounded(capacity);
        let (upsert_tx, upsert_rx) = bounded(capacity);

        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        let embedding_stage = EmbeddingStage::new(
            Arc::clone(&self.services.embedder),
            self.config.embedding.mean_pooling,
        );
        workers.push(tokio::spawn(embedding_stage.run(
            embed_rx,
            upsert_tx,
            stop.clone(),
            failures.clone(),
            events.clone(),
        )));

        let storage_stage = StorageStage::new(
            Arc::clone(&self.services.object_store),
            Arc::clone(&encoder),
            Arc::clone(&image_registry),
            self.config.object_store.retries,
        );
        workers.push(tokio::spawn(storage_stage.run(
            store_rx,
            stop.clone(),
            Arc::clone(&tracker),
            events.clone(),
        )));

        let mut rasterizer_queues = vec![embed_tx, store_tx];
        if let Some(ocr_registry) = &ocr_registry {
            let (ocr_tx, ocr_rx) = bounded(capacity);
            rasterizer_queues.push(ocr_tx);
            let ocr_stage = OcrStage::new(
                self.services.ocr.clone(),
                Arc::clone(&encoder),
                Arc::clone(ocr_registry),
                Arc::clone(&self.services.object_store),
                self.config.ocr.store_elements,
            );
            workers.push(tokio::spawn(ocr_stage.run(
                ocr_rx,
                stop.clone(),
                Arc::clone(&tracker),
                failures.clone(),
                events.clone(),
            )));
        }

        let upsert_stage = UpsertStage::new(
            Arc::clone(&self.services.vector_store),
            self.config.vector_store.collection.clone(),
            Arc::clone(&image_registry),
            ocr_registry.clone(),
            ingestion.join_wait(),
            job_id.clone(),
        );
        workers.push(tokio::spawn(upsert_stage.run(
            upsert_rx,
            stop.clone(),
            Arc::clone(&tracker),
            failures.clone(),
            events.clone(),
        )));

        // Rasterize on this task; stage failures set the stop flag, which
        // unblocks any send or acquire the rasterizer is waiting on.
        let rasterizer =
            PdfRasterizer::new(Arc::clone(&self.services.decoder), ingestion.batch_size);
        let rasterized = rasterizer
            .rasterize_streaming(
                pdf_path,
                filename,
                document_id,
                &rasterizer_queues,
                &cancel,
                &stop,
                &admission,
                &events,
            )
            .await;
        // Senders are dropped here; the consumer loops keep draining what
        // was already queued.
        drop(rasterizer_queues);

        let total_pages = match rasterized {
            Ok(total_pages) => total_pages,
            Err(err) => {
                self.teardown(&stop, workers, &image_registry, &ocr_registry)
                    .await;
                // A stage failure recorded first takes precedence over the
                // rasterizer's secondary abort.
                if let Some(stage_err) = failures.take() {
                    return Err(stage_err);
                }
                return Err(err);
            }
        };

        tracing::debug!(
            "Rasterization complete for {}. Waiting for {} pages to finish processing...",
            filename,
            total_pages
        );

        // Drain: every batch completing releases its permit and advances
        // the tracker. Watch for failure and cancellation while waiting.
        loop {
            if failures.is_set() {
                self.teardown(&stop, workers, &image_registry, &ocr_registry)
                    .await;
                return Err(failures.take().unwrap_or(PipelineError::Internal(
                    "stage failure lost during teardown".to_string(),
                )));
            }
            if cancel.is_cancelled() {
                self.teardown(&stop, workers, &image_registry, &ocr_registry)
                    .await;
                return Err(PipelineError::Cancelled);
            }
            if tracker.completed_pages() >= total_pages {
                break;
            }
            // A worker that exits without stop or a recorded failure has
            // panicked; waiting on the tracker would hang forever.
            if workers.iter().any(|w| w.is_finished()) && !stop.is_set() {
                self.teardown(&stop, workers, &image_registry, &ocr_registry)
                    .await;
                return Err(failures.take().unwrap_or_else(|| {
                    PipelineError::Internal("pipeline worker exited unexpectedly".to_string())
                }));
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        self.teardown(&stop, workers, &image_registry, &ocr_registry)
            .await;

        // A failure that raced the final batch completion still fails the
        // document.
        if let Some(err) = failures.take() {
            return Err(err);
        }

        let elapsed = start.elapsed();
        events.emit(PipelineEvent::DocumentCompleted {
            total_pages,
            elapsed,
        });
        tracing::info!(
            "Ingested {} ({} pages in {:.1}s)",
            filename,
            total_pages,
            elapsed.as_secs_f64()
        );

        let batch_size = ingestion.batch_size as u32;
        Ok(IngestReport {
            document_id: document_id.to_string(),
            job_id,
            filename: filename.to_string(),
            total_pages,
            total_batches: total_pages.div_ceil(batch_size),
            started_at,
            elapsed,
        })
    }

    /// Stop the workers, join them with a bounded wait, and clear both
    /// registries.
    async fn teardown(
        &self,
        stop: &StopFlag,
        workers: Vec<JoinHandle<()>>,
        image_registry: &Arc<BatchRegistry<crate::models::ImageRecord>>,
        ocr_registry: &Option<Arc<BatchRegistry<Option<crate::models::OcrPageResult>>>>,
    ) {
        stop.set();
        for mut worker in workers {
            if tokio::time::timeout(WORKER_JOIN_WAIT, &mut worker)
                .await
                .is_err()
            {
                tracing::warn!("Pipeline worker did not stop in time; aborting it");
                worker.abort();
            }
        }
        image_registry.clear();
        if let Some(registry) = ocr_registry {
            registry.clear();
        }
        tracing::debug!("Pipeline stopped");
    }
}
