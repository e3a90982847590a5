//! Upsert stage.
//!
//! Joins each embedded batch with the storage and OCR results published
//! under the same `(document_id, batch_id)` key, assembles one point per
//! page, and commits the batch to the vector store.
//!
//! The joins poll the registries with a short interval under a hard cap.
//! A missing image entry degrades to records without an image URL; a
//! missing OCR entry degrades to records without OCR fields. Both paths
//! are logged at WARN since they indicate an upstream problem.
//! Vector-store failures are fatal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use serde_json::json;

use crate::models::{ImageRecord, OcrPageResult};
use crate::services::vector_store::{PointRecord, PointVectors, VectorStore};

use super::error::{FailureSlot, PipelineError, StageKind};
use super::events::{EventSender, PipelineEvent};
use super::queue::{BatchReceiver, StopFlag};
use super::registry::BatchRegistry;
use super::tracker::CompletionTracker;
use super::types::{BatchKey, EmbeddedBatch, PageMetadata};
use super::STAGE_POLL;

/// How often a registry join re-polls for its key.
const REGISTRY_POLL: Duration = Duration::from_millis(100);

enum JoinOutcome<T> {
    Ready(Vec<T>),
    TimedOut,
    Stopped,
}

pub struct UpsertStage {
    vectors: Arc<dyn VectorStore>,
    collection: String,
    image_registry: Arc<BatchRegistry<ImageRecord>>,
    /// Absent when OCR is disabled; upsert then skips the OCR join entirely.
    ocr_registry: Option<Arc<BatchRegistry<Option<OcrPageResult>>>>,
    join_wait: Duration,
    job_id: String,
}

impl UpsertStage {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        collection: String,
        image_registry: Arc<BatchRegistry<ImageRecord>>,
        ocr_registry: Option<Arc<BatchRegistry<Option<OcrPageResult>>>>,
        join_wait: Duration,
        job_id: String,
    ) -> Self {
        Self {
            vectors,
            collection,
            image_registry,
            ocr_registry,
            join_wait,
            job_id,
        }
    }

    async fn wait_for<T>(
        &self,
        registry: &BatchRegistry<T>,
        key: &BatchKey,
        stop: &StopFlag,
    ) -> JoinOutcome<T> {
        let started = Instant::now();
        loop {
            if let Some(values) = registry.take(key) {
                return JoinOutcome::Ready(values);
            }
            if stop.is_set() {
                return JoinOutcome::Stopped;
            }
            if started.elapsed() >= self.join_wait {
                return JoinOutcome::TimedOut;
            }
            tokio::time::sleep(REGISTRY_POLL).await;
        }
    }

    /// Assemble and commit one batch. Returns `None` when the pipeline
    /// stopped mid-join and the batch was abandoned.
    pub async fn process_batch(
        &self,
        batch: EmbeddedBatch,
        stop: &StopFlag,
    ) -> anyhow::Result<Option<usize>> {
        let key = batch.key();

        let image_records = match self.wait_for(&self.image_registry, &key, stop).await {
            JoinOutcome::Ready(records) => records,
            JoinOutcome::TimedOut => {
                tracing::warn!(
                    "Timeout waiting for image records of batch {}; \
                     emitting records without stored images",
                    key
                );
                batch
                    .image_ids
                    .iter()
                    .map(|id| ImageRecord::missing(id.clone()))
                    .collect()
            }
            JoinOutcome::Stopped => return Ok(None),
        };

        let ocr_results: Vec<Option<OcrPageResult>> = match &self.ocr_registry {
            Some(registry) => match self.wait_for(registry, &key, stop).await {
                JoinOutcome::Ready(results) => results,
                JoinOutcome::TimedOut => {
                    tracing::warn!(
                        "Timeout waiting for OCR results of batch {}; \
                         emitting records without OCR fields",
                        key
                    );
                    vec![None; batch.num_pages()]
                }
                JoinOutcome::Stopped => return Ok(None),
            },
            None => vec![None; batch.num_pages()],
        };

        let points = build_points(&batch, &image_records, &ocr_results, &self.job_id);
        let num_points = points.len();

        tracing::debug!("Upserting {} points for batch {}", num_points, key);
        self.vectors
            .upsert(&self.collection, points)
            .await
            .context("Vector store upsert failed")?;

        Ok(Some(num_points))
    }

    /// Consumer loop: wait for embedded batches and commit them.
    pub async fn run(
        self,
        mut input: BatchReceiver<EmbeddedBatch>,
        stop: StopFlag,
        tracker: Arc<CompletionTracker>,
        failures: FailureSlot,
        events: EventSender,
    ) {
        tracing::debug!("Upsert stage started");

        while !stop.is_set() {
            let Some(batch) = input.recv_timeout(STAGE_POLL).await else {
                continue;
            };

            let document_id = batch.document_id.clone();
            let batch_id = batch.batch_id;
            let page_start = batch.page_start;
            let page_end = batch.page_end();
            let started = Instant::now();
            events.emit(PipelineEvent::StageStarted {
                stage: StageKind::Upsert,
                batch_id,
            });

            match self.process_batch(batch, &stop).await {
                Ok(Some(pages)) => {
                    events.emit(PipelineEvent::StageCompleted {
                        stage: StageKind::Upsert,
                        batch_id,
                        pages,
                        duration: started.elapsed(),
                    });
                    tracker.mark_stage_complete(&document_id, batch_id, pages);
                    tracing::debug!("Upserted batch {}", batch_id);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!("Upsert failed for batch {}: {:#}", batch_id, err);
                    events.emit(PipelineEvent::StageFailed {
                        stage: StageKind::Upsert,
                        batch_id,
                        error: format!("{:#}", err),
                    });
                    failures.record(PipelineError::Stage {
                        stage: StageKind::Upsert,
                        batch_id,
                        page_start,
                        page_end,
                        source: err,
                    });
                    stop.set();
                    break;
                }
            }
        }

        tracing::debug!("Upsert stage stopped");
    }
}

/// Build one point per page, in the batch's page order.
fn build_points(
    batch: &EmbeddedBatch,
    image_records: &[ImageRecord],
    ocr_results: &[Option<OcrPageResult>],
    job_id: &str,
) -> Vec<PointRecord> {
    let indexed_at = Utc::now().to_rfc3339();

    batch
        .original_embeddings
        .iter()
        .enumerate()
        .map(|(offset, original)| {
            let image_id = &batch.image_ids[offset];
            let meta = &batch.metadata[offset];
            let image_record = image_records.get(offset);
            let ocr = ocr_results.get(offset).and_then(|o| o.as_ref());

            let vectors = PointVectors {
                original: original.clone(),
                mean_pooling_rows: batch
                    .pooled_by_rows
                    .as_ref()
                    .map(|rows| rows[offset].clone()),
                mean_pooling_columns: batch
                    .pooled_by_columns
                    .as_ref()
                    .map(|cols| cols[offset].clone()),
            };

            PointRecord {
                id: image_id.clone(),
                vectors,
                payload: build_payload(meta, image_record, ocr, job_id, &indexed_at),
            }
        })
        .collect()
}

fn build_payload(
    meta: &PageMetadata,
    image_record: Option<&ImageRecord>,
    ocr: Option<&OcrPageResult>,
    job_id: &str,
    indexed_at: &str,
) -> serde_json::Value {
    let mut payload = json!({
        "document_id": meta.document_id,
        "filename": meta.filename,
        "page_number": meta.page_number,
        "total_pages": meta.total_pages,
        "file_size_bytes": meta.file_size_bytes,
        "page_width_px": meta.page_width_px,
        "page_height_px": meta.page_height_px,
        "indexed_at": indexed_at,
        "job_id": job_id,
    });

    if let Some(record) = image_record {
        payload["image_url"] = json!(record.image_url);
        payload["image_storage"] = json!(record.storage.as_str());
        if record.image_url.is_some() {
            payload["image_content_type"] = json!(record.content_type);
            payload["image_size_bytes"] = json!(record.byte_size);
        }
        if let Some(thumb) = &record.thumbnail_url {
            payload["thumbnail_url"] = json!(thumb);
        }
    }

    if let Some(ocr) = ocr {
        payload["ocr"] = json!({
            "text": ocr.text,
            "markdown": ocr.markdown,
            "regions": ocr.regions,
        });
    }

    payload
}
