//! Image storage stage.
//!
//! Encodes each page image once (full image plus optional thumbnail),
//! uploads the batch to the object store with per-page retries, and
//! publishes the ordered `ImageRecord` list into the image registry for
//! the upsert stage.
//!
//! Upload failures do not stop the pipeline: the batch is logged, the
//! registry entry is skipped, and upsert falls back to records without an
//! image URL. Completion is still reported so the batch's admission
//! permit is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::try_join_all;
use rand::Rng;

use crate::imaging::{EncodedImage, ImageEncoder};
use crate::models::{ImageRecord, ImageStorage};
use crate::services::object_store::{page_object_key, ObjectStore};

use super::error::StageKind;
use super::events::{EventSender, PipelineEvent};
use super::queue::{BatchReceiver, StopFlag};
use super::registry::BatchRegistry;
use super::tracker::CompletionTracker;
use super::types::{PageBatch, PageMetadata};
use super::STAGE_POLL;

pub struct StorageStage {
    store: Arc<dyn ObjectStore>,
    encoder: Arc<ImageEncoder>,
    registry: Arc<BatchRegistry<ImageRecord>>,
    /// Extra attempts per object after the first.
    retries: u32,
}

impl StorageStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        encoder: Arc<ImageEncoder>,
        registry: Arc<BatchRegistry<ImageRecord>>,
        retries: u32,
    ) -> Self {
        Self {
            store,
            encoder,
            registry,
            retries,
        }
    }

    /// Encode and upload one batch, publishing its records on success.
    pub async fn process_batch(&self, batch: PageBatch) -> anyhow::Result<Vec<ImageRecord>> {
        let key = batch.key();
        let PageBatch {
            images,
            image_ids,
            metadata,
            ..
        } = batch;

        // Encoding is CPU work; keep it off the async workers.
        let encoder = Arc::clone(&self.encoder);
        let encoded: Vec<(EncodedImage, Option<EncodedImage>)> =
            tokio::task::spawn_blocking(move || {
                images
                    .iter()
                    .map(|img| encoder.encode_with_thumbnail(img))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await
            .context("Encoding task join failed")??;

        // Upload every page of the batch concurrently; the batch size is
        // the parallelism knob for the whole pipeline.
        let uploads = encoded
            .into_iter()
            .zip(image_ids.iter())
            .zip(metadata.iter())
            .map(|(((full, thumbnail), image_id), meta)| {
                self.upload_page(full, thumbnail, image_id.clone(), meta)
            });
        let records = try_join_all(uploads).await?;

        self.registry.put(key, records.clone());
        Ok(records)
    }

    async fn upload_page(
        &self,
        full: EncodedImage,
        thumbnail: Option<EncodedImage>,
        image_id: String,
        meta: &PageMetadata,
    ) -> anyhow::Result<ImageRecord> {
        let ext = full.format.extension();
        let page_key = page_object_key(&meta.document_id, meta.page_number, "page", ext);
        let content_type = full.content_type.clone();
        let byte_size = full.byte_size;
        let width = full.width;
        let height = full.height;

        let image_url = self
            .put_with_retry(&page_key, full.data, &content_type)
            .await
            .with_context(|| format!("Upload failed for page {}", meta.page_number))?;

        let thumbnail_url = match thumbnail {
            Some(thumb) => {
                let thumb_key = page_object_key(&meta.document_id, meta.page_number, "thumb", ext);
                let url = self
                    .put_with_retry(&thumb_key, thumb.data, &thumb.content_type)
                    .await
                    .with_context(|| {
                        format!("Thumbnail upload failed for page {}", meta.page_number)
                    })?;
                Some(url)
            }
            None => None,
        };

        Ok(ImageRecord {
            page_id: image_id,
            image_url: Some(image_url),
            storage: ImageStorage::ObjectStore,
            content_type,
            byte_size,
            width,
            height,
            thumbnail_url,
        })
    }

    /// Upload one object, retrying with exponential backoff plus jitter.
    async fn put_with_retry(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> anyhow::Result<String> {
        let mut attempt = 0;
        loop {
            match self.store.put(key, bytes.clone(), content_type).await {
                Ok(url) => return Ok(url),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(200 * (1 << attempt.min(6)))
                        + Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    tracing::warn!(
                        "Upload of {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                        key,
                        attempt,
                        self.retries + 1,
                        backoff,
                        err
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Consumer loop: take batches, store images, report completion.
    pub async fn run(
        self,
        mut input: BatchReceiver<PageBatch>,
        stop: StopFlag,
        tracker: Arc<CompletionTracker>,
        events: EventSender,
    ) {
        tracing::debug!("Storage stage started");

        while !stop.is_set() {
            let Some(batch) = input.recv_timeout(STAGE_POLL).await else {
                continue;
            };

            let document_id = batch.document_id.clone();
            let batch_id = batch.batch_id;
            let pages = batch.num_pages();
            let started = Instant::now();
            events.emit(PipelineEvent::StageStarted {
                stage: StageKind::Storage,
                batch_id,
            });

            match self.process_batch(batch).await {
                Ok(_) => {
                    events.emit(PipelineEvent::StageCompleted {
                        stage: StageKind::Storage,
                        batch_id,
                        pages,
                        duration: started.elapsed(),
                    });
                    tracing::debug!("Stored batch {}", batch_id);
                }
                Err(err) => {
                    // Storage failures don't kill the pipeline; the upsert
                    // stage emits fallback records once its join wait for
                    // this batch expires.
                    tracing::error!("Storage failed for batch {}: {:#}", batch_id, err);
                    events.emit(PipelineEvent::StageFailed {
                        stage: StageKind::Storage,
                        batch_id,
                        error: format!("{:#}", err),
                    });
                }
            }

            tracker.mark_stage_complete(&document_id, batch_id, pages);
        }

        tracing::debug!("Storage stage stopped");
    }
}
