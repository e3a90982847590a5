//! OCR stage.
//!
//! Runs OCR for every page of a batch in a bounded fan-out (the batch
//! size doubles as OCR parallelism), converts service responses into
//! per-page results in page order, and publishes them into the ocr
//! registry. Any page's OCR error is fatal for the document; there are no
//! silent fallbacks.
//!
//! When no OCR client is configured, the stage publishes placeholder
//! entries so the upsert stage does not wait out its join cap, and still
//! reports completion.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use base64::Engine;
use futures::future::try_join_all;

use crate::imaging::{EncodedImage, ImageEncoder};
use crate::models::{OcrPageResult, OcrRegion};
use crate::services::object_store::{elements_object_key, page_object_key, ObjectStore};
use crate::services::ocr::{OcrClient, OcrResponse};

use super::error::{FailureSlot, PipelineError, StageKind};
use super::events::{EventSender, PipelineEvent};
use super::queue::{BatchReceiver, StopFlag};
use super::registry::BatchRegistry;
use super::tracker::CompletionTracker;
use super::types::{PageBatch, PageMetadata};
use super::STAGE_POLL;

pub struct OcrStage {
    client: Option<Arc<dyn OcrClient>>,
    encoder: Arc<ImageEncoder>,
    registry: Arc<BatchRegistry<Option<OcrPageResult>>>,
    /// Object store for element/figure persistence; unused unless
    /// `store_elements` is on.
    store: Arc<dyn ObjectStore>,
    store_elements: bool,
}

impl OcrStage {
    pub fn new(
        client: Option<Arc<dyn OcrClient>>,
        encoder: Arc<ImageEncoder>,
        registry: Arc<BatchRegistry<Option<OcrPageResult>>>,
        store: Arc<dyn ObjectStore>,
        store_elements: bool,
    ) -> Self {
        Self {
            client,
            encoder,
            registry,
            store,
            store_elements,
        }
    }

    /// Run OCR for one batch and publish its results.
    pub async fn process_batch(&self, batch: PageBatch) -> anyhow::Result<()> {
        let key = batch.key();

        let Some(client) = &self.client else {
            // No OCR backend: publish placeholders so upsert joins cleanly.
            tracing::debug!("OCR skipped for batch {} (no OCR client)", batch.batch_id);
            self.registry.put(key, vec![None; batch.num_pages()]);
            return Ok(());
        };

        let PageBatch {
            images, metadata, ..
        } = batch;

        // Independent encoding pass; the storage stage reaches the encoder
        // on its own so the two stages never share buffers.
        let encoder = Arc::clone(&self.encoder);
        let encoded: Vec<EncodedImage> =
            tokio::task::spawn_blocking(move || encoder.encode_batch(&images))
                .await
                .context("Encoding task join failed")??;

        // One request per page, all pages of the batch concurrently.
        let requests = encoded
            .iter()
            .zip(metadata.iter())
            .map(|(image, meta)| self.ocr_page(Arc::clone(client), image, meta));
        let results = try_join_all(requests).await?;

        self.registry.put(key, results.into_iter().map(Some).collect());
        Ok(())
    }

    async fn ocr_page(
        &self,
        client: Arc<dyn OcrClient>,
        image: &EncodedImage,
        meta: &PageMetadata,
    ) -> anyhow::Result<OcrPageResult> {
        let filename = format!(
            "{}/page_{}.{}",
            meta.filename,
            meta.page_number,
            image.format.extension()
        );
        let response = client
            .ocr_page(image, &filename)
            .await
            .with_context(|| format!("OCR failed for page {}", meta.page_number))?;

        let result = build_page_result(&meta.page_id, &response);

        if self.store_elements {
            self.persist_elements(meta, &result, &response.crops)
                .await
                .with_context(|| {
                    format!("Failed to persist OCR elements for page {}", meta.page_number)
                })?;
        }

        Ok(result)
    }

    /// Upload the region list and any extracted figure crops alongside the
    /// page image.
    async fn persist_elements(
        &self,
        meta: &PageMetadata,
        result: &OcrPageResult,
        crops: &[String],
    ) -> anyhow::Result<()> {
        let elements = serde_json::to_vec(result).context("Failed to serialize OCR elements")?;
        let key = elements_object_key(&meta.document_id, meta.page_number);
        self.store.put(&key, elements, "application/json").await?;

        for (idx, crop) in crops.iter().enumerate() {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(crop)
                .with_context(|| format!("Invalid base64 figure crop {}", idx + 1))?;
            let key = page_object_key(
                &meta.document_id,
                meta.page_number,
                &format!("figure_{}", idx + 1),
                "png",
            );
            self.store.put(&key, bytes, "image/png").await?;
        }
        Ok(())
    }

    /// Consumer loop: take batches, OCR them, report completion.
    ///
    /// OCR failures are critical: the pipeline stops.
    pub async fn run(
        self,
        mut input: BatchReceiver<PageBatch>,
        stop: StopFlag,
        tracker: Arc<CompletionTracker>,
        failures: FailureSlot,
        events: EventSender,
    ) {
        tracing::debug!("OCR stage started");

        while !stop.is_set() {
            let Some(batch) = input.recv_timeout(STAGE_POLL).await else {
                continue;
            };

            let document_id = batch.document_id.clone();
            let batch_id = batch.batch_id;
            let page_start = batch.page_start;
            let page_end = batch.page_end();
            let pages = batch.num_pages();
            let started = Instant::now();
            events.emit(PipelineEvent::StageStarted {
                stage: StageKind::Ocr,
                batch_id,
            });

            match self.process_batch(batch).await {
                Ok(()) => {
                    events.emit(PipelineEvent::StageCompleted {
                        stage: StageKind::Ocr,
                        batch_id,
                        pages,
                        duration: started.elapsed(),
                    });
                    tracker.mark_stage_complete(&document_id, batch_id, pages);
                    tracing::debug!("Processed OCR for batch {}", batch_id);
                }
                Err(err) => {
                    tracing::error!("OCR failed for batch {}: {:#}", batch_id, err);
                    events.emit(PipelineEvent::StageFailed {
                        stage: StageKind::Ocr,
                        batch_id,
                        error: format!("{:#}", err),
                    });
                    failures.record(PipelineError::Stage {
                        stage: StageKind::Ocr,
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

        tracing::debug!("OCR stage stopped");
    }
}

/// Convert a raw OCR response into the stored per-page result.
///
/// Markdown and raw text fall back to the plain text when the service
/// omits them. Region ids are `{page_id}#region-{n}` with 1-based n.
fn build_page_result(page_id: &str, response: &OcrResponse) -> OcrPageResult {
    let text = response.text.trim().to_string();
    let markdown = match response.markdown.trim() {
        "" => text.clone(),
        m => m.to_string(),
    };
    let raw_text = match response.raw.trim() {
        "" => text.clone(),
        r => r.to_string(),
    };

    let regions = response
        .bounding_boxes
        .iter()
        .enumerate()
        .map(|(idx, bbox)| OcrRegion {
            id: format!("{}#region-{}", page_id, idx + 1),
            label: bbox.label.clone().unwrap_or_else(|| "unknown".to_string()),
            bbox: [bbox.x1, bbox.y1, bbox.x2, bbox.y2],
        })
        .collect();

    OcrPageResult {
        text,
        markdown,
        raw_text,
        regions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ocr::OcrBoundingBox;

    #[test]
    fn test_build_page_result_fallbacks() {
        let response = OcrResponse {
            text: "  hello  ".to_string(),
            markdown: String::new(),
            raw: String::new(),
            bounding_boxes: vec![],
            crops: vec![],
        };
        let result = build_page_result("pid", &response);
        assert_eq!(result.text, "hello");
        assert_eq!(result.markdown, "hello");
        assert_eq!(result.raw_text, "hello");
        assert!(result.regions.is_empty());
    }

    #[test]
    fn test_build_page_result_regions() {
        let response = OcrResponse {
            text: "t".to_string(),
            markdown: "# t".to_string(),
            raw: "raw".to_string(),
            bounding_boxes: vec![
                OcrBoundingBox {
                    x1: 0,
                    y1: 0,
                    x2: 100,
                    y2: 20,
                    label: Some("text".to_string()),
                },
                OcrBoundingBox {
                    x1: 5,
                    y1: 30,
                    x2: 90,
                    y2: 80,
                    label: None,
                },
            ],
            crops: vec![],
        };
        let result = build_page_result("pid", &response);
        assert_eq!(result.regions.len(), 2);
        assert_eq!(result.regions[0].id, "pid#region-1");
        assert_eq!(result.regions[0].label, "text");
        assert_eq!(result.regions[0].bbox, [0, 0, 100, 20]);
        assert_eq!(result.regions[1].id, "pid#region-2");
        assert_eq!(result.regions[1].label, "unknown");
    }
}
