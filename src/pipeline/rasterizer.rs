//! PDF rasterization stage.
//!
//! Streams a PDF as page batches, throttled by the admission semaphore,
//! and broadcasts each batch to every downstream stage queue. Permits are
//! acquired before decoding so peak memory stays bounded by
//! `max_in_flight_batches * batch_size` decoded pages.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::pdf::PageDecoder;

use super::error::PipelineError;
use super::events::{EventSender, PipelineEvent};
use super::queue::{BatchSender, SendAborted, StopFlag};
use super::types::{PageBatch, PageMetadata};
use super::CancelFlag;

/// How long one semaphore acquire attempt waits before re-checking
/// cancellation.
const SEMAPHORE_POLL: Duration = Duration::from_millis(250);

pub struct PdfRasterizer {
    decoder: Arc<dyn PageDecoder>,
    batch_size: usize,
}

impl PdfRasterizer {
    pub fn new(decoder: Arc<dyn PageDecoder>, batch_size: usize) -> Self {
        Self {
            decoder,
            batch_size: batch_size.max(1),
        }
    }

    /// Rasterize the PDF and broadcast batches to every output queue.
    ///
    /// Returns the document's total page count once the final batch has
    /// been dispatched.
    #[allow(clippy::too_many_arguments)]
    pub async fn rasterize_streaming(
        &self,
        pdf_path: &Path,
        filename: &str,
        document_id: &str,
        output_queues: &[BatchSender<PageBatch>],
        cancel: &CancelFlag,
        stop: &StopFlag,
        admission: &Arc<Semaphore>,
        events: &EventSender,
    ) -> Result<u32, PipelineError> {
        let total_pages = self
            .decoder
            .page_count(pdf_path)
            .await
            .map_err(|e| PipelineError::Decode {
                filename: filename.to_string(),
                source: e.into(),
            })?;

        let file_size_bytes = tokio::fs::metadata(pdf_path)
            .await
            .map_err(|e| PipelineError::Decode {
                filename: filename.to_string(),
                source: e.into(),
            })?
            .len();

        tracing::info!(
            "Starting streaming rasterization: {} ({} pages, {:.1} MB)",
            filename,
            total_pages,
            file_size_bytes as f64 / 1024.0 / 1024.0
        );
        events.emit(PipelineEvent::DocumentStarted {
            filename: filename.to_string(),
            total_pages,
            file_size_bytes,
        });

        let mut batch_id: u32 = 0;
        let mut page: u32 = 1;

        while page <= total_pages {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            // Acquire an admission permit before the expensive decode. The
            // short timeout keeps cancellation observable while blocked.
            loop {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                if stop.is_set() {
                    return Err(PipelineError::Internal("pipeline stopped".to_string()));
                }
                match tokio::time::timeout(SEMAPHORE_POLL, admission.acquire()).await {
                    Ok(Ok(permit)) => {
                        // Ownership of the permit transfers to the batch;
                        // the completion tracker releases it.
                        permit.forget();
                        break;
                    }
                    Ok(Err(_closed)) => {
                        return Err(PipelineError::Internal(
                            "admission semaphore closed".to_string(),
                        ));
                    }
                    Err(_elapsed) => continue,
                }
            }

            let last_page = (page + self.batch_size as u32 - 1).min(total_pages);

            match self
                .dispatch_batch(
                    pdf_path,
                    filename,
                    document_id,
                    batch_id,
                    page,
                    last_page,
                    total_pages,
                    file_size_bytes,
                    output_queues,
                    cancel,
                    stop,
                    events,
                )
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    // The batch never entered the pipeline, so its permit
                    // must be returned here.
                    admission.add_permits(1);
                    return Err(err);
                }
            }

            batch_id += 1;
            page = last_page + 1;
        }

        tracing::info!(
            "Completed rasterization: {} ({} pages in {} batches)",
            filename,
            total_pages,
            batch_id
        );
        Ok(total_pages)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_batch(
        &self,
        pdf_path: &Path,
        filename: &str,
        document_id: &str,
        batch_id: u32,
        page: u32,
        last_page: u32,
        total_pages: u32,
        file_size_bytes: u64,
        output_queues: &[BatchSender<PageBatch>],
        cancel: &CancelFlag,
        stop: &StopFlag,
        events: &EventSender,
    ) -> Result<(), PipelineError> {
        tracing::debug!("Rasterizing pages {}-{} of {}", page, last_page, total_pages);

        let images = self
            .decoder
            .decode_range(pdf_path, page, last_page)
            .await
            .map_err(|e| {
                if cancel.is_cancelled() {
                    PipelineError::Cancelled
                } else {
                    PipelineError::Decode {
                        filename: filename.to_string(),
                        source: e.into(),
                    }
                }
            })?;

        // One fresh ID per page, shared by every stage so the registries
        // can join on it later.
        let image_ids: Vec<String> = images.iter().map(|_| Uuid::new_v4().to_string()).collect();

        let metadata: Vec<PageMetadata> = images
            .iter()
            .enumerate()
            .map(|(offset, img)| PageMetadata {
                document_id: document_id.to_string(),
                page_id: image_ids[offset].clone(),
                filename: filename.to_string(),
                page_number: page + offset as u32,
                total_pages,
                page_width_px: img.width(),
                page_height_px: img.height(),
                file_size_bytes,
            })
            .collect();

        events.emit(PipelineEvent::BatchStarted {
            batch_id,
            page_start: page,
            page_end: last_page,
        });

        // Broadcast with independent image copies: the first queue takes
        // the originals, every other queue gets a deep copy. The image_ids
        // content is identical in every copy.
        let mut original = Some(images);
        for (idx, queue) in output_queues.iter().enumerate() {
            let queue_images = if idx + 1 < output_queues.len() {
                original.as_ref().expect("original images present").clone()
            } else {
                original.take().expect("original images present")
            };

            let batch = PageBatch {
                document_id: document_id.to_string(),
                filename: filename.to_string(),
                batch_id,
                page_start: page,
                images: queue_images,
                image_ids: image_ids.clone(),
                metadata: metadata.clone(),
                total_pages,
                file_size_bytes,
            };

            match queue.send(batch, stop).await {
                Ok(()) => {}
                Err(SendAborted::Stopped) => {
                    return Err(if cancel.is_cancelled() {
                        PipelineError::Cancelled
                    } else {
                        PipelineError::Internal("pipeline stopped".to_string())
                    });
                }
                Err(SendAborted::Closed) => {
                    return Err(PipelineError::Internal(
                        "stage queue closed before shutdown".to_string(),
                    ));
                }
            }
        }

        tracing::debug!(
            "Broadcast batch {} (pages {}-{}) to {} queues",
            batch_id,
            page,
            last_page,
            output_queues.len()
        );
        Ok(())
    }
}
