//! Embedding stage.
//!
//! Consumes rasterized page batches, requests multi-vector embeddings
//! from the embedding service, optionally computes mean-pooled prefetch
//! variants, and forwards embedded batches to the upsert queue.
//!
//! Embedding failures are fatal for the document. This stage is not
//! terminal: it only forwards work, so it never reports to the
//! completion tracker.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;

use crate::services::embedder::{pool_image_tokens, EmbeddingClient, ImageDims};

use super::error::{FailureSlot, PipelineError, StageKind};
use super::events::{EventSender, PipelineEvent};
use super::queue::{BatchReceiver, BatchSender, StopFlag};
use super::types::{EmbeddedBatch, PageBatch};
use super::STAGE_POLL;

pub struct EmbeddingStage {
    client: Arc<dyn EmbeddingClient>,
    mean_pooling: bool,
}

impl EmbeddingStage {
    pub fn new(client: Arc<dyn EmbeddingClient>, mean_pooling: bool) -> Self {
        Self {
            client,
            mean_pooling,
        }
    }

    /// Generate embeddings for one batch.
    pub async fn process_batch(&self, batch: PageBatch) -> anyhow::Result<EmbeddedBatch> {
        let items = self
            .client
            .embed_images(&batch.images)
            .await
            .context("Embedding request failed")?;

        let (original, pooled_by_rows, pooled_by_columns) = if self.mean_pooling {
            let dims: Vec<ImageDims> = batch
                .images
                .iter()
                .map(|img| ImageDims {
                    width: img.width(),
                    height: img.height(),
                })
                .collect();
            let grids = self
                .client
                .patch_grids(&dims)
                .await
                .context("Patch grid request failed")?;

            let mut original = Vec::with_capacity(items.len());
            let mut rows_batch = Vec::with_capacity(items.len());
            let mut cols_batch = Vec::with_capacity(items.len());
            for (item, grid) in items.into_iter().zip(grids) {
                let (rows, cols) = pool_image_tokens(
                    &item.embedding,
                    item.image_patch_start,
                    item.image_patch_len,
                    grid.n_patches_x,
                    grid.n_patches_y,
                )
                .context("Mean pooling failed")?;
                original.push(item.embedding);
                rows_batch.push(rows);
                cols_batch.push(cols);
            }
            (original, Some(rows_batch), Some(cols_batch))
        } else {
            let original = items.into_iter().map(|item| item.embedding).collect();
            (original, None, None)
        };

        Ok(EmbeddedBatch {
            document_id: batch.document_id,
            filename: batch.filename,
            batch_id: batch.batch_id,
            page_start: batch.page_start,
            original_embeddings: original,
            pooled_by_rows,
            pooled_by_columns,
            image_ids: batch.image_ids,
            metadata: batch.metadata,
        })
    }

    /// Consumer loop: take from the input queue, embed, push downstream.
    pub async fn run(
        self,
        mut input: BatchReceiver<PageBatch>,
        output: BatchSender<EmbeddedBatch>,
        stop: StopFlag,
        failures: FailureSlot,
        events: EventSender,
    ) {
        tracing::debug!("Embedding stage started");

        while !stop.is_set() {
            let Some(batch) = input.recv_timeout(STAGE_POLL).await else {
                continue;
            };

            let batch_id = batch.batch_id;
            let page_start = batch.page_start;
            let page_end = batch.page_end();
            let pages = batch.num_pages();
            let started = Instant::now();
            events.emit(PipelineEvent::StageStarted {
                stage: StageKind::Embedding,
                batch_id,
            });

            match self.process_batch(batch).await {
                Ok(embedded) => {
                    events.emit(PipelineEvent::StageCompleted {
                        stage: StageKind::Embedding,
                        batch_id,
                        pages,
                        duration: started.elapsed(),
                    });
                    if output.send(embedded, &stop).await.is_err() {
                        break;
                    }
                    tracing::debug!("Embedded batch {} pushed to upsert queue", batch_id);
                }
                Err(err) => {
                    tracing::error!("Embedding failed for batch {}: {:#}", batch_id, err);
                    events.emit(PipelineEvent::StageFailed {
                        stage: StageKind::Embedding,
                        batch_id,
                        error: format!("{:#}", err),
                    });
                    failures.record(PipelineError::Stage {
                        stage: StageKind::Embedding,
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

        tracing::debug!("Embedding stage stopped");
    }
}
