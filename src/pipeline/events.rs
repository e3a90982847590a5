//! Structured progress events emitted by the pipeline.
//!
//! The pipeline never renders progress itself; it emits these events and
//! leaves presentation to the caller (the CLI renders them with `console`).

use std::time::Duration;

use tokio::sync::mpsc;

use super::error::StageKind;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    DocumentStarted {
        filename: String,
        total_pages: u32,
        file_size_bytes: u64,
    },
    BatchStarted {
        batch_id: u32,
        page_start: u32,
        page_end: u32,
    },
    StageStarted {
        stage: StageKind,
        batch_id: u32,
    },
    StageCompleted {
        stage: StageKind,
        batch_id: u32,
        pages: usize,
        duration: Duration,
    },
    StageFailed {
        stage: StageKind,
        batch_id: u32,
        error: String,
    },
    BatchCompleted {
        batch_id: u32,
        completed_pages: u32,
    },
    DocumentCompleted {
        total_pages: u32,
        elapsed: Duration,
    },
}

/// Cloneable emitter handed to every stage. Sending never blocks and
/// silently drops events once the receiver is gone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSender {
    /// An emitter that discards everything (tests, headless callers).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Create an event channel; the receiver side belongs to the caller.
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<PipelineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx: Some(tx) }, rx)
}
