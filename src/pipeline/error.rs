//! Pipeline error types.

use thiserror::Error;

/// Stage identity used in error context and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Embedding,
    Storage,
    Ocr,
    Upsert,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Storage => "storage",
            Self::Ocr => "ocr",
            Self::Upsert => "upsert",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The job was cancelled cooperatively. Not a failure.
    #[error("Ingestion cancelled")]
    Cancelled,

    #[error("Failed to decode {filename}: {source}")]
    Decode {
        filename: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} stage failed for batch {batch_id} (pages {page_start}-{page_end}): {source}")]
    Stage {
        stage: StageKind,
        batch_id: u32,
        page_start: u32,
        page_end: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Embedding dimension {model_dim} does not match collection dimension {collection_dim}")]
    DimensionMismatch {
        model_dim: usize,
        collection_dim: usize,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether this error represents cooperative cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// First-error slot shared by the stage workers.
///
/// Errors never travel between stages directly; a failing stage records
/// its error here, sets the stop flag, and exits. The coordinator observes
/// the slot and re-raises the recorded error to the caller.
#[derive(Clone, Default)]
pub struct FailureSlot(std::sync::Arc<std::sync::Mutex<Option<PipelineError>>>);

impl FailureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error; only the first recorded error is kept.
    pub fn record(&self, err: PipelineError) {
        let mut slot = self.0.lock().expect("failure slot poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().expect("failure slot poisoned").is_some()
    }

    pub fn take(&self) -> Option<PipelineError> {
        self.0.lock().expect("failure slot poisoned").take()
    }
}
