//! Per-batch completion accounting.
//!
//! Every terminal stage (storage, OCR when enabled, upsert) reports each
//! batch it finishes. Once all of them have reported a batch, the tracker
//! releases one admission permit and invokes the progress callback. Each
//! batch completes exactly once: the count is incremented inside the
//! critical section and the equality check is only true on the transition.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use super::events::{EventSender, PipelineEvent};
use super::types::BatchKey;

/// Progress callback invoked with the cumulative completed page count.
pub type ProgressFn = dyn Fn(u32) + Send + Sync;

#[derive(Debug, Default)]
struct BatchCounter {
    stages_done: usize,
    pages: usize,
}

struct TrackerState {
    counters: HashMap<BatchKey, BatchCounter>,
    completed_pages: u32,
}

pub struct CompletionTracker {
    num_terminal_stages: usize,
    state: Mutex<TrackerState>,
    semaphore: Arc<Semaphore>,
    progress: Option<Arc<ProgressFn>>,
    events: EventSender,
}

impl CompletionTracker {
    pub fn new(
        num_terminal_stages: usize,
        semaphore: Arc<Semaphore>,
        progress: Option<Arc<ProgressFn>>,
        events: EventSender,
    ) -> Self {
        Self {
            num_terminal_stages,
            state: Mutex::new(TrackerState {
                counters: HashMap::new(),
                completed_pages: 0,
            }),
            semaphore,
            progress,
            events,
        }
    }

    /// Record that one terminal stage finished a batch.
    pub fn mark_stage_complete(&self, document_id: &str, batch_id: u32, pages: usize) {
        let key = BatchKey::new(document_id, batch_id);

        let completed = {
            let mut state = self.state.lock().expect("tracker lock poisoned");
            let counter = state.counters.entry(key.clone()).or_default();
            counter.stages_done += 1;
            if counter.pages == 0 {
                counter.pages = pages;
            }

            if counter.stages_done == self.num_terminal_stages {
                let batch_pages = counter.pages as u32;
                state.counters.remove(&key);
                state.completed_pages += batch_pages;
                Some(state.completed_pages)
            } else {
                None
            }
        };

        if let Some(completed_pages) = completed {
            // Permit release lets the rasterizer admit the next batch.
            self.semaphore.add_permits(1);

            self.events.emit(PipelineEvent::BatchCompleted {
                batch_id,
                completed_pages,
            });

            if let Some(progress) = &self.progress {
                let cb = Arc::clone(progress);
                if catch_unwind(AssertUnwindSafe(|| cb(completed_pages))).is_err() {
                    tracing::warn!("Progress callback panicked for batch {}", batch_id);
                }
            }
        }
    }

    /// Cumulative pages across fully completed batches.
    pub fn completed_pages(&self) -> u32 {
        self.state
            .lock()
            .expect("tracker lock poisoned")
            .completed_pages
    }

    /// Batches with at least one stage reported but not yet complete.
    pub fn pending_batches(&self) -> usize {
        self.state
            .lock()
            .expect("tracker lock poisoned")
            .counters
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::pipeline::events::EventSender;

    fn tracker(num_stages: usize) -> (Arc<CompletionTracker>, Arc<Semaphore>) {
        let semaphore = Arc::new(Semaphore::new(0));
        let tracker = Arc::new(CompletionTracker::new(
            num_stages,
            Arc::clone(&semaphore),
            None,
            EventSender::disabled(),
        ));
        (tracker, semaphore)
    }

    #[test]
    fn test_completes_only_after_all_stages() {
        let (tracker, semaphore) = tracker(3);

        tracker.mark_stage_complete("doc", 0, 4);
        tracker.mark_stage_complete("doc", 0, 4);
        assert_eq!(tracker.completed_pages(), 0);
        assert_eq!(semaphore.available_permits(), 0);

        tracker.mark_stage_complete("doc", 0, 4);
        assert_eq!(tracker.completed_pages(), 4);
        assert_eq!(semaphore.available_permits(), 1);
        assert_eq!(tracker.pending_batches(), 0);
    }

    #[test]
    fn test_exactly_one_release_per_batch() {
        let (tracker, semaphore) = tracker(2);

        for batch_id in 0..3 {
            tracker.mark_stage_complete("doc", batch_id, 2);
            tracker.mark_stage_complete("doc", batch_id, 2);
        }

        assert_eq!(semaphore.available_permits(), 3);
        assert_eq!(tracker.completed_pages(), 6);
    }

    #[test]
    fn test_progress_callback_monotonic() {
        let semaphore = Arc::new(Semaphore::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let tracker = CompletionTracker::new(
            2,
            semaphore,
            Some(Arc::new(move |pages| {
                seen_cb.lock().unwrap().push(pages);
            })),
            EventSender::disabled(),
        );

        tracker.mark_stage_complete("doc", 0, 2);
        tracker.mark_stage_complete("doc", 0, 2);
        tracker.mark_stage_complete("doc", 1, 3);
        tracker.mark_stage_complete("doc", 1, 3);

        let values = seen.lock().unwrap().clone();
        assert_eq!(values, vec![2, 5]);
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let semaphore = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_cb = Arc::clone(&calls);
        let tracker = CompletionTracker::new(
            1,
            Arc::clone(&semaphore),
            Some(Arc::new(move |_| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
                panic!("callback blew up");
            })),
            EventSender::disabled(),
        );

        tracker.mark_stage_complete("doc", 0, 1);
        tracker.mark_stage_complete("doc", 1, 1);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(semaphore.available_permits(), 2);
        assert_eq!(tracker.completed_pages(), 2);
    }

    #[test]
    fn test_out_of_order_batches() {
        let (tracker, _semaphore) = tracker(2);

        // Batch 1 completes before batch 0.
        tracker.mark_stage_complete("doc", 1, 2);
        tracker.mark_stage_complete("doc", 1, 2);
        assert_eq!(tracker.completed_pages(), 2);

        tracker.mark_stage_complete("doc", 0, 2);
        tracker.mark_stage_complete("doc", 0, 2);
        assert_eq!(tracker.completed_pages(), 4);
    }
}
