//! Shared registries for handing per-batch results to the upsert stage.
//!
//! Each registry maps a `BatchKey` to the ordered per-page results one
//! producer stage published for that batch. The upsert stage is the single
//! consumer; `take` removes the entry atomically so nothing lingers after
//! a batch is upserted.

use std::collections::HashMap;
use std::sync::Mutex;

use super::types::BatchKey;

#[derive(Debug)]
pub struct BatchRegistry<T> {
    data: Mutex<HashMap<BatchKey, Vec<T>>>,
}

impl<T> Default for BatchRegistry<T> {
    fn default() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> BatchRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store results for a batch. Each batch is published exactly once per
    /// producer; an overwrite indicates a stage bug and is logged.
    pub fn put(&self, key: BatchKey, values: Vec<T>) {
        let mut data = self.data.lock().expect("registry lock poisoned");
        if data.insert(key.clone(), values).is_some() {
            tracing::error!("Registry entry for {} was published twice", key);
        }
    }

    /// Retrieve and remove results for a batch.
    pub fn take(&self, key: &BatchKey) -> Option<Vec<T>> {
        let mut data = self.data.lock().expect("registry lock poisoned");
        data.remove(key)
    }

    /// Drop every pending entry (pipeline teardown).
    pub fn clear(&self) {
        let mut data = self.data.lock().expect("registry lock poisoned");
        data.clear();
    }

    /// Number of batches currently pending.
    pub fn len(&self) -> usize {
        self.data.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
