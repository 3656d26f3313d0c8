//! Per-frame feature cache keyed by [`FrameKey`].
//!
//! Best effort only: when full the whole map is dropped, and a miss simply
//! recomputes. Nothing depends on a hit for correctness.

use crate::types::{BiometricSignature, Embedding, FrameKey};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Everything extracted from one frame.
#[derive(Debug, Clone)]
pub struct CachedFeatures {
    pub embedding: Embedding,
    pub quality: f32,
    pub signature: Option<BiometricSignature>,
    pub spoof_suspected: bool,
}

pub struct FeatureCache {
    capacity: usize,
    entries: Mutex<HashMap<FrameKey, CachedFeatures>>,
}

impl FeatureCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &FrameKey) -> Option<CachedFeatures> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: FrameKey, features: CachedFeatures) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            tracing::debug!(capacity = self.capacity, "feature cache full, flushing");
            entries.clear();
        }
        entries.insert(key, features);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
