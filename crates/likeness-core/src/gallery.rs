//! Enrolled identities and the store they are loaded from.

use crate::types::{BiometricSignature, Embedding, PersonId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery store unavailable: {0}")]
    Unavailable(String),
    #[error("gallery I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed gallery record: {0}")]
    Malformed(String),
}

/// One identity and all of its enrollment samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: PersonId,
    pub embeddings: Vec<Embedding>,
    /// Persisted signature, if the store keeps one.
    #[serde(default)]
    pub signature: Option<BiometricSignature>,
}

impl GalleryEntry {
    pub fn new(identity: PersonId, embeddings: Vec<Embedding>) -> Self {
        Self {
            identity,
            embeddings,
            signature: None,
        }
    }
}

/// Read-only snapshot of enrolled identities, in first-enrolled order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group flat `(person, embedding)` records by identity.
    ///
    /// Sentinel embeddings are dropped: they can never be match candidates.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = (PersonId, Embedding)>,
    {
        let mut gallery = Self::new();
        for (identity, embedding) in records {
            gallery.add(identity, embedding);
        }
        gallery
    }

    /// Load every record from `store`, then ask it for each identity's signature.
    pub fn load(store: &dyn GalleryStore) -> Result<Self, GalleryError> {
        let mut gallery = Self::from_records(store.load_all_embeddings()?);
        for entry in gallery.entries.iter_mut() {
            entry.signature = store.load_signature(&entry.identity)?;
        }
        tracing::debug!(
            identities = gallery.len(),
            embeddings = gallery.embedding_count(),
            "gallery loaded"
        );
        Ok(gallery)
    }

    /// Append a sample, creating the identity on first sight.
    pub fn add(&mut self, identity: PersonId, embedding: Embedding) {
        if embedding.is_sentinel() {
            tracing::warn!(person = %identity, "skipping sentinel embedding in gallery");
            return;
        }
        match self.entries.iter_mut().find(|e| e.identity == identity) {
            Some(entry) => entry.embeddings.push(embedding),
            None => self.entries.push(GalleryEntry::new(identity, vec![embedding])),
        }
    }

    pub fn get(&self, identity: &PersonId) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| &e.identity == identity)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.entries.iter().map(|e| e.embeddings.len()).sum()
    }
}

/// Persistence seam for enrolled embeddings.
pub trait GalleryStore {
    fn load_all_embeddings(&self) -> Result<Vec<(PersonId, Embedding)>, GalleryError>;

    /// Stores that don't persist signatures return `Ok(None)`; the matcher
    /// derives one in memory.
    fn load_signature(
        &self,
        identity: &PersonId,
    ) -> Result<Option<BiometricSignature>, GalleryError>;

    fn save_embedding(
        &mut self,
        identity: &PersonId,
        embedding: &Embedding,
    ) -> Result<(), GalleryError>;
}

/// In-process store, for tests and embedding callers that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryGalleryStore {
    records: Vec<(PersonId, Embedding)>,
    signatures: HashMap<PersonId, BiometricSignature>,
}

impl MemoryGalleryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_signature(&mut self, identity: PersonId, signature: BiometricSignature) {
        self.signatures.insert(identity, signature);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl GalleryStore for MemoryGalleryStore {
    fn load_all_embeddings(&self) -> Result<Vec<(PersonId, Embedding)>, GalleryError> {
        Ok(self.records.clone())
    }

    fn load_signature(
        &self,
        identity: &PersonId,
    ) -> Result<Option<BiometricSignature>, GalleryError> {
        Ok(self.signatures.get(identity).cloned())
    }

    fn save_embedding(
        &mut self,
        identity: &PersonId,
        embedding: &Embedding,
    ) -> Result<(), GalleryError> {
        self.records.push((identity.clone(), embedding.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignatureSource;

    fn emb(v: f32) -> Embedding {
        Embedding::normalized(vec![v, 1.0, 0.5])
    }

    #[test]
    fn test_from_records_groups_in_first_seen_order() {
        let gallery = Gallery::from_records(vec![
            ("bob".into(), emb(1.0)),
            ("alice".into(), emb(2.0)),
            ("bob".into(), emb(3.0)),
        ]);
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.embedding_count(), 3);
        assert_eq!(gallery.entries()[0].identity.as_str(), "bob");
        assert_eq!(gallery.entries()[0].embeddings.len(), 2);
        assert_eq!(gallery.entries()[1].identity.as_str(), "alice");
    }

    #[test]
    fn test_sentinel_records_are_dropped() {
        let gallery = Gallery::from_records(vec![
            ("alice".into(), Embedding::sentinel(3)),
            ("bob".into(), emb(1.0)),
        ]);
        assert_eq!(gallery.len(), 1);
        assert!(gallery.get(&"alice".into()).is_none());
    }

    #[test]
    fn test_empty_gallery() {
        let gallery = Gallery::new();
        assert!(gallery.is_empty());
        assert_eq!(gallery.embedding_count(), 0);
    }

    #[test]
    fn test_load_from_memory_store_with_signature() {
        let mut store = MemoryGalleryStore::new();
        let alice = PersonId::from("alice");
        store.save_embedding(&alice, &emb(1.0)).unwrap();
        store.save_embedding(&"carol".into(), &emb(2.0)).unwrap();
        let sig = BiometricSignature::from_values(vec![0.25; 128], SignatureSource::Image).unwrap();
        store.save_signature(alice.clone(), sig.clone());

        let gallery = Gallery::load(&store).unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.get(&alice).unwrap().signature.as_ref(), Some(&sig));
        assert!(gallery.get(&"carol".into()).unwrap().signature.is_none());
    }
}
