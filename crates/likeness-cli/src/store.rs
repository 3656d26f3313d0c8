//! JSON-file gallery: one record per enrolled sample.

use chrono::{DateTime, Utc};
use likeness_core::gallery::{GalleryError, GalleryStore};
use likeness_core::{BiometricSignature, Embedding, PersonId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub id: Uuid,
    pub person: PersonId,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GalleryFile {
    version: u32,
    records: Vec<EnrollmentRecord>,
}

impl Default for GalleryFile {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            records: Vec::new(),
        }
    }
}

pub struct JsonGalleryStore {
    path: PathBuf,
    file: GalleryFile,
}

impl JsonGalleryStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GalleryError> {
        let path = path.into();
        let file = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let file: GalleryFile = serde_json::from_str(&text)
                    .map_err(|e| GalleryError::Malformed(format!("{}: {e}", path.display())))?;
                if file.version != FORMAT_VERSION {
                    return Err(GalleryError::Malformed(format!(
                        "{}: unsupported gallery version {}",
                        path.display(),
                        file.version
                    )));
                }
                file
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GalleryFile::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), records = file.records.len(), "gallery opened");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[EnrollmentRecord] {
        &self.file.records
    }

    /// Remove one sample. Returns false if no record has `id`.
    pub fn remove(&mut self, id: Uuid) -> Result<bool, GalleryError> {
        let before = self.file.records.len();
        self.file.records.retain(|r| r.id != id);
        if self.file.records.len() == before {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Write to a sibling temp file, then rename over the gallery.
    fn persist(&self) -> Result<(), GalleryError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.file)
            .map_err(|e| GalleryError::Malformed(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl GalleryStore for JsonGalleryStore {
    fn load_all_embeddings(&self) -> Result<Vec<(PersonId, Embedding)>, GalleryError> {
        Ok(self
            .file
            .records
            .iter()
            .map(|r| (r.person.clone(), r.embedding.clone()))
            .collect())
    }

    fn load_signature(
        &self,
        _identity: &PersonId,
    ) -> Result<Option<BiometricSignature>, GalleryError> {
        Ok(None)
    }

    fn save_embedding(
        &mut self,
        identity: &PersonId,
        embedding: &Embedding,
    ) -> Result<(), GalleryError> {
        self.file.records.push(EnrollmentRecord {
            id: Uuid::new_v4(),
            person: identity.clone(),
            embedding: embedding.clone(),
            created_at: Utc::now(),
        });
        self.persist()
    }
}
