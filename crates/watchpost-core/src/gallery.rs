//! Reference embeddings per enrolled identity.
//!
//! A [`Gallery`] is immutable once built. [`GalleryStore`] holds the current
//! one behind an `Arc` and replaces it wholesale on refresh, so a reader that
//! took a [`GalleryStore::snapshot`] keeps a consistent view for as long as
//! it holds it, even while a rebuild runs on another thread.

use crate::provider::{DetectionProvider, ProviderError};
use crate::types::{DetectedFace, Embedding, Identity, EMBEDDING_DIM};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

const ENROLL_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const CACHE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("detection provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery cache: {0}")]
    Json(#[from] serde_json::Error),
    #[error("gallery cache rejected: {0}")]
    InvalidCache(String),
}

/// Identity id -> reference embeddings, iterated in ascending id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: BTreeMap<String, Vec<Embedding>>,
}

impl Gallery {
    pub fn from_entries(entries: BTreeMap<String, Vec<Embedding>>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.entries.iter().map(|(id, e)| (id.as_str(), e.as_slice()))
    }

    /// Reference embeddings for `id`; `None` only if the id was never enrolled.
    pub fn get(&self, id: &str) -> Option<&[Embedding]> {
        self.entries.get(id).map(Vec::as_slice)
    }

    pub fn identity_count(&self) -> usize {
        self.entries.len()
    }

    pub fn embedding_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Image files directly under `dir`, sorted. A missing directory has none.
pub fn enrollment_images(dir: &Path) -> Vec<PathBuf> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = read
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| ENROLL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    paths
}

/// Embed every enrollment image, keeping the most confident face of each.
///
/// Images that cannot be decoded or embedded are skipped, as are images with
/// no usable face. If none survive the result is empty, which is a valid
/// gallery. A provider that cannot run at all is an error.
pub fn build_identity<P: DetectionProvider + ?Sized>(
    provider: &P,
    images: &[PathBuf],
    min_face_size: u32,
) -> Result<Vec<Embedding>, GalleryError> {
    let mut embeddings = Vec::with_capacity(images.len());

    for path in images {
        let frame = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "enrollment image unreadable; skipped");
                continue;
            }
        };

        let faces = match provider.detect_and_embed(&frame, min_face_size) {
            Ok(faces) => faces,
            Err(e) if e.is_per_frame() => {
                tracing::warn!(path = %path.display(), error = %e, "enrollment image failed detection; skipped");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let best = faces.into_iter().fold(None, |best: Option<DetectedFace>, f| {
            match best {
                Some(b) if b.confidence >= f.confidence => Some(b),
                _ => Some(f),
            }
        });

        match best {
            Some(face) => {
                let mut embedding = face.embedding;
                embedding.renormalize();
                embeddings.push(embedding);
            }
            None => {
                tracing::debug!(path = %path.display(), "no face in enrollment image; skipped");
            }
        }
    }

    Ok(embeddings)
}

/// Holder of the live gallery snapshot.
pub struct GalleryStore {
    current: RwLock<Arc<Gallery>>,
    enroll_root: PathBuf,
    min_face_size: u32,
}

impl GalleryStore {
    pub fn new(enroll_root: impl Into<PathBuf>, min_face_size: u32) -> Self {
        Self {
            current: RwLock::new(Arc::new(Gallery::default())),
            enroll_root: enroll_root.into(),
            min_face_size,
        }
    }

    /// The gallery as of now. Holding it pins that version.
    pub fn snapshot(&self) -> Arc<Gallery> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the live gallery in one swap.
    pub fn publish(&self, gallery: Gallery) -> Arc<Gallery> {
        let next = Arc::new(gallery);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        next
    }

    pub fn enroll_dir(&self, identity_id: &str) -> PathBuf {
        self.enroll_root.join(identity_id)
    }

    /// Compute one identity's reference embeddings from its enrollment directory.
    pub fn build<P: DetectionProvider + ?Sized>(
        &self,
        provider: &P,
        identity: &Identity,
    ) -> Result<Vec<Embedding>, GalleryError> {
        let images = enrollment_images(&self.enroll_dir(&identity.id));
        let embeddings = build_identity(provider, &images, self.min_face_size)?;
        tracing::debug!(
            identity = %identity.id,
            images = images.len(),
            embeddings = embeddings.len(),
            "identity gallery built"
        );
        Ok(embeddings)
    }

    /// Rebuild every identity from scratch and publish the result.
    ///
    /// The new mapping is assembled privately; on error the live gallery is
    /// left untouched.
    pub fn refresh<P: DetectionProvider + ?Sized>(
        &self,
        provider: &P,
        roster: &[Identity],
    ) -> Result<Arc<Gallery>, GalleryError> {
        let mut entries = BTreeMap::new();
        for identity in roster {
            entries.insert(identity.id.clone(), self.build(provider, identity)?);
        }
        let gallery = self.publish(Gallery::from_entries(entries));
        tracing::info!(
            identities = gallery.identity_count(),
            embeddings = gallery.embedding_count(),
            "gallery refreshed"
        );
        Ok(gallery)
    }

    /// Publish the gallery persisted at `cache_path`, or build and persist it.
    ///
    /// A cache that fails to parse or verify is rebuilt. Failing to write the
    /// new cache is logged and ignored.
    pub fn build_or_load<P: DetectionProvider + ?Sized>(
        &self,
        provider: &P,
        roster: &[Identity],
        cache_path: &Path,
    ) -> Result<Arc<Gallery>, GalleryError> {
        if cache_path.exists() {
            match load_cache(cache_path) {
                Ok(gallery) => {
                    tracing::info!(
                        path = %cache_path.display(),
                        identities = gallery.identity_count(),
                        embeddings = gallery.embedding_count(),
                        "loaded cached gallery"
                    );
                    return Ok(self.publish(gallery));
                }
                Err(e) => {
                    tracing::warn!(path = %cache_path.display(), error = %e, "gallery cache unusable; rebuilding");
                }
            }
        }

        let gallery = self.refresh(provider, roster)?;
        if let Err(e) = save_cache(&gallery, cache_path) {
            tracing::warn!(path = %cache_path.display(), error = %e, "failed to persist gallery cache");
        }
        Ok(gallery)
    }

    /// Write the live gallery to `cache_path`.
    pub fn persist(&self, cache_path: &Path) -> Result<(), GalleryError> {
        save_cache(&self.snapshot(), cache_path)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GalleryCache {
    version: u32,
    embedding_dim: usize,
    checksum: String,
    entries: BTreeMap<String, Vec<Vec<f32>>>,
}

fn checksum(entries: &BTreeMap<String, Vec<Vec<f32>>>) -> String {
    let mut hasher = Sha256::new();
    for (id, vectors) in entries {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update((vectors.len() as u64).to_le_bytes());
        for v in vectors.iter().flatten() {
            hasher.update(v.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

fn save_cache(gallery: &Gallery, path: &Path) -> Result<(), GalleryError> {
    let entries: BTreeMap<String, Vec<Vec<f32>>> = gallery
        .iter()
        .map(|(id, e)| (id.to_string(), e.iter().map(|x| x.values.clone()).collect()))
        .collect();
    let embedding_dim = entries
        .values()
        .flatten()
        .next()
        .map(Vec::len)
        .unwrap_or(EMBEDDING_DIM);

    let cache = GalleryCache {
        version: CACHE_VERSION,
        embedding_dim,
        checksum: checksum(&entries),
        entries,
    };

    let io_err = |source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    // Write-then-rename so a crash never leaves a truncated cache behind.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(&cache)?).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

fn load_cache(path: &Path) -> Result<Gallery, GalleryError> {
    let bytes = std::fs::read(path).map_err(|source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cache: GalleryCache = serde_json::from_slice(&bytes)?;

    if cache.version != CACHE_VERSION {
        return Err(GalleryError::InvalidCache(format!(
            "version {} (expected {CACHE_VERSION})",
            cache.version
        )));
    }
    if let Some(bad) = cache.entries.values().flatten().find(|v| v.len() != cache.embedding_dim) {
        return Err(GalleryError::InvalidCache(format!(
            "embedding of length {} in a {}-dim gallery",
            bad.len(),
            cache.embedding_dim
        )));
    }
    if checksum(&cache.entries) != cache.checksum {
        return Err(GalleryError::InvalidCache("checksum mismatch".into()));
    }

    let entries = cache
        .entries
        .into_iter()
        .map(|(id, vectors)| {
            let embeddings = vectors
                .into_iter()
                .map(|values| Embedding::normalized(values, None))
                .collect();
            (id, embeddings)
        })
        .collect();
    Ok(Gallery::from_entries(entries))
}
