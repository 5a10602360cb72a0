//! Gallery plus roster names, shared by the pipeline and the D-Bus service.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use watchpost_core::gallery::GalleryError;
use watchpost_core::roster::RosterError;
use watchpost_core::{DetectionProvider, Gallery, GalleryStore, Identity, Roster};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("roster: {0}")]
    Roster(#[from] RosterError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
}

/// Who is enrolled and what they look like.
pub struct Catalog {
    store: GalleryStore,
    roster: Roster,
    provider: Arc<dyn DetectionProvider>,
    cache_path: PathBuf,
    identities: RwLock<Arc<Vec<Identity>>>,
    /// Held for a whole load or rebuild so the last one to start publishes last.
    rebuild: Mutex<()>,
}

impl Catalog {
    pub fn new(
        store: GalleryStore,
        roster: Roster,
        provider: Arc<dyn DetectionProvider>,
        cache_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            roster,
            provider,
            cache_path: cache_path.into(),
            identities: RwLock::new(Arc::new(Vec::new())),
            rebuild: Mutex::new(()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn DetectionProvider> {
        &self.provider
    }

    /// Startup: use the persisted gallery if it is valid, else build and persist it.
    pub fn load(&self) -> Result<usize, CatalogError> {
        let _rebuild = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);
        let identities = self.roster.load()?;
        let gallery = self
            .store
            .build_or_load(self.provider.as_ref(), &identities, &self.cache_path)?;
        self.publish_identities(identities);
        Ok(gallery.identity_count())
    }

    /// Reload the roster, rebuild every identity, swap, then persist.
    ///
    /// Returns the number of identities rebuilt. A failed cache write is
    /// logged; the new gallery stays live regardless. Concurrent calls run
    /// one after another, each reading the roster only once it holds the turn.
    pub fn refresh(&self) -> Result<usize, CatalogError> {
        let _rebuild = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);
        let identities = self.roster.load()?;
        let gallery = self.store.refresh(self.provider.as_ref(), &identities)?;
        self.publish_identities(identities);
        if let Err(e) = self.store.persist(&self.cache_path) {
            tracing::warn!(path = %self.cache_path.display(), error = %e, "failed to persist gallery cache");
        }
        Ok(gallery.identity_count())
    }

    pub fn gallery(&self) -> Arc<Gallery> {
        self.store.snapshot()
    }

    pub fn identities(&self) -> Arc<Vec<Identity>> {
        Arc::clone(&self.identities.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Display names keyed by identity id, as of the last load or refresh.
    pub fn names(&self) -> HashMap<String, String> {
        self.identities()
            .iter()
            .map(|i| (i.id.clone(), i.name.clone()))
            .collect()
    }

    fn publish_identities(&self, identities: Vec<Identity>) {
        *self.identities.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(identities);
    }
}
