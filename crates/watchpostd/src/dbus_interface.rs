use crate::catalog::Catalog;
use crate::pipeline::PipelineStats;
use serde_json::json;
use std::sync::Arc;
use watchpost_core::{EngineCell, EventLog};
use zbus::interface;

pub const BUS_NAME: &str = "org.watchpost.Daemon1";
pub const OBJECT_PATH: &str = "/org/watchpost/Daemon1";

/// Upper bound for `ListEvents`.
const MAX_EVENTS: u32 = 1000;

/// D-Bus interface for the watchpost daemon.
///
/// Bus name: org.watchpost.Daemon1
/// Object path: /org/watchpost/Daemon1
pub struct WatchpostService {
    pub catalog: Arc<Catalog>,
    pub stats: Arc<PipelineStats>,
    pub events: EventLog,
    pub engine: Arc<EngineCell>,
    pub source: String,
    /// Recognition off: no gallery rebuilds, no model loads.
    pub face_enabled: bool,
}

#[interface(name = "org.watchpost.Daemon1")]
impl WatchpostService {
    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(status_json(self).to_string())
    }

    /// Most recent events first, as a JSON array.
    async fn list_events(&self, limit: u32) -> zbus::fdo::Result<String> {
        let log = self.events.clone();
        let limit = limit.min(MAX_EVENTS) as usize;
        let records = tokio::task::spawn_blocking(move || log.recent(limit))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("event reader panicked: {e}")))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Enrolled identities with their reference counts, as a JSON array.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        Ok(identities_json(&self.catalog).to_string())
    }

    /// Rebuild the gallery from the roster; returns the number of identities.
    async fn refresh_gallery(&self) -> zbus::fdo::Result<u32> {
        if !self.face_enabled {
            return Err(zbus::fdo::Error::NotSupported(
                "face recognition is disabled (face.enabled = false)".into(),
            ));
        }
        tracing::info!("gallery refresh requested");
        let catalog = Arc::clone(&self.catalog);
        let count = tokio::task::spawn_blocking(move || catalog.refresh())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("refresh panicked: {e}")))?
            .map_err(|e| {
                tracing::warn!(error = %e, "gallery refresh failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;
        Ok(count as u32)
    }
}

fn status_json(service: &WatchpostService) -> serde_json::Value {
    let gallery = service.catalog.gallery();
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "source": service.source,
        "models_loaded": service.engine.is_loaded(),
        "face_enabled": service.face_enabled,
        "pipeline": service.stats.snapshot(),
        "gallery": {
            "identities": gallery.identity_count(),
            "embeddings": gallery.embedding_count(),
        },
    })
}

fn identities_json(catalog: &Catalog) -> serde_json::Value {
    let gallery = catalog.gallery();
    let identities = catalog.identities();
    serde_json::Value::Array(
        identities
            .iter()
            .map(|i| {
                json!({
                    "id": i.id,
                    "name": i.name,
                    "created_at": i.created_at,
                    "embeddings": gallery.get(&i.id).map_or(0, |e| e.len()),
                })
            })
            .collect(),
    )
}
