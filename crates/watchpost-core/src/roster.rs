//! Enrolled-people roster: `users.json` plus one image directory per person.

use crate::types::Identity;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("roster file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("not a readable image: {path}: {source}")]
    InvalidImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RosterError + '_ {
    move |source| RosterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Flat-file roster.
#[derive(Debug, Clone)]
pub struct Roster {
    users_json: PathBuf,
    enroll_root: PathBuf,
}

impl Roster {
    pub fn new(users_json: impl Into<PathBuf>, enroll_root: impl Into<PathBuf>) -> Self {
        Self {
            users_json: users_json.into(),
            enroll_root: enroll_root.into(),
        }
    }

    pub fn enroll_root(&self) -> &Path {
        &self.enroll_root
    }

    pub fn enroll_dir(&self, id: &str) -> PathBuf {
        self.enroll_root.join(id)
    }

    /// All identities. A roster file that does not exist yet is empty.
    pub fn load(&self) -> Result<Vec<Identity>, RosterError> {
        if !self.users_json.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.users_json).map_err(io_error(&self.users_json))?;
        serde_json::from_slice(&bytes).map_err(|source| RosterError::Parse {
            path: self.users_json.clone(),
            source,
        })
    }

    pub fn save(&self, identities: &[Identity]) -> Result<(), RosterError> {
        if let Some(parent) = self.users_json.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let json = serde_json::to_vec_pretty(identities).map_err(|source| RosterError::Parse {
            path: self.users_json.clone(),
            source,
        })?;
        std::fs::write(&self.users_json, json).map_err(io_error(&self.users_json))
    }

    pub fn get(&self, id: &str) -> Result<Option<Identity>, RosterError> {
        Ok(self.load()?.into_iter().find(|i| i.id == id))
    }

    /// Add a person and create their (empty) enrollment directory.
    pub fn create(&self, name: &str) -> Result<Identity, RosterError> {
        let mut identities = self.load()?;
        let identity = Identity {
            id: new_identity_id(),
            name: name.to_string(),
            created_at: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        identities.push(identity.clone());
        self.save(&identities)?;

        let dir = self.enroll_dir(&identity.id);
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        tracing::info!(id = %identity.id, name, "identity created");
        Ok(identity)
    }

    /// Copy enrollment images into the identity's directory.
    ///
    /// Every source must decode as an image; nothing is copied otherwise.
    pub fn enroll_images(&self, id: &str, sources: &[PathBuf]) -> Result<Vec<PathBuf>, RosterError> {
        if self.get(id)?.is_none() {
            return Err(RosterError::UnknownIdentity(id.to_string()));
        }
        for src in sources {
            image::open(src).map_err(|source| RosterError::InvalidImage {
                path: src.clone(),
                source,
            })?;
        }

        let dir = self.enroll_dir(id);
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let mut written = Vec::with_capacity(sources.len());
        for src in sources {
            let dest = unique_destination(&dir, src);
            std::fs::copy(src, &dest).map_err(io_error(&dest))?;
            written.push(dest);
        }
        tracing::info!(id, count = written.len(), "enrollment images added");
        Ok(written)
    }
}

/// `u_` followed by eight lowercase hex digits.
fn new_identity_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("u_{}", &hex[..8])
}

fn unique_destination(dir: &Path, src: &Path) -> PathBuf {
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.jpg".to_string());
    let candidate = dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }
    let hex = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!("{}_{name}", &hex[..8]))
}
