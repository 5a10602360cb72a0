use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use watchpost_core::matcher::{MatchMetric, DEFAULT_MAX_DISTANCE};
use watchpost_core::motion::{self, MotionConfig};
use watchpost_core::provider::{self, EngineConfig, DEFAULT_MIN_CONFIDENCE};
use watchpost_hw::{CaptureSettings, PixelFormat};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration, loaded from TOML with `WATCHPOST_*` overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for relative paths in `[events]`, `[gallery]` and `[roster]`.
    pub data_dir: PathBuf,
    pub input: InputConfig,
    pub motion: MotionSection,
    pub face: FaceSection,
    pub events: EventsSection,
    pub gallery: GallerySection,
    pub roster: RosterSection,
    pub notify: NotifySection,
    pub service: ServiceSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            input: InputConfig::default(),
            motion: MotionSection::default(),
            face: FaceSection::default(),
            events: EventsSection::default(),
            gallery: GallerySection::default(),
            roster: RosterSection::default(),
            notify: NotifySection::default(),
            service: ServiceSection::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Camera,
    Replay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub source: SourceKind,
    /// V4L2 device path.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// YUYV, MJPG or GREY.
    pub fourcc: String,
    /// Directory of still images played back when `source = "replay"`.
    pub replay_dir: PathBuf,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Camera,
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fourcc: "YUYV".to_string(),
            replay_dir: PathBuf::from("replay"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSection {
    pub enabled: bool,
    pub threshold: u8,
    pub min_area: u32,
    /// Gaussian kernel size applied before differencing.
    pub blur_kernel: u32,
    pub dilate_iterations: u32,
}

impl Default for MotionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: motion::DEFAULT_THRESHOLD,
            min_area: motion::DEFAULT_MIN_AREA,
            blur_kernel: 21,
            dilate_iterations: motion::DEFAULT_DILATE_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceSection {
    pub enabled: bool,
    /// Directory holding det_10g.onnx and w600k_r50.onnx. Unset uses the XDG data dir.
    pub model_dir: Option<PathBuf>,
    pub min_face_size: u32,
    pub min_confidence: f32,
    pub match_metric: MatchMetric,
    pub max_distance: f32,
    /// Run detection on every Nth frame while motion persists.
    pub sample_every: u64,
}

impl Default for FaceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            model_dir: None,
            min_face_size: 80,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            match_metric: MatchMetric::Cosine,
            max_distance: DEFAULT_MAX_DISTANCE,
            sample_every: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub dir: PathBuf,
    pub csv_path: PathBuf,
    pub cooldown_sec: f64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("events"),
            csv_path: PathBuf::from("events/events.csv"),
            cooldown_sec: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GallerySection {
    pub refresh_interval_secs: u64,
    pub cache_path: PathBuf,
}

impl Default for GallerySection {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            cache_path: PathBuf::from("gallery.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterSection {
    pub users_json: PathBuf,
    pub enroll_dir: PathBuf,
}

impl Default for RosterSection {
    fn default() -> Self {
        Self {
            users_json: PathBuf::from("users.json"),
            enroll_dir: PathBuf::from("enroll"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySection {
    pub telegram: TelegramSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    pub enabled: bool,
    /// Caption; `{time}` expands to the local event time.
    pub body_template: String,
    pub timeout_secs: u64,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            enabled: false,
            body_template: "Unknown face at {time}".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub bus: BusKind,
}

impl Config {
    /// Load `path` (missing file → defaults), merge `overlay` over it, then
    /// apply environment overrides.
    ///
    /// An overlay that cannot be read or parsed is logged and skipped.
    pub fn load(path: &Path, overlay: Option<&Path>) -> Result<Self, ConfigError> {
        let mut table = if path.exists() {
            read_table(path)?
        } else {
            tracing::info!(path = %path.display(), "config file not found; using defaults");
            toml::Table::new()
        };

        if let Some(overlay) = overlay {
            match read_table(overlay) {
                Ok(extra) => {
                    merge_tables(&mut table, extra);
                    tracing::info!(path = %overlay.display(), "applied config overlay");
                }
                Err(e) => tracing::warn!(error = %e, "could not load config overlay; ignoring"),
            }
        }

        let mut config = toml::Value::Table(table)
            .try_into::<Config>()
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `WATCHPOST_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("WATCHPOST_MODEL_DIR") {
            self.face.model_dir = Some(PathBuf::from(dir));
        }
        if let Some(device) = lookup("WATCHPOST_CAMERA_DEVICE") {
            self.input.device = device;
        }
        if let Some(dir) = lookup("WATCHPOST_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.face.sample_every == 0 {
            return Err(ConfigError::Invalid("face.sample_every must be at least 1".into()));
        }
        if Duration::try_from_secs_f64(self.events.cooldown_sec).is_err() {
            return Err(ConfigError::Invalid(format!(
                "events.cooldown_sec must be a non-negative number of seconds, got {}",
                self.events.cooldown_sec
            )));
        }
        if self.face.max_distance < 0.0 {
            return Err(ConfigError::Invalid("face.max_distance must be non-negative".into()));
        }
        self.capture_settings()?;
        Ok(())
    }

    /// Resolve a configured path against `data_dir`.
    pub fn data_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn events_dir(&self) -> PathBuf {
        self.data_path(&self.events.dir)
    }

    pub fn events_csv(&self) -> PathBuf {
        self.data_path(&self.events.csv_path)
    }

    pub fn gallery_cache(&self) -> PathBuf {
        self.data_path(&self.gallery.cache_path)
    }

    pub fn users_json(&self) -> PathBuf {
        self.data_path(&self.roster.users_json)
    }

    pub fn enroll_dir(&self) -> PathBuf {
        self.data_path(&self.roster.enroll_dir)
    }

    pub fn replay_dir(&self) -> PathBuf {
        self.data_path(&self.input.replay_dir)
    }

    /// Out-of-range values saturate; `validate` rejects them before use.
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.events.cooldown_sec).unwrap_or(Duration::MAX)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.gallery.refresh_interval_secs)
    }

    pub fn motion_config(&self) -> MotionConfig {
        MotionConfig {
            threshold: self.motion.threshold,
            min_area: self.motion.min_area,
            dilate_iterations: self.motion.dilate_iterations,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            model_dir: self
                .face
                .model_dir
                .clone()
                .unwrap_or_else(provider::default_model_dir),
            min_confidence: self.face.min_confidence,
        }
    }

    pub fn capture_settings(&self) -> Result<CaptureSettings, ConfigError> {
        let format: PixelFormat = self.input.fourcc.parse().map_err(ConfigError::Invalid)?;
        Ok(CaptureSettings {
            device: self.input.device.clone(),
            width: self.input.width,
            height: self.input.height,
            format,
        })
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    text.parse::<toml::Table>().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Recursive merge: nested tables merge key by key, anything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let (Some(toml::Value::Table(b)), toml::Value::Table(o)) = (base.get_mut(&key), &value) {
            merge_tables(b, o.clone());
            continue;
        }
        base.insert(key, value);
    }
}
