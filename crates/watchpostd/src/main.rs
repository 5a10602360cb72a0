use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use watchpost_core::{DetectionProvider, EngineCell, EventLog, GalleryStore, Roster, SnapshotStore};
use watchpost_hw::{Camera, FrameSource, ReplaySource};

mod catalog;
mod config;
mod dbus_interface;
mod debouncer;
mod notifier;
mod pipeline;
mod sampler;

use catalog::Catalog;
use config::{BusKind, Config, SourceKind};
use notifier::{Notifier, TelegramCredentials, TelegramNotifier};
use pipeline::{Pipeline, PipelineSettings};

#[derive(Parser)]
#[command(name = "watchpostd", about = "Watchpost monitoring daemon")]
struct Args {
    /// Configuration file
    #[arg(long, env = "WATCHPOST_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Overlay merged over the configuration (e.g. a demo profile)
    #[arg(long)]
    overlay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config, args.overlay.as_deref())
        .with_context(|| format!("loading {}", args.config.display()))?;

    tracing::info!(config = %args.config.display(), "watchpostd starting");

    // Models load once, up front, so a missing model fails before the camera opens.
    let engine = Arc::new(EngineCell::onnx(config.engine_config()));
    if config.face.enabled {
        engine.get().context("loading face models")?;
        tracing::info!(model_dir = %config.engine_config().model_dir.display(), "face models loaded");
    }

    let provider: Arc<dyn DetectionProvider> = engine.clone();
    let catalog = Arc::new(Catalog::new(
        GalleryStore::new(config.enroll_dir(), config.face.min_face_size),
        Roster::new(config.users_json(), config.enroll_dir()),
        provider,
        config.gallery_cache(),
    ));
    if config.face.enabled {
        let identities = catalog.load().context("building gallery")?;
        tracing::info!(identities, "gallery ready");
    }

    let (source, source_desc) = open_source(&config)?;
    let events = EventLog::new(config.events_csv());
    let pipeline = Pipeline::new(
        source,
        Arc::clone(&catalog),
        PipelineSettings::from_config(&config),
        SnapshotStore::new(config.events_dir()),
        events.clone(),
    );
    let stats = pipeline.stats();

    let telegram = config.notify.telegram.clone();
    let mut handle = pipeline
        .spawn(move || make_notifier(&telegram))
        .context("spawning pipeline thread")?;

    let service = dbus_interface::WatchpostService {
        catalog,
        stats,
        events,
        engine,
        source: source_desc,
        face_enabled: config.face.enabled,
    };
    let builder = match config.service.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = ?config.service.bus, name = dbus_interface::BUS_NAME, "watchpostd ready");

    let result = tokio::select! {
        r = handle.finished() => r,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("watchpostd shutting down");
            handle.stop();
            handle.finished().await
        }
    };

    result.context("pipeline failed")
}

fn open_source(config: &Config) -> Result<(Box<dyn FrameSource>, String)> {
    match config.input.source {
        SourceKind::Camera => {
            let settings = config.capture_settings()?;
            let camera = Camera::open(&settings)
                .with_context(|| format!("opening camera {}", settings.device))?;
            tracing::info!(
                device = %settings.device,
                width = camera.width,
                height = camera.height,
                format = %camera.format,
                "camera opened"
            );
            Ok((Box::new(camera), format!("camera:{}", settings.device)))
        }
        SourceKind::Replay => {
            let dir = config.replay_dir();
            let replay = ReplaySource::open(&dir)
                .with_context(|| format!("opening replay directory {}", dir.display()))?;
            Ok((Box::new(replay), format!("replay:{}", dir.display())))
        }
    }
}

/// Runs on the pipeline thread; the blocking HTTP client must not be built on the runtime.
fn make_notifier(telegram: &config::TelegramSection) -> Option<Box<dyn Notifier>> {
    if !telegram.enabled {
        return None;
    }
    let built = TelegramCredentials::from_env(|k| std::env::var(k).ok()).and_then(|creds| {
        TelegramNotifier::new(creds, std::time::Duration::from_secs(telegram.timeout_secs))
    });
    match built {
        Ok(n) => {
            tracing::info!("telegram notifications enabled");
            Some(Box::new(n))
        }
        Err(e) => {
            tracing::warn!(error = %e, "telegram notifications disabled");
            None
        }
    }
}
