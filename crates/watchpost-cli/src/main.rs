use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use watchpost_core::{EventLog, EventRecord, Roster};
use watchpost_hw::{Camera, CaptureSettings, FrameSource, PixelFormat};

#[zbus::proxy(
    interface = "org.watchpost.Daemon1",
    default_service = "org.watchpost.Daemon1",
    default_path = "/org/watchpost/Daemon1"
)]
trait Daemon {
    async fn status(&self) -> zbus::Result<String>;
    async fn list_events(&self, limit: u32) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn refresh_gallery(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(
    name = "watchpost",
    about = "Watchpost monitoring CLI",
    long_about = "Watchpost monitoring CLI.\n\nRoster, enrollment and event commands work on the daemon's files \
                  directly. Relative paths resolve against --data-dir, as in the daemon; pass \
                  --users-json, --enroll-dir or --events-csv when its [roster] or [events] \
                  sections move them."
)]
struct Cli {
    /// Data directory shared with the daemon
    #[arg(long, env = "WATCHPOST_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,
    /// Roster file (daemon `[roster] users_json`)
    #[arg(long, default_value = "users.json", global = true)]
    users_json: PathBuf,
    /// Enrollment image root (daemon `[roster] enroll_dir`)
    #[arg(long, default_value = "enroll", global = true)]
    enroll_dir: PathBuf,
    /// Event log (daemon `[events] csv_path`)
    #[arg(long, default_value = "events/events.csv", global = true)]
    events_csv: PathBuf,
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage enrolled people
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// Add enrollment images for a person
    Enroll {
        /// Identity id (see `watchpost users list`)
        id: String,
        /// Image files to copy in
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Ask the daemon to rebuild its gallery afterwards
        #[arg(long)]
        refresh: bool,
    },
    /// Show recent events, newest first
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Ask the daemon instead of reading the log file
        #[arg(long)]
        remote: bool,
    },
    /// Show daemon status
    Status,
    /// Ask the daemon to rebuild its gallery
    Refresh,
    /// Run camera diagnostics
    Test {
        #[arg(long, env = "WATCHPOST_CAMERA_DEVICE", default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value = "YUYV")]
        fourcc: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
}

#[derive(Subcommand)]
enum UsersCommand {
    /// Create a person and their enrollment directory
    Add { name: String },
    /// List enrolled people
    List {
        /// Ask the daemon instead, including gallery embedding counts
        #[arg(long)]
        remote: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let roster = Roster::new(cli.data_path(&cli.users_json), cli.data_path(&cli.enroll_dir));
    let events_csv = cli.data_path(&cli.events_csv);

    match cli.command {
        Commands::Users { command: UsersCommand::Add { name } } => {
            let identity = roster.create(&name)?;
            println!("{}  {}", identity.id, identity.name);
            println!("Add images with: watchpost enroll {} <images...>", identity.id);
        }
        Commands::Users {
            command: UsersCommand::List { remote: true },
        } => {
            let list = proxy(cli.system).await?.list_identities().await?;
            let value: serde_json::Value = serde_json::from_str(&list)?;
            for i in value.as_array().into_iter().flatten() {
                println!(
                    "{}  {:<24} {:>3} embeddings",
                    i["id"].as_str().unwrap_or("?"),
                    i["name"].as_str().unwrap_or("?"),
                    i["embeddings"].as_u64().unwrap_or(0)
                );
            }
        }
        Commands::Users {
            command: UsersCommand::List { remote: false },
        } => {
            let identities = roster.load()?;
            if identities.is_empty() {
                println!("No one enrolled");
            }
            for i in identities {
                let images = watchpost_core::gallery::enrollment_images(&roster.enroll_dir(&i.id)).len();
                println!("{}  {:<24} {:>3} images  created {}", i.id, i.name, images, i.created_at);
            }
        }
        Commands::Enroll { id, images, refresh } => {
            let written = roster.enroll_images(&id, &images)?;
            tracing::info!(id = %id, images = written.len(), "enrollment images added");
            println!("Added {} image(s) for {id}", written.len());
            if refresh {
                let n = proxy(cli.system).await?.refresh_gallery().await?;
                println!("Gallery rebuilt: {n} identities");
            }
        }
        Commands::Events { limit, remote } => {
            let records: Vec<EventRecord> = if remote {
                let json = proxy(cli.system).await?.list_events(limit as u32).await?;
                serde_json::from_str(&json)?
            } else {
                EventLog::new(events_csv).recent(limit)?
            };
            if records.is_empty() {
                println!("No events");
            }
            for r in records {
                println!(
                    "{}  {:<8} d={:.3}  bbox=({},{},{},{})  {}",
                    r.timestamp, r.label, r.distance, r.bbox_x, r.bbox_y, r.bbox_w, r.bbox_h, r.image_path
                );
            }
        }
        Commands::Status => {
            let status = proxy(cli.system)
                .await?
                .status()
                .await
                .context("watchpostd: not connected")?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Refresh => {
            let n = proxy(cli.system).await?.refresh_gallery().await?;
            println!("Gallery rebuilt: {n} identities");
        }
        Commands::Test {
            device,
            fourcc,
            width,
            height,
        } => camera_test(CaptureSettings {
            device,
            width,
            height,
            format: fourcc.parse::<PixelFormat>().map_err(anyhow::Error::msg)?,
        })?,
    }

    Ok(())
}

impl Cli {
    /// Resolve a path the way the daemon does: relative to the data directory.
    fn data_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

async fn proxy(system: bool) -> Result<DaemonProxy<'static>> {
    tracing::debug!(system, "connecting to watchpostd");
    let connection = if system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    Ok(DaemonProxy::new(&connection).await?)
}

fn camera_test(settings: CaptureSettings) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        bail!("no V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let mut camera = Camera::open(&settings).with_context(|| format!("opening {}", settings.device))?;
    println!(
        "Opened {}: {}x{} {}",
        camera.device_path, camera.width, camera.height, camera.format
    );

    let frame = camera.read()?;
    println!(
        "Captured frame #{}: {}x{}, brightness {:.1}",
        frame.sequence,
        frame.width(),
        frame.height(),
        frame.avg_brightness()
    );
    camera.release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enroll_with_images() {
        let cli = Cli::try_parse_from(["watchpost", "enroll", "u_1234abcd", "a.jpg", "b.png", "--refresh"]).unwrap();
        match cli.command {
            Commands::Enroll { id, images, refresh } => {
                assert_eq!(id, "u_1234abcd");
                assert_eq!(images, vec![PathBuf::from("a.jpg"), PathBuf::from("b.png")]);
                assert!(refresh);
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_enroll_requires_images() {
        assert!(Cli::try_parse_from(["watchpost", "enroll", "u_1234abcd"]).is_err());
    }

    #[test]
    fn test_parse_users_and_events() {
        let cli = Cli::try_parse_from(["watchpost", "--data-dir", "/tmp/wp", "users", "add", "Alice"]).unwrap();
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/wp"));
        assert!(matches!(cli.command, Commands::Users { command: UsersCommand::Add { ref name } } if name == "Alice"));

        let cli = Cli::try_parse_from(["watchpost", "events", "-l", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Events { limit: 5, remote: false }));
    }

    #[test]
    fn test_paths_resolve_like_the_daemon() {
        let cli = Cli::try_parse_from(["watchpost", "--data-dir", "/srv/wp", "users", "list"]).unwrap();
        assert_eq!(cli.data_path(&cli.users_json), PathBuf::from("/srv/wp/users.json"));
        assert_eq!(cli.data_path(&cli.enroll_dir), PathBuf::from("/srv/wp/enroll"));
        assert_eq!(cli.data_path(&cli.events_csv), PathBuf::from("/srv/wp/events/events.csv"));

        let cli = Cli::try_parse_from([
            "watchpost",
            "--data-dir",
            "/srv/wp",
            "events",
            "--events-csv",
            "/var/log/wp.csv",
            "--enroll-dir",
            "faces",
        ])
        .unwrap();
        assert_eq!(cli.data_path(&cli.events_csv), PathBuf::from("/var/log/wp.csv"));
        assert_eq!(cli.data_path(&cli.enroll_dir), PathBuf::from("/srv/wp/faces"));
    }
}
