//! Per-frame decision loop: motion → sampled detection → matching → debounce → side effects.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::debouncer::{EventDebouncer, LabeledFace};
use crate::notifier::{render_caption, Notifier};
use crate::sampler::FaceSampler;
use image::{GrayImage, RgbImage};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use watchpost_core::events::EventLogError;
use watchpost_core::motion::MotionError;
use watchpost_core::provider::ProviderError;
use watchpost_core::{
    best_match, DetectedFace, EventLog, EventRecord, MatchMetric, MotionConfig, MotionGate, SnapshotStore,
    UNKNOWN_LABEL,
};
use watchpost_hw::frame::gaussian_blur;
use watchpost_hw::{FrameSource, SourceError};

/// File-name label for unknown-face snapshots.
const SNAPSHOT_LABEL: &str = "unknown";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("video source: {0}")]
    Source(#[from] SourceError),
    #[error("motion: {0}")]
    Motion(#[from] MotionError),
    #[error("detection provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("event persistence: {0}")]
    EventLog(#[from] EventLogError),
    #[error("pipeline thread exited without reporting")]
    ThreadExited,
}

/// Tunables the loop reads on every frame.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub motion_enabled: bool,
    pub motion: MotionConfig,
    pub blur_kernel: u32,
    pub face_enabled: bool,
    pub min_face_size: u32,
    pub match_metric: MatchMetric,
    pub max_distance: f32,
    pub sample_every: u64,
    pub cooldown: Duration,
    pub refresh_interval: Duration,
    pub caption_template: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            motion_enabled: config.motion.enabled,
            motion: config.motion_config(),
            blur_kernel: config.motion.blur_kernel,
            face_enabled: config.face.enabled,
            min_face_size: config.face.min_face_size,
            match_metric: config.face.match_metric,
            max_distance: config.face.max_distance,
            sample_every: config.face.sample_every,
            cooldown: config.cooldown(),
            refresh_interval: config.refresh_interval(),
            caption_template: config.notify.telegram.body_template.clone(),
        }
    }
}

/// Counters published for the status service.
#[derive(Debug, Default)]
pub struct PipelineStats {
    running: AtomicBool,
    frames: AtomicU64,
    detector_calls: AtomicU64,
    events: AtomicU64,
    last_event: Mutex<Option<EventRecord>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub running: bool,
    pub frames: u64,
    pub detector_calls: u64,
    pub events: u64,
    pub last_event: Option<EventRecord>,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            running: self.running.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            detector_calls: self.detector_calls.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            last_event: self
                .last_event
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn record_event(&self, record: &EventRecord) {
        self.events.fetch_add(1, Ordering::Relaxed);
        *self.last_event.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
    }
}

/// What one call to [`Pipeline::step`] did.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub frame_index: u64,
    /// First frame: only stored as the motion reference.
    pub primed: bool,
    pub motion: bool,
    pub faces: usize,
    pub event: Option<EventRecord>,
}

pub struct Pipeline<S> {
    source: S,
    catalog: Arc<Catalog>,
    settings: PipelineSettings,
    gate: MotionGate,
    sampler: FaceSampler,
    debouncer: EventDebouncer,
    snapshots: SnapshotStore,
    log: EventLog,
    notifier: Option<Box<dyn Notifier>>,
    stats: Arc<PipelineStats>,
    stop: Arc<AtomicBool>,
    prev_gray: Option<GrayImage>,
    frame_index: u64,
    last_refresh: Instant,
}

impl<S: FrameSource> Pipeline<S> {
    pub fn new(
        source: S,
        catalog: Arc<Catalog>,
        settings: PipelineSettings,
        snapshots: SnapshotStore,
        log: EventLog,
    ) -> Self {
        Self {
            source,
            catalog,
            gate: MotionGate::new(settings.motion),
            sampler: FaceSampler::new(settings.sample_every),
            debouncer: EventDebouncer::new(settings.cooldown),
            settings,
            snapshots,
            log,
            notifier: None,
            stats: Arc::new(PipelineStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
            prev_gray: None,
            frame_index: 0,
            last_refresh: Instant::now(),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Setting this flag ends [`Pipeline::run`] before the next frame.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Process one frame.
    pub fn step(&mut self) -> Result<StepOutcome, PipelineError> {
        self.maybe_refresh();

        let frame = self.source.read()?;
        self.frame_index += 1;
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        let mut outcome = StepOutcome {
            frame_index: self.frame_index,
            ..StepOutcome::default()
        };

        let gray = gaussian_blur(&frame.to_gray(), self.settings.blur_kernel);
        let Some(prev) = self.prev_gray.take() else {
            self.prev_gray = Some(gray);
            outcome.primed = true;
            return Ok(outcome);
        };

        outcome.motion = self.settings.motion_enabled && self.gate.detect(&prev, &gray)?.motion_detected;

        let sample_faces = outcome.motion && self.settings.face_enabled;
        let provider = self.catalog.provider();
        let stats = &self.stats;
        let min_face_size = self.settings.min_face_size;
        let faces = self.sampler.sample(self.frame_index, sample_faces, || {
            stats.detector_calls.fetch_add(1, Ordering::Relaxed);
            provider.detect_and_embed(&frame.image, min_face_size)
        })?;
        outcome.faces = faces.len();

        let labeled = classify(&self.catalog, &self.settings, faces);
        for face in &labeled {
            tracing::debug!(
                frame = self.frame_index,
                label = face.name.as_deref().unwrap_or(UNKNOWN_LABEL),
                distance = face.distance,
                "face classified"
            );
        }

        if let Some(candidate) = self.debouncer.evaluate(&labeled, Instant::now()) {
            outcome.event = Some(self.emit(&frame.image, candidate)?);
        }

        self.prev_gray = Some(gray);
        Ok(outcome)
    }

    /// Loop until the stop flag is set or a frame cannot be read.
    pub fn run(mut self) -> Result<(), PipelineError> {
        self.stats.running.store(true, Ordering::Relaxed);
        tracing::info!("pipeline started");

        let result = loop {
            if self.stop.load(Ordering::Relaxed) {
                tracing::info!(frames = self.frame_index, "pipeline stop requested");
                break Ok(());
            }
            if let Err(e) = self.step() {
                tracing::error!(error = %e, frame = self.frame_index, "pipeline stopped");
                break Err(e);
            }
        };

        self.source.release();
        self.stats.running.store(false, Ordering::Relaxed);
        result
    }

    fn maybe_refresh(&mut self) {
        if !self.settings.face_enabled || self.last_refresh.elapsed() < self.settings.refresh_interval {
            return;
        }
        // A failed rebuild leaves the previous gallery live.
        if let Err(e) = self.catalog.refresh() {
            tracing::warn!(error = %e, "periodic gallery refresh failed");
        }
        self.last_refresh = Instant::now();
    }

    fn emit(&self, image: &RgbImage, face: &LabeledFace) -> Result<EventRecord, PipelineError> {
        let at = chrono::Local::now();
        let path = self.snapshots.save(image, SNAPSHOT_LABEL, at)?;
        let record = EventRecord::new(at, UNKNOWN_LABEL, face.distance, face.bbox, &path);
        self.log.append(&record)?;
        self.stats.record_event(&record);
        tracing::info!(
            distance = face.distance,
            bbox = ?face.bbox,
            image = %path.display(),
            "UNKNOWN face event"
        );

        if let Some(notifier) = &self.notifier {
            let caption = render_caption(&self.settings.caption_template, at);
            if let Err(e) = notifier.notify(&path, &caption) {
                tracing::warn!(error = %e, "notification failed");
            }
        }
        Ok(record)
    }
}

impl<S: FrameSource + 'static> Pipeline<S> {
    /// Run on a dedicated OS thread.
    ///
    /// `make_notifier` runs on that thread before the first frame.
    pub fn spawn<F>(self, make_notifier: F) -> std::io::Result<PipelineHandle>
    where
        F: FnOnce() -> Option<Box<dyn Notifier>> + Send + 'static,
    {
        let stop = self.stop_flag();
        let (done_tx, done_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("watchpost-pipeline".into())
            .spawn(move || {
                let mut pipeline = self;
                pipeline.notifier = make_notifier();
                let _ = done_tx.send(pipeline.run());
            })?;

        Ok(PipelineHandle { stop, done: done_rx })
    }
}

/// Control handle for a spawned pipeline.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    done: oneshot::Receiver<Result<(), PipelineError>>,
}

impl PipelineHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the loop to end. Call at most once.
    pub async fn finished(&mut self) -> Result<(), PipelineError> {
        (&mut self.done).await.map_err(|_| PipelineError::ThreadExited)?
    }
}

fn classify(catalog: &Catalog, settings: &PipelineSettings, faces: &[DetectedFace]) -> Vec<LabeledFace> {
    if faces.is_empty() {
        return Vec::new();
    }
    let gallery = catalog.gallery();
    let names: HashMap<String, String> = catalog.names();
    faces
        .iter()
        .map(|face| {
            let m = best_match(&face.embedding, &gallery, settings.match_metric);
            let name = match m.identity {
                Some(id) if m.distance <= settings.max_distance => {
                    Some(names.get(&id).cloned().unwrap_or(id))
                }
                _ => None,
            };
            LabeledFace {
                name,
                distance: m.distance,
                bbox: face.bbox,
                embedding: face.embedding.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotifyError;
    use image::Rgb;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use watchpost_core::{DetectionProvider, Embedding, GalleryStore, Rect, Roster};
    use watchpost_hw::Frame;

    const W: u32 = 160;
    const H: u32 = 120;

    struct ScriptedSource {
        frames: VecDeque<RgbImage>,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Frame, SourceError> {
            self.frames
                .pop_front()
                .map(|img| Frame::new(img, 0))
                .ok_or_else(|| SourceError::SourceUnavailable("script finished".into()))
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::Relaxed);
        }
    }

    /// Always reports one face with the same embedding, unless told to fail.
    struct OneFace {
        calls: AtomicU64,
        embedding: Embedding,
        broken: AtomicBool,
    }

    impl DetectionProvider for OneFace {
        fn detect_and_embed(&self, _frame: &RgbImage, _min: u32) -> Result<Vec<DetectedFace>, ProviderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.broken.load(Ordering::Relaxed) {
                return Err(ProviderError::Poisoned);
            }
            Ok(vec![DetectedFace {
                bbox: Rect::new(20, 10, 90, 90),
                confidence: 0.95,
                embedding: self.embedding.clone(),
            }])
        }
    }

    struct RecordingNotifier(Arc<Mutex<Vec<(PathBuf, String)>>>);

    impl Notifier for RecordingNotifier {
        fn notify(&self, image: &Path, caption: &str) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push((image.to_path_buf(), caption.to_string()));
            Ok(())
        }
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn notify(&self, _image: &Path, _caption: &str) -> Result<(), NotifyError> {
            Err(NotifyError::MissingCredentials)
        }
    }

    fn still() -> RgbImage {
        RgbImage::from_pixel(W, H, Rgb([30, 30, 30]))
    }

    fn with_square(x: u32) -> RgbImage {
        let mut img = still();
        for yy in 40..80 {
            for xx in x..x + 40 {
                img.put_pixel(xx, yy, Rgb([220, 220, 220]));
            }
        }
        img
    }

    /// 10 still frames, then 4 frames with a square jumping around.
    fn script() -> VecDeque<RgbImage> {
        let mut frames: VecDeque<RgbImage> = (0..10).map(|_| still()).collect();
        frames.extend([10, 60, 110, 10].into_iter().map(with_square));
        frames
    }

    fn settings() -> PipelineSettings {
        PipelineSettings::from_config(&Config::default())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        provider: Arc<OneFace>,
        roster: Roster,
        catalog: Arc<Catalog>,
        events: PathBuf,
        csv: PathBuf,
        released: Arc<AtomicBool>,
    }

    fn fixture(probe: Vec<f32>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(OneFace {
            calls: AtomicU64::new(0),
            embedding: Embedding::normalized(probe, None),
            broken: AtomicBool::new(false),
        });
        let roster = Roster::new(dir.path().join("users.json"), dir.path().join("enroll"));
        let catalog = Arc::new(Catalog::new(
            GalleryStore::new(dir.path().join("enroll"), 1),
            roster.clone(),
            provider.clone(),
            dir.path().join("gallery.json"),
        ));
        Fixture {
            events: dir.path().join("events"),
            csv: dir.path().join("events").join("events.csv"),
            _dir: dir,
            provider,
            roster,
            catalog,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn pipeline(fx: &Fixture, settings: PipelineSettings) -> Pipeline<ScriptedSource> {
        let source = ScriptedSource {
            frames: script(),
            released: fx.released.clone(),
        };
        Pipeline::new(
            source,
            fx.catalog.clone(),
            settings,
            SnapshotStore::new(&fx.events),
            EventLog::new(&fx.csv),
        )
    }

    #[test]
    fn test_still_then_moving_unknown_emits_exactly_one_event() {
        let fx = fixture(vec![0.0, 1.0, 0.0]);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut p = pipeline(&fx, settings()).with_notifier(Box::new(RecordingNotifier(sent.clone())));

        for i in 1..=10 {
            let out = p.step().unwrap();
            assert_eq!(out.frame_index, i);
            assert_eq!(out.primed, i == 1);
            assert!(!out.motion);
            assert!(out.event.is_none());
        }
        assert_eq!(fx.provider.calls.load(Ordering::Relaxed), 0);

        let moving: Vec<StepOutcome> = (0..4).map(|_| p.step().unwrap()).collect();
        assert!(moving.iter().all(|o| o.motion));
        // Frame 11 precedes the first sampling slot; 12 samples; 13 and 14 reuse.
        assert_eq!(moving.iter().map(|o| o.faces).collect::<Vec<_>>(), vec![0, 1, 1, 1]);
        assert_eq!(fx.provider.calls.load(Ordering::Relaxed), 1);

        let events: Vec<&EventRecord> = moving.iter().filter_map(|o| o.event.as_ref()).collect();
        assert_eq!(events.len(), 1);
        let event = events[0];
        assert_eq!(event.label, "UNKNOWN");
        assert!(event.distance.is_infinite());
        assert_eq!(event.bbox(), Rect::new(20, 10, 90, 90));
        assert!(Path::new(&event.image_path).exists());
        assert!(event.image_path.ends_with("_unknown.jpg"));

        let logged = EventLog::new(&fx.csv).read_all().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].image_path, event.image_path);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("Unknown face at "));

        let stats = p.stats().snapshot();
        assert_eq!((stats.frames, stats.detector_calls, stats.events), (14, 1, 1));
        assert_eq!(stats.last_event.as_ref(), Some(event));
    }

    #[test]
    fn test_known_face_never_alerts() {
        let fx = fixture(vec![0.0, 1.0, 0.0]);
        let alice = fx.roster.create("Alice").unwrap();
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]))
            .save(fx.roster.enroll_dir(&alice.id).join("a.png"))
            .unwrap();
        fx.catalog.load().unwrap();

        let mut p = pipeline(&fx, settings());
        let outcomes: Vec<StepOutcome> = (0..14).map(|_| p.step().unwrap()).collect();
        assert!(outcomes.iter().all(|o| o.event.is_none()));
        assert!(outcomes.iter().any(|o| o.faces == 1));
        assert!(!fx.csv.exists());
    }

    #[test]
    fn test_motion_disabled_never_detects() {
        let fx = fixture(vec![1.0, 0.0]);
        let mut s = settings();
        s.motion_enabled = false;
        let mut p = pipeline(&fx, s);
        for _ in 0..14 {
            let out = p.step().unwrap();
            assert!(!out.motion);
        }
        assert_eq!(fx.provider.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_face_disabled_never_calls_provider() {
        let fx = fixture(vec![1.0, 0.0]);
        let mut s = settings();
        s.face_enabled = false;
        let mut p = pipeline(&fx, s);
        let outcomes: Vec<StepOutcome> = (0..14).map(|_| p.step().unwrap()).collect();
        assert!(outcomes.iter().any(|o| o.motion));
        assert_eq!(fx.provider.calls.load(Ordering::Relaxed), 0);
        assert!(outcomes.iter().all(|o| o.event.is_none()));
    }

    #[test]
    fn test_notifier_failure_is_not_fatal() {
        let fx = fixture(vec![1.0, 0.0]);
        let mut p = pipeline(&fx, settings()).with_notifier(Box::new(FailingNotifier));
        let outcomes: Vec<StepOutcome> = (0..14).map(|_| p.step().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|o| o.event.is_some()).count(), 1);
        assert_eq!(EventLog::new(&fx.csv).read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_run_ends_on_source_exhaustion_and_releases() {
        let fx = fixture(vec![1.0, 0.0]);
        let p = pipeline(&fx, settings());
        let stats = p.stats();
        let err = p.run().unwrap_err();
        assert!(matches!(err, PipelineError::Source(SourceError::SourceUnavailable(_))));
        assert!(fx.released.load(Ordering::Relaxed));
        let snap = stats.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.frames, 14);
    }

    #[test]
    fn test_stop_flag_ends_run_cleanly() {
        let fx = fixture(vec![1.0, 0.0]);
        let p = pipeline(&fx, settings());
        p.stop_flag().store(true, Ordering::Relaxed);
        let stats = p.stats();
        p.run().unwrap();
        assert_eq!(stats.snapshot().frames, 0);
        assert!(fx.released.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_spawned_pipeline_reports_completion() {
        let fx = fixture(vec![1.0, 0.0]);
        let mut handle = pipeline(&fx, settings()).spawn(|| None).unwrap();
        let result = handle.finished().await;
        assert!(matches!(result, Err(PipelineError::Source(_))));
    }

    #[test]
    fn test_zero_refresh_interval_rebuilds_gallery_each_frame() {
        let fx = fixture(vec![0.0, 1.0, 0.0]);
        let mut s = settings();
        s.refresh_interval = Duration::ZERO;
        let mut p = pipeline(&fx, s);
        p.step().unwrap();

        // An identity created mid-run is picked up by the next refresh.
        let bob = fx.roster.create("Bob").unwrap();
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]))
            .save(fx.roster.enroll_dir(&bob.id).join("b.png"))
            .unwrap();
        let outcomes: Vec<StepOutcome> = (0..13).map(|_| p.step().unwrap()).collect();
        assert!(fx.catalog.gallery().get(&bob.id).is_some());
        assert!(outcomes.iter().all(|o| o.event.is_none()));
    }

    fn enroll(fx: &Fixture, name: &str) -> String {
        let identity = fx.roster.create(name).unwrap();
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]))
            .save(fx.roster.enroll_dir(&identity.id).join("face.png"))
            .unwrap();
        identity.id
    }

    #[test]
    fn test_face_disabled_skips_periodic_refresh() {
        let fx = fixture(vec![0.0, 1.0, 0.0]);
        enroll(&fx, "Alice");
        let mut s = settings();
        s.face_enabled = false;
        s.refresh_interval = Duration::ZERO;
        let mut p = pipeline(&fx, s);
        for _ in 0..14 {
            p.step().unwrap();
        }
        assert_eq!(fx.provider.calls.load(Ordering::Relaxed), 0);
        assert_eq!(fx.catalog.gallery().identity_count(), 0);
    }

    #[test]
    fn test_failed_periodic_refresh_keeps_previous_gallery() {
        let fx = fixture(vec![0.0, 1.0, 0.0]);
        let alice = enroll(&fx, "Alice");
        fx.catalog.load().unwrap();
        let before = fx.catalog.gallery();
        assert_eq!(before.get(&alice).map(<[Embedding]>::len), Some(1));

        fx.provider.broken.store(true, Ordering::Relaxed);
        let mut s = settings();
        s.motion_enabled = false;
        s.refresh_interval = Duration::ZERO;
        let mut p = pipeline(&fx, s);
        let calls_before = fx.provider.calls.load(Ordering::Relaxed);
        for _ in 0..3 {
            p.step().unwrap();
        }
        // Each step attempted a rebuild and each one failed.
        assert_eq!(fx.provider.calls.load(Ordering::Relaxed), calls_before + 3);
        assert!(Arc::ptr_eq(&before, &fx.catalog.gallery()));
    }
}
