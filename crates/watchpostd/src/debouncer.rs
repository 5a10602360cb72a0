//! Chooses which unknown face, if any, becomes an event.

use std::time::{Duration, Instant};
use watchpost_core::{Embedding, Rect};

/// A face after identity matching.
#[derive(Debug, Clone)]
pub struct LabeledFace {
    /// Display name, or `None` for an unrecognized face.
    pub name: Option<String>,
    pub distance: f32,
    pub bbox: Rect,
    pub embedding: Embedding,
}

impl LabeledFace {
    pub fn is_unknown(&self) -> bool {
        self.name.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Ready to emit on the next unknown face.
    Idle,
    /// Within the cooldown of the last emission.
    Suppressed,
}

/// Enforces a minimum gap between emitted events.
#[derive(Debug)]
pub struct EventDebouncer {
    cooldown: Duration,
    last_emitted: Option<Instant>,
}

impl EventDebouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_emitted: None,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// State as of `now`. Suppression lapses without any call.
    pub fn state(&self, now: Instant) -> DebounceState {
        match self.last_emitted {
            Some(t) if now.saturating_duration_since(t) < self.cooldown => DebounceState::Suppressed,
            _ => DebounceState::Idle,
        }
    }

    /// Pick the face to report for this frame and mark the emission time.
    ///
    /// Returns `None` when no face is unknown or the cooldown has not passed.
    pub fn evaluate<'a>(&mut self, faces: &'a [LabeledFace], now: Instant) -> Option<&'a LabeledFace> {
        let candidate = select_candidate(faces)?;
        if self.state(now) == DebounceState::Suppressed {
            tracing::trace!(distance = candidate.distance, "unknown face suppressed by cooldown");
            return None;
        }
        self.last_emitted = Some(now);
        Some(candidate)
    }
}

/// The unknown face closest to any gallery; ties keep the first one.
pub fn select_candidate(faces: &[LabeledFace]) -> Option<&LabeledFace> {
    faces
        .iter()
        .filter(|f| f.is_unknown())
        .fold(None, |best: Option<&LabeledFace>, f| match best {
            Some(b) if b.distance <= f.distance => Some(b),
            _ => Some(f),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(name: Option<&str>, distance: f32, x: i32) -> LabeledFace {
        LabeledFace {
            name: name.map(str::to_string),
            distance,
            bbox: Rect::new(x, 0, 10, 10),
            embedding: Embedding::normalized(vec![1.0, 0.0], None),
        }
    }

    #[test]
    fn test_smallest_unknown_distance_wins() {
        let faces = vec![face(None, 0.30, 1), face(None, 0.20, 2)];
        assert_eq!(select_candidate(&faces).unwrap().bbox.x, 2);
    }

    #[test]
    fn test_tie_keeps_first_seen() {
        let faces = vec![face(None, 0.5, 1), face(None, 0.5, 2)];
        assert_eq!(select_candidate(&faces).unwrap().bbox.x, 1);
    }

    #[test]
    fn test_known_faces_never_alert() {
        let faces = vec![face(Some("Alice"), 0.1, 1), face(Some("Bob"), 0.2, 2)];
        assert!(select_candidate(&faces).is_none());
        let mut d = EventDebouncer::new(Duration::from_secs(5));
        assert!(d.evaluate(&faces, Instant::now()).is_none());
        assert_eq!(d.state(Instant::now()), DebounceState::Idle);
    }

    #[test]
    fn test_infinite_distances_still_select() {
        let faces = vec![face(None, f32::INFINITY, 1), face(Some("A"), 0.1, 2)];
        assert_eq!(select_candidate(&faces).unwrap().bbox.x, 1);
    }

    #[test]
    fn test_cooldown_blocks_then_releases() {
        let t0 = Instant::now();
        let mut d = EventDebouncer::new(Duration::from_secs(5));
        let faces = vec![face(None, 0.9, 1)];

        assert_eq!(d.state(t0), DebounceState::Idle);
        assert!(d.evaluate(&faces, t0).is_some());
        assert_eq!(d.state(t0), DebounceState::Suppressed);

        for ms in [1, 1000, 4999] {
            assert!(d.evaluate(&faces, t0 + Duration::from_millis(ms)).is_none());
        }
        // Suppressed evaluations do not extend the cooldown.
        assert_eq!(d.state(t0 + Duration::from_secs(5)), DebounceState::Idle);
        assert!(d.evaluate(&faces, t0 + Duration::from_secs(5)).is_some());
        assert!(d.evaluate(&faces, t0 + Duration::from_secs(6)).is_none());
    }

    #[test]
    fn test_frames_without_candidates_leave_state_alone() {
        let t0 = Instant::now();
        let mut d = EventDebouncer::new(Duration::from_secs(5));
        assert!(d.evaluate(&[], t0).is_none());
        assert_eq!(d.state(t0), DebounceState::Idle);
        assert!(d.evaluate(&[face(None, 0.4, 1)], t0 + Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_zero_cooldown_emits_every_time() {
        let t0 = Instant::now();
        let mut d = EventDebouncer::new(Duration::ZERO);
        let faces = vec![face(None, 0.9, 1)];
        assert!(d.evaluate(&faces, t0).is_some());
        assert!(d.evaluate(&faces, t0).is_some());
    }
}
