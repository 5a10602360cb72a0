//! Nearest-identity lookup over a gallery snapshot.

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default recognition cutoff under cosine distance.
pub const DEFAULT_MAX_DISTANCE: f32 = 0.45;

/// Distance used to compare a probe against reference embeddings.
///
/// Both expect unit-norm inputs. Smaller is always better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMetric {
    /// `1 - max(dot)`; in [0, 2].
    #[default]
    Cosine,
    /// `min ||probe - ref||`; in [0, 2].
    L2,
}

impl MatchMetric {
    /// Distance from `probe` to the closest of `references`.
    ///
    /// An empty reference set is infinitely far away.
    pub fn distance_to_gallery(self, probe: &Embedding, references: &[Embedding]) -> f32 {
        if references.is_empty() {
            return f32::INFINITY;
        }
        match self {
            MatchMetric::Cosine => {
                let best = references
                    .iter()
                    .map(|r| probe.dot(r))
                    .fold(f32::NEG_INFINITY, f32::max);
                // Rounding can push 1 - dot a hair below zero for identical vectors.
                (1.0 - best).max(0.0)
            }
            MatchMetric::L2 => references
                .iter()
                .map(|r| probe.euclidean_distance(r))
                .fold(f32::INFINITY, f32::min),
        }
    }
}

impl fmt::Display for MatchMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchMetric::Cosine => "cosine",
            MatchMetric::L2 => "l2",
        })
    }
}

impl FromStr for MatchMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(MatchMetric::Cosine),
            "l2" | "euclidean" => Ok(MatchMetric::L2),
            other => Err(format!("unknown match metric: {other} (expected cosine or l2)")),
        }
    }
}

/// Find the identity closest to `probe`.
///
/// Identities are visited in ascending id order; a later identity replaces
/// the current best only with a strictly smaller distance. Identities with no
/// reference embeddings are skipped, so a gallery with no entries at all
/// yields `(None, +inf)`.
pub fn best_match(probe: &Embedding, gallery: &Gallery, metric: MatchMetric) -> MatchResult {
    let mut best = MatchResult::none();
    for (id, references) in gallery.iter() {
        if references.is_empty() {
            continue;
        }
        let distance = metric.distance_to_gallery(probe, references);
        if best.identity.is_none() || distance < best.distance {
            best = MatchResult {
                identity: Some(id.to_string()),
                distance,
            };
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::normalized(values.to_vec(), None)
    }

    fn gallery(entries: Vec<(&str, Vec<Embedding>)>) -> Gallery {
        Gallery::from_entries(
            entries
                .into_iter()
                .map(|(id, e)| (id.to_string(), e))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_identical_vector_has_zero_cosine_distance() {
        let a = emb(&[0.3, -0.2, 0.9, 0.1]);
        let g = gallery(vec![("u_a", vec![a.clone()])]);
        let m = best_match(&a, &g, MatchMetric::Cosine);
        assert_eq!(m.identity.as_deref(), Some("u_a"));
        assert!(m.distance.abs() < 1e-6);
    }

    #[test]
    fn test_empty_gallery_is_infinitely_far() {
        let probe = emb(&[1.0, 0.0]);
        let m = best_match(&probe, &Gallery::default(), MatchMetric::Cosine);
        assert_eq!(m, MatchResult::none());

        let g = gallery(vec![("u_a", vec![]), ("u_b", vec![])]);
        let m = best_match(&probe, &g, MatchMetric::L2);
        assert_eq!(m.identity, None);
        assert!(m.distance.is_infinite());
    }

    #[test]
    fn test_empty_identity_never_wins() {
        let probe = emb(&[1.0, 0.0]);
        let g = gallery(vec![("u_a", vec![]), ("u_b", vec![emb(&[0.0, 1.0])])]);
        let m = best_match(&probe, &g, MatchMetric::Cosine);
        assert_eq!(m.identity.as_deref(), Some("u_b"));
        assert!((m.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_uses_best_reference_per_identity() {
        let probe = emb(&[1.0, 0.0, 0.0]);
        let g = gallery(vec![
            ("u_a", vec![emb(&[0.0, 1.0, 0.0]), emb(&[1.0, 1.0, 0.0])]),
            ("u_b", vec![emb(&[0.0, 0.0, 1.0])]),
        ]);
        let m = best_match(&probe, &g, MatchMetric::Cosine);
        assert_eq!(m.identity.as_deref(), Some("u_a"));
        assert!((m.distance - (1.0 - 0.5f32.sqrt())).abs() < 1e-5);
    }

    #[test]
    fn test_l2_distance() {
        let probe = emb(&[1.0, 0.0]);
        let g = gallery(vec![("u_a", vec![emb(&[0.0, 1.0]), emb(&[-1.0, 0.0])])]);
        let m = best_match(&probe, &g, MatchMetric::L2);
        assert!((m.distance - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_tie_keeps_first_identity_in_id_order() {
        let probe = emb(&[1.0, 0.0]);
        let r = emb(&[0.6, 0.8]);
        let g = gallery(vec![("u_b", vec![r.clone()]), ("u_a", vec![r])]);
        let m = best_match(&probe, &g, MatchMetric::Cosine);
        assert_eq!(m.identity.as_deref(), Some("u_a"));
    }

    #[test]
    fn test_metric_parse_and_display() {
        assert_eq!("COSINE".parse::<MatchMetric>(), Ok(MatchMetric::Cosine));
        assert_eq!("l2".parse::<MatchMetric>(), Ok(MatchMetric::L2));
        assert!("manhattan".parse::<MatchMetric>().is_err());
        assert_eq!(MatchMetric::L2.to_string(), "l2");
    }

    proptest! {
        #[test]
        fn prop_self_match_is_zero(values in prop::collection::vec(-1.0f32..1.0, 8..64)) {
            prop_assume!(values.iter().any(|v| v.abs() > 1e-3));
            let a = emb(&values);
            let g = gallery(vec![("u_x", vec![a.clone()])]);
            let cos = best_match(&a, &g, MatchMetric::Cosine);
            prop_assert!(cos.distance.abs() < 1e-5);
            let l2 = best_match(&a, &g, MatchMetric::L2);
            prop_assert!(l2.distance.abs() < 1e-5);
        }

        #[test]
        fn prop_distance_non_negative(
            a in prop::collection::vec(-1.0f32..1.0, 16),
            b in prop::collection::vec(-1.0f32..1.0, 16),
        ) {
            prop_assume!(a.iter().any(|v| v.abs() > 1e-3) && b.iter().any(|v| v.abs() > 1e-3));
            let g = gallery(vec![("u_x", vec![emb(&b)])]);
            for metric in [MatchMetric::Cosine, MatchMetric::L2] {
                let m = best_match(&emb(&a), &g, metric);
                prop_assert!(m.distance >= 0.0 && m.distance <= 2.0 + 1e-5);
            }
        }
    }
}
