use std::cmp::Ordering;
use std::path::Path;

use serde::Serialize;

use ctxopt_core::model::{AgentProfile, Manifest, ManifestId};

use crate::intent::TaskAnalysis;

/// Distance component used when no hint is available.
pub const NEUTRAL_DISTANCE: f64 = 0.5;

/// Relative weight of each scoring signal. Sums to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub overlap: f64,
    pub learned: f64,
    pub distance: f64,
    pub freshness: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            overlap: 0.6,
            learned: 0.25,
            distance: 0.1,
            freshness: 0.05,
        }
    }
}

/// How close a manifest is to what the caller is currently editing.
pub trait DistanceHint: Send + Sync {
    /// Distance in `[0, 1]` (0 = same place), or `None` when unknown.
    fn distance(&self, manifest: &Manifest) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoDistance;

impl DistanceHint for NoDistance {
    fn distance(&self, _manifest: &Manifest) -> Option<f64> {
        None
    }
}

/// Directory-tree distance between a manifest's sources and a set of
/// focus files: hops to the common ancestor over total depth, minimized
/// across all pairs.
#[derive(Debug, Clone, Default)]
pub struct PathDistance {
    focus: Vec<Vec<String>>,
}

impl PathDistance {
    pub fn new<I, S>(focus: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            focus: focus.into_iter().map(|p| dir_parts(p.as_ref())).collect(),
        }
    }
}

fn dir_parts(path: &str) -> Vec<String> {
    let unified = path.replace('\\', "/");
    let p = Path::new(&unified);
    p.parent()
        .map(|d| {
            d.components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn tree_distance(a: &[String], b: &[String]) -> f64 {
    let depth = a.len() + b.len();
    if depth == 0 {
        return 0.0;
    }
    let common = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    (depth - 2 * common) as f64 / depth as f64
}

impl DistanceHint for PathDistance {
    fn distance(&self, manifest: &Manifest) -> Option<f64> {
        let mut best: Option<f64> = None;
        for source in &manifest.source_files {
            let dirs = dir_parts(source);
            for focus in &self.focus {
                let d = tree_distance(&dirs, focus);
                best = Some(best.map_or(d, |b| b.min(d)));
            }
        }
        best
    }
}

/// Every signal behind one candidate's score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub manifest_id: ManifestId,
    pub size_bytes: u64,
    pub overlap: f64,
    pub learned: f64,
    pub distance: Option<f64>,
    pub fresh: bool,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Scorer {
    weights: ScoreWeights,
}

impl Scorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    /// Share of the task's domain confidence covered by the manifest's tags.
    pub fn overlap(manifest: &Manifest, analysis: &TaskAnalysis) -> f64 {
        let shared: f64 = manifest
            .domain_tags
            .iter()
            .map(|tag| analysis.confidence(tag))
            .sum();
        shared / analysis.total_confidence().max(1.0)
    }

    pub fn score(
        &self,
        manifest: &Manifest,
        analysis: &TaskAnalysis,
        profile: &AgentProfile,
        distance: Option<f64>,
        fresh: bool,
    ) -> ScoreBreakdown {
        let w = self.weights;
        let overlap = Self::overlap(manifest, analysis);
        let learned = profile.weight(&manifest.id).clamp(0.0, 1.0);
        let distance = distance.filter(|d| d.is_finite()).map(|d| d.clamp(0.0, 1.0));
        let proximity = distance.map_or(NEUTRAL_DISTANCE, |d| 1.0 - d);
        let freshness = if fresh { 1.0 } else { 0.0 };

        let score = w.overlap * overlap
            + w.learned * learned
            + w.distance * proximity
            + w.freshness * freshness;

        ScoreBreakdown {
            manifest_id: manifest.id.clone(),
            size_bytes: manifest.size_bytes,
            overlap,
            learned,
            distance,
            fresh,
            score,
        }
    }
}

/// Sort candidates best first.
pub fn rank(scored: &mut [ScoreBreakdown]) {
    scored.sort_by(compare);
}

/// Score descending, then smaller manifests first, then id.
pub fn compare(a: &ScoreBreakdown, b: &ScoreBreakdown) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.size_bytes.cmp(&b.size_bytes))
        .then_with(|| a.manifest_id.cmp(&b.manifest_id))
}
