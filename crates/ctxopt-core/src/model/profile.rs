use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::manifest::ManifestId;

/// Weight assumed for a manifest the profile has never learned about.
pub const NEUTRAL_WEIGHT: f64 = 0.5;

/// Per-agent-type routing configuration and learned state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub agent_type: String,
    #[serde(default)]
    pub essential_ids: BTreeSet<ManifestId>,
    #[serde(default)]
    pub optional_ids: BTreeSet<ManifestId>,
    #[serde(default)]
    pub excluded_ids: BTreeSet<ManifestId>,
    pub budget_bytes: u64,
    #[serde(default)]
    pub weights: BTreeMap<ManifestId, f64>,
    #[serde(default)]
    pub usage_counters: BTreeMap<ManifestId, UsageCounter>,
}

impl AgentProfile {
    /// The profile handed out the first time an unseen agent type asks for context.
    pub fn with_defaults(agent_type: &str, defaults: &ProfileDefaults) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            essential_ids: defaults.essential_ids.clone(),
            optional_ids: BTreeSet::new(),
            excluded_ids: BTreeSet::new(),
            budget_bytes: defaults.budget_bytes,
            weights: BTreeMap::new(),
            usage_counters: BTreeMap::new(),
        }
    }

    pub fn weight(&self, id: &ManifestId) -> f64 {
        self.weights.get(id).copied().unwrap_or(NEUTRAL_WEIGHT)
    }

    /// Optional ids that may actually be offered: excluded and essential ids removed.
    pub fn candidate_ids(&self) -> BTreeSet<ManifestId> {
        self.optional_ids
            .iter()
            .filter(|id| !self.excluded_ids.contains(*id) && !self.essential_ids.contains(*id))
            .cloned()
            .collect()
    }
}

/// How often a manifest was offered to and referenced by an agent type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageCounter {
    pub loaded: u64,
    pub used: u64,
    pub used_in_success: u64,
}

/// Settings used to build a profile for an unseen agent type.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDefaults {
    pub essential_ids: BTreeSet<ManifestId>,
    pub budget_bytes: u64,
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            essential_ids: [ManifestId::from("project-manifest")].into_iter().collect(),
            budget_bytes: 16 * 1024,
        }
    }
}

/// Clamped exponential-moving-average step toward `target`.
///
/// `rate` is clamped to `[0, 1]` and the result to `[0, 1]`, so any sequence
/// of updates keeps the weight in bounds. Non-finite inputs leave the weight
/// unchanged.
pub fn ema_update(weight: f64, target: f64, rate: f64) -> f64 {
    if !weight.is_finite() || !target.is_finite() || !rate.is_finite() {
        return weight.clamp(0.0, 1.0);
    }
    let rate = rate.clamp(0.0, 1.0);
    (weight + rate * (target - weight)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_shape() {
        let p = AgentProfile::with_defaults("frontend", &ProfileDefaults::default());
        assert_eq!(p.agent_type, "frontend");
        assert!(p.essential_ids.contains(&ManifestId::from("project-manifest")));
        assert!(p.optional_ids.is_empty());
        assert!(p.excluded_ids.is_empty());
        assert_eq!(p.budget_bytes, 16 * 1024);
    }

    #[test]
    fn test_unknown_weight_is_neutral() {
        let p = AgentProfile::with_defaults("x", &ProfileDefaults::default());
        assert_eq!(p.weight(&ManifestId::from("anything")), NEUTRAL_WEIGHT);
    }

    #[test]
    fn test_candidates_exclude_excluded_and_essential() {
        let mut p = AgentProfile::with_defaults("x", &ProfileDefaults::default());
        p.optional_ids = ["a", "b", "project-manifest"]
            .into_iter()
            .map(ManifestId::from)
            .collect();
        p.excluded_ids.insert(ManifestId::from("b"));
        let c: Vec<_> = p.candidate_ids().into_iter().collect();
        assert_eq!(c, vec![ManifestId::from("a")]);
    }

    #[test]
    fn test_ema_moves_toward_target_and_stays_bounded() {
        assert!((ema_update(0.5, 1.0, 0.1) - 0.55).abs() < 1e-12);
        assert!((ema_update(0.5, 0.0, 0.1) - 0.45).abs() < 1e-12);
        assert_eq!(ema_update(0.9, 1.0, 5.0), 1.0);
        assert_eq!(ema_update(0.2, 0.0, -3.0), 0.2);
        assert_eq!(ema_update(0.4, f64::NAN, 0.1), 0.4);
    }

    #[test]
    fn test_repeated_negative_updates_never_reach_zero() {
        let mut w = 0.5;
        for _ in 0..10 {
            let next = ema_update(w, 0.0, 0.1);
            assert!(next < w);
            assert!(next > 0.0);
            w = next;
        }
    }
}
