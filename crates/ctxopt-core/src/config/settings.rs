use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use git2::Config;

use crate::error::CoreError;
use crate::model::{ManifestId, ProfileDefaults};

/// When outcome reports are folded into profile weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackMode {
    Immediate,
    Batched,
}

impl FromStr for FeedbackMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "batched" => Ok(Self::Batched),
            other => Err(CoreError::Config(format!(
                "ctxopt.feedbackMode must be 'immediate' or 'batched', got '{other}'"
            ))),
        }
    }
}

impl FeedbackMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Batched => "batched",
        }
    }
}

/// What a manifest that was used in a failed task does to its weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Ignore,
    Penalize,
}

impl FromStr for FailurePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "penalize" => Ok(Self::Penalize),
            other => Err(CoreError::Config(format!(
                "ctxopt.failurePolicy must be 'ignore' or 'penalize', got '{other}'"
            ))),
        }
    }
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Penalize => "penalize",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub enabled: bool,
    pub default_budget: u64,
    pub default_essentials: Vec<String>,
    pub learning_rate: f64,
    pub min_relevance: f64,
    pub extended_threshold: f64,
    pub regen_timeout_ms: u64,
    pub route_timeout_ms: u64,
    pub feedback_mode: FeedbackMode,
    pub failure_policy: FailurePolicy,
    /// External command that produces manifest content for an id.
    pub generator: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_budget: 16 * 1024,
            default_essentials: vec!["project-manifest".to_string()],
            learning_rate: 0.1,
            min_relevance: 0.3,
            extended_threshold: 0.6,
            regen_timeout_ms: 2_000,
            route_timeout_ms: 5_000,
            feedback_mode: FeedbackMode::Immediate,
            failure_policy: FailurePolicy::Ignore,
            generator: None,
        }
    }
}

impl EngineConfig {
    /// Read config from the repo's .git/config [ctxopt] section.
    /// Missing keys fall back to defaults; malformed values are errors.
    pub fn load(config: &Config) -> Result<Self, CoreError> {
        let d = Self::default();
        let cfg = Self {
            enabled: config.get_bool("ctxopt.enabled").unwrap_or(d.enabled),
            default_budget: match config.get_i64("ctxopt.defaultBudget") {
                Ok(v) if v > 0 => v as u64,
                Ok(v) => {
                    return Err(CoreError::Config(format!(
                        "ctxopt.defaultBudget must be positive, got {v}"
                    )))
                }
                Err(_) => d.default_budget,
            },
            default_essentials: match config.get_string("ctxopt.defaultEssentials") {
                Ok(list) => split_list(&list),
                Err(_) => d.default_essentials,
            },
            learning_rate: read_f64(config, "ctxopt.learningRate")?.unwrap_or(d.learning_rate),
            min_relevance: read_f64(config, "ctxopt.minRelevance")?.unwrap_or(d.min_relevance),
            extended_threshold: read_f64(config, "ctxopt.extendedThreshold")?
                .unwrap_or(d.extended_threshold),
            regen_timeout_ms: read_u64(config, "ctxopt.regenTimeoutMs")?
                .unwrap_or(d.regen_timeout_ms),
            route_timeout_ms: read_u64(config, "ctxopt.routeTimeoutMs")?
                .unwrap_or(d.route_timeout_ms),
            feedback_mode: match config.get_string("ctxopt.feedbackMode") {
                Ok(s) => s.parse()?,
                Err(_) => d.feedback_mode,
            },
            failure_policy: match config.get_string("ctxopt.failurePolicy") {
                Ok(s) => s.parse()?,
                Err(_) => d.failure_policy,
            },
            generator: config.get_string("ctxopt.generator").ok(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write config to the repo's .git/config [ctxopt] section.
    pub fn save(&self, config: &mut Config) -> Result<(), CoreError> {
        self.validate()?;
        config.set_bool("ctxopt.enabled", self.enabled)?;
        config.set_i64("ctxopt.defaultBudget", self.default_budget as i64)?;
        config.set_str(
            "ctxopt.defaultEssentials",
            &self.default_essentials.join(","),
        )?;
        config.set_str("ctxopt.learningRate", &self.learning_rate.to_string())?;
        config.set_str("ctxopt.minRelevance", &self.min_relevance.to_string())?;
        config.set_str(
            "ctxopt.extendedThreshold",
            &self.extended_threshold.to_string(),
        )?;
        config.set_i64("ctxopt.regenTimeoutMs", self.regen_timeout_ms as i64)?;
        config.set_i64("ctxopt.routeTimeoutMs", self.route_timeout_ms as i64)?;
        config.set_str("ctxopt.feedbackMode", self.feedback_mode.as_str())?;
        config.set_str("ctxopt.failurePolicy", self.failure_policy.as_str())?;
        if let Some(gen) = &self.generator {
            config.set_str("ctxopt.generator", gen)?;
        }
        Ok(())
    }

    /// Default config for `ctxopt init`.
    pub fn default_init() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (key, v) in [
            ("learningRate", self.learning_rate),
            ("minRelevance", self.min_relevance),
            ("extendedThreshold", self.extended_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(CoreError::Config(format!(
                    "ctxopt.{key} must be within [0, 1], got {v}"
                )));
            }
        }
        if self.regen_timeout_ms == 0 || self.route_timeout_ms == 0 {
            return Err(CoreError::Config("timeouts must be non-zero".into()));
        }
        for id in &self.default_essentials {
            ManifestId::parse(id.clone())?;
        }
        Ok(())
    }

    pub fn regen_timeout(&self) -> Duration {
        Duration::from_millis(self.regen_timeout_ms)
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_millis(self.route_timeout_ms)
    }

    pub fn profile_defaults(&self) -> ProfileDefaults {
        ProfileDefaults {
            essential_ids: self
                .default_essentials
                .iter()
                .map(|s| ManifestId::from(s.as_str()))
                .collect::<BTreeSet<_>>(),
            budget_bytes: self.default_budget,
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

fn read_f64(config: &Config, key: &str) -> Result<Option<f64>, CoreError> {
    match config.get_string(key) {
        Ok(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| CoreError::Config(format!("{key}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn read_u64(config: &Config, key: &str) -> Result<Option<u64>, CoreError> {
    match config.get_i64(key) {
        Ok(v) if v >= 0 => Ok(Some(v as u64)),
        Ok(v) => Err(CoreError::Config(format!("{key} must be >= 0, got {v}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use tempfile::TempDir;

    #[test]
    fn test_missing_section_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        let cfg = EngineConfig::load(&repo.config().unwrap()).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        let mut cfg = EngineConfig::default_init();
        cfg.learning_rate = 0.25;
        cfg.default_essentials = vec!["project-manifest".into(), "security-manifest".into()];
        cfg.feedback_mode = FeedbackMode::Batched;
        cfg.generator = Some("gen-manifest".into());
        cfg.save(&mut repo.config().unwrap()).unwrap();

        let loaded = EngineConfig::load(&repo.config().unwrap()).unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.profile_defaults().essential_ids.len(), 2);
    }

    #[test]
    fn test_out_of_range_rate_rejected() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("ctxopt.learningRate", "1.5").unwrap();
        assert!(matches!(
            EngineConfig::load(&repo.config().unwrap()),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_bad_enum_value_rejected() {
        assert!("sometimes".parse::<FeedbackMode>().is_err());
        assert_eq!(
            "PENALIZE".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::Penalize
        );
    }
}
