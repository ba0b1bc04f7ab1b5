use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use ctxopt_core::config::{EngineConfig, FailurePolicy, FeedbackMode};
use ctxopt_core::model::{ManifestId, UsageEvent, UsageRecord};
use ctxopt_core::storage::{ProfileStore, UsageLog};

use crate::error::RouteError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackSettings {
    pub learning_rate: f64,
    pub mode: FeedbackMode,
    pub failure_policy: FailurePolicy,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            mode: FeedbackMode::Immediate,
            failure_policy: FailurePolicy::Ignore,
        }
    }
}

impl FeedbackSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            mode: config.feedback_mode,
            failure_policy: config.failure_policy,
        }
    }
}

/// What one outcome report changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackSummary {
    /// New weight per manifest that was moved.
    pub updated: BTreeMap<ManifestId, f64>,
    /// Reported as used but never offered; carries no signal.
    pub ignored: Vec<ManifestId>,
    /// Queued for the next flush instead of applied.
    pub deferred: bool,
}

/// Turns usage outcomes into profile weight updates.
pub struct FeedbackLoop {
    profiles: Arc<dyn ProfileStore>,
    log: Arc<UsageLog>,
    settings: FeedbackSettings,
    pending: Mutex<Vec<UsageRecord>>,
}

impl FeedbackLoop {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        log: Arc<UsageLog>,
        settings: FeedbackSettings,
    ) -> Self {
        Self {
            profiles,
            log,
            settings,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> FeedbackSettings {
        self.settings
    }

    /// Log the outcome, then learn from it now or on the next flush
    /// depending on the feedback mode.
    pub fn record_outcome(&self, record: UsageRecord) -> Result<FeedbackSummary, RouteError> {
        self.log.append(UsageEvent::Outcome(record.clone()))?;
        match self.settings.mode {
            FeedbackMode::Immediate => self.apply(&record),
            FeedbackMode::Batched => {
                self.pending.lock().push(record);
                Ok(FeedbackSummary {
                    deferred: true,
                    ..Default::default()
                })
            }
        }
    }

    /// Apply every queued outcome. Returns how many were applied.
    pub fn flush(&self) -> Result<usize, RouteError> {
        let queued = std::mem::take(&mut *self.pending.lock());
        let count = queued.len();
        for (i, record) in queued.iter().enumerate() {
            if let Err(e) = self.apply(record) {
                // Requeue what was not applied, ahead of anything queued since
                let mut pending = self.pending.lock();
                let newer = std::mem::take(&mut *pending);
                pending.extend(queued[i..].iter().cloned());
                pending.extend(newer);
                return Err(e);
            }
        }
        if count > 0 {
            tracing::debug!(count, "Flushed queued outcomes");
        }
        Ok(count)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn apply(&self, record: &UsageRecord) -> Result<FeedbackSummary, RouteError> {
        let agent = record.agent_type.as_str();
        let loaded: BTreeSet<&ManifestId> = record.manifests_loaded.iter().collect();
        let used: BTreeSet<&ManifestId> = record.manifests_used.iter().collect();
        let mut summary = FeedbackSummary::default();

        for id in &loaded {
            let was_used = used.contains(id);
            let target = match (was_used, record.success) {
                (true, true) => Some(1.0),
                (false, _) => Some(0.0),
                (true, false) => match self.settings.failure_policy {
                    FailurePolicy::Ignore => None,
                    FailurePolicy::Penalize => Some(0.0),
                },
            };
            if let Some(target) = target {
                let w = self.profiles.update_weight(
                    agent,
                    id,
                    target,
                    self.settings.learning_rate,
                )?;
                tracing::debug!(agent_type = agent, manifest_id = %id, weight = w, "Updated weight");
                summary.updated.insert((*id).clone(), w);
            }
            self.profiles
                .record_usage(agent, id, was_used, record.success)?;
        }

        summary.ignored = used
            .difference(&loaded)
            .map(|id| (*id).clone())
            .collect();
        if !summary.ignored.is_empty() {
            tracing::debug!(
                agent_type = agent,
                ignored = ?summary.ignored,
                "Ignoring manifests reported used but never loaded"
            );
        }

        self.profiles.flush()?;
        Ok(summary)
    }
}
