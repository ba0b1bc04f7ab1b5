use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::CoreError;
use crate::model::{
    ema_update, AgentProfile, ManifestId, ProfileDefaults, UsageCounter, NEUTRAL_WEIGHT,
};

use super::table::{JsonTable, TableStamp};

/// Narrow interface to per-agent-type profiles.
///
/// The router reads through it; only the feedback loop writes weights.
pub trait ProfileStore: Send + Sync {
    /// Fetch a snapshot of the profile, creating and persisting the default
    /// profile if `agent_type` has never been seen.
    fn get_profile(&self, agent_type: &str) -> Result<AgentProfile, CoreError>;

    /// Replace the id sets and budget of a profile. Learned weights and
    /// counters carried by `profile` replace the stored ones.
    fn put_profile(&self, profile: AgentProfile) -> Result<(), CoreError>;

    /// Apply one clamped EMA step and return the new weight.
    fn update_weight(
        &self,
        agent_type: &str,
        manifest_id: &ManifestId,
        target: f64,
        rate: f64,
    ) -> Result<f64, CoreError>;

    /// Bump the offered/used counters for one manifest.
    fn record_usage(
        &self,
        agent_type: &str,
        manifest_id: &ManifestId,
        used: bool,
        success: bool,
    ) -> Result<(), CoreError>;

    fn list_agent_types(&self) -> Result<Vec<String>, CoreError>;

    /// Make buffered changes durable.
    fn flush(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Debug)]
struct ProfileSets {
    essential_ids: BTreeSet<ManifestId>,
    optional_ids: BTreeSet<ManifestId>,
    excluded_ids: BTreeSet<ManifestId>,
    budget_bytes: u64,
}

/// Live profile state. Weights and counters live in their own maps so that
/// updates to different manifests never contend on the id sets.
#[derive(Debug)]
struct ProfileRecord {
    agent_type: String,
    sets: RwLock<ProfileSets>,
    weights: DashMap<ManifestId, f64>,
    counters: DashMap<ManifestId, UsageCounter>,
}

impl ProfileRecord {
    fn from_profile(p: AgentProfile) -> Self {
        Self {
            agent_type: p.agent_type,
            sets: RwLock::new(ProfileSets {
                essential_ids: p.essential_ids,
                optional_ids: p.optional_ids,
                excluded_ids: p.excluded_ids,
                budget_bytes: p.budget_bytes,
            }),
            weights: p.weights.into_iter().collect(),
            counters: p.usage_counters.into_iter().collect(),
        }
    }

    fn snapshot(&self) -> AgentProfile {
        let sets = self.sets.read();
        AgentProfile {
            agent_type: self.agent_type.clone(),
            essential_ids: sets.essential_ids.clone(),
            optional_ids: sets.optional_ids.clone(),
            excluded_ids: sets.excluded_ids.clone(),
            budget_bytes: sets.budget_bytes,
            weights: self
                .weights
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            usage_counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

/// In-memory profile store. Also the live state behind [`FileProfileStore`].
#[derive(Debug)]
pub struct MemoryProfileStore {
    defaults: ProfileDefaults,
    profiles: DashMap<String, Arc<ProfileRecord>>,
}

impl MemoryProfileStore {
    pub fn new(defaults: ProfileDefaults) -> Self {
        Self {
            defaults,
            profiles: DashMap::new(),
        }
    }

    pub fn with_profiles(
        defaults: ProfileDefaults,
        profiles: impl IntoIterator<Item = AgentProfile>,
    ) -> Self {
        let store = Self::new(defaults);
        for p in profiles {
            store
                .profiles
                .insert(p.agent_type.clone(), Arc::new(ProfileRecord::from_profile(p)));
        }
        store
    }

    /// Look up the record, creating the default one on first use.
    /// The flag is true when this call created it.
    fn record(&self, agent_type: &str) -> (Arc<ProfileRecord>, bool) {
        if let Some(rec) = self.profiles.get(agent_type) {
            return (Arc::clone(rec.value()), false);
        }
        let mut created = false;
        let rec = self
            .profiles
            .entry(agent_type.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(ProfileRecord::from_profile(AgentProfile::with_defaults(
                    agent_type,
                    &self.defaults,
                )))
            })
            .value()
            .clone();
        if created {
            tracing::info!(agent_type, "Created default profile for unseen agent type");
        }
        (rec, created)
    }

    fn snapshot_all(&self) -> BTreeMap<String, AgentProfile> {
        self.profiles
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get_profile(&self, agent_type: &str) -> Result<AgentProfile, CoreError> {
        Ok(self.record(agent_type).0.snapshot())
    }

    fn put_profile(&self, profile: AgentProfile) -> Result<(), CoreError> {
        let (rec, _) = self.record(&profile.agent_type);
        {
            let mut sets = rec.sets.write();
            sets.essential_ids = profile.essential_ids;
            sets.optional_ids = profile.optional_ids;
            sets.excluded_ids = profile.excluded_ids;
            sets.budget_bytes = profile.budget_bytes;
        }
        rec.weights
            .retain(|id, _| profile.weights.contains_key(id));
        for (id, w) in profile.weights {
            rec.weights.insert(id, w.clamp(0.0, 1.0));
        }
        rec.counters
            .retain(|id, _| profile.usage_counters.contains_key(id));
        for (id, c) in profile.usage_counters {
            rec.counters.insert(id, c);
        }
        Ok(())
    }

    fn update_weight(
        &self,
        agent_type: &str,
        manifest_id: &ManifestId,
        target: f64,
        rate: f64,
    ) -> Result<f64, CoreError> {
        let (rec, _) = self.record(agent_type);
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut cell = rec
            .weights
            .entry(manifest_id.clone())
            .or_insert(NEUTRAL_WEIGHT);
        let updated = ema_update(*cell, target, rate);
        *cell = updated;
        Ok(updated)
    }

    fn record_usage(
        &self,
        agent_type: &str,
        manifest_id: &ManifestId,
        used: bool,
        success: bool,
    ) -> Result<(), CoreError> {
        let (rec, _) = self.record(agent_type);
        let mut counter = rec.counters.entry(manifest_id.clone()).or_default();
        counter.loaded += 1;
        if used {
            counter.used += 1;
            if success {
                counter.used_in_success += 1;
            }
        }
        Ok(())
    }

    fn list_agent_types(&self) -> Result<Vec<String>, CoreError> {
        let mut types: Vec<String> = self.profiles.iter().map(|e| e.key().clone()).collect();
        types.sort();
        Ok(types)
    }
}

/// Changes made through one [`FileProfileStore`] since its last write.
#[derive(Debug, Default)]
struct PendingChanges {
    /// Rows first created here; written only if no other writer created them.
    created: BTreeSet<String>,
    /// Rows replaced wholesale by `put_profile`.
    replaced: BTreeSet<String>,
    weights: BTreeSet<(String, ManifestId)>,
    /// Counter increments, added onto whatever the table holds.
    counters: BTreeMap<(String, ManifestId), UsageCounter>,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.replaced.is_empty()
            && self.weights.is_empty()
            && self.counters.is_empty()
    }

    fn agents(&self) -> BTreeSet<&String> {
        self.created
            .iter()
            .chain(&self.replaced)
            .chain(self.weights.iter().map(|(agent, _)| agent))
            .chain(self.counters.keys().map(|(agent, _)| agent))
            .collect()
    }

    fn owns_row(&self, agent: &str) -> bool {
        self.created.contains(agent) || self.replaced.contains(agent)
    }

    fn owns_weight(&self, agent: &str, id: &ManifestId) -> bool {
        self.weights.contains(&(agent.to_string(), id.clone()))
    }

    fn owns_counter(&self, agent: &str, id: &ManifestId) -> bool {
        self.counters.contains_key(&(agent.to_string(), id.clone()))
    }

    /// Put back changes whose write failed.
    fn absorb(&mut self, other: PendingChanges) {
        self.created.extend(other.created);
        self.replaced.extend(other.replaced);
        self.weights.extend(other.weights);
        for (key, delta) in other.counters {
            add_counts(self.counters.entry(key).or_default(), &delta);
        }
    }

    /// Merge into the stored table. `rows` holds this handle's current view
    /// of every agent type the changes mention.
    fn apply(
        &self,
        stored: &mut BTreeMap<String, AgentProfile>,
        rows: &BTreeMap<String, AgentProfile>,
    ) {
        for agent in &self.created {
            if let Some(row) = rows.get(agent) {
                stored.entry(agent.clone()).or_insert_with(|| bare(row));
            }
        }
        for agent in &self.replaced {
            if let Some(row) = rows.get(agent) {
                stored.insert(agent.clone(), row.clone());
            }
        }
        for (agent, id) in &self.weights {
            if self.replaced.contains(agent) {
                continue;
            }
            let Some(row) = rows.get(agent) else { continue };
            let Some(w) = row.weights.get(id) else { continue };
            stored
                .entry(agent.clone())
                .or_insert_with(|| bare(row))
                .weights
                .insert(id.clone(), *w);
        }
        for ((agent, id), delta) in &self.counters {
            if self.replaced.contains(agent) {
                continue;
            }
            let Some(row) = rows.get(agent) else { continue };
            let counter = stored
                .entry(agent.clone())
                .or_insert_with(|| bare(row))
                .usage_counters
                .entry(id.clone())
                .or_default();
            add_counts(counter, delta);
        }
    }
}

fn add_counts(into: &mut UsageCounter, delta: &UsageCounter) {
    into.loaded += delta.loaded;
    into.used += delta.used;
    into.used_in_success += delta.used_in_success;
}

/// The row's sets and budget without any learned state.
fn bare(row: &AgentProfile) -> AgentProfile {
    AgentProfile {
        weights: BTreeMap::new(),
        usage_counters: BTreeMap::new(),
        ..row.clone()
    }
}

fn validate(stored: &BTreeMap<String, AgentProfile>) -> Result<(), CoreError> {
    for (key, profile) in stored {
        if key != &profile.agent_type {
            return Err(CoreError::StoreCorruption {
                store: "profiles".into(),
                detail: format!(
                    "row key '{key}' does not match agent_type '{}'",
                    profile.agent_type
                ),
            });
        }
        if let Some((id, w)) = profile
            .weights
            .iter()
            .find(|(_, w)| !(0.0..=1.0).contains(*w))
        {
            return Err(CoreError::StoreCorruption {
                store: "profiles".into(),
                detail: format!("weight {w} for {key}/{id} outside [0, 1]"),
            });
        }
    }
    Ok(())
}

/// Profile store persisted as a JSON profile table keyed by agent type.
///
/// Several processes may share one table. Each write re-reads the table
/// under its exclusive lock and merges in only what this handle changed:
/// rows it created or replaced, the weights it updated and its counter
/// increments. Reads pick up rows other processes wrote since the last sync.
///
/// Profile creation and `put_profile` are written through immediately;
/// weight and counter updates are buffered until [`ProfileStore::flush`].
#[derive(Debug)]
pub struct FileProfileStore {
    inner: MemoryProfileStore,
    table: JsonTable,
    pending: Mutex<PendingChanges>,
    /// Held shared while a change is applied and recorded, exclusively while
    /// changes are collected for a write or the view is refreshed.
    gate: RwLock<()>,
    write_lock: Mutex<()>,
    synced: Mutex<Option<TableStamp>>,
}

impl FileProfileStore {
    /// Load the profile table. An unreadable table is a fatal
    /// `StoreCorruption` error, never silently reset.
    pub fn open(path: impl Into<PathBuf>, defaults: ProfileDefaults) -> Result<Self, CoreError> {
        let table = JsonTable::new(path, "profiles");
        let stamp = table.stamp();
        let stored: BTreeMap<String, AgentProfile> = table.read()?;
        validate(&stored)?;
        tracing::debug!(count = stored.len(), path = %table.path().display(), "Loaded profile table");
        Ok(Self {
            inner: MemoryProfileStore::with_profiles(defaults, stored.into_values()),
            table,
            pending: Mutex::new(PendingChanges::default()),
            gate: RwLock::new(()),
            write_lock: Mutex::new(()),
            synced: Mutex::new(stamp),
        })
    }

    fn persist(&self) -> Result<(), CoreError> {
        let _serial = self.write_lock.lock();
        let (changes, rows) = {
            let _gate = self.gate.write();
            let changes = std::mem::take(&mut *self.pending.lock());
            let rows: BTreeMap<String, AgentProfile> = changes
                .agents()
                .into_iter()
                .filter_map(|agent| {
                    let rec = self.inner.profiles.get(agent.as_str())?;
                    Some((agent.clone(), rec.value().snapshot()))
                })
                .collect();
            (changes, rows)
        };
        if changes.is_empty() {
            return Ok(());
        }

        let written = self.table.update(|stored: &mut BTreeMap<String, AgentProfile>| {
            validate(stored)?;
            changes.apply(stored, &rows);
            Ok(())
        });
        match written {
            Ok((merged, stamp)) => {
                self.refresh(merged, stamp);
                Ok(())
            }
            Err(e) => {
                self.pending.lock().absorb(changes);
                Err(e)
            }
        }
    }

    /// Pick up rows other processes wrote, if the table changed since the
    /// last read or write through this handle.
    fn reload_if_changed(&self) -> Result<(), CoreError> {
        let stamp = self.table.stamp();
        if stamp.is_none() || stamp == *self.synced.lock() {
            return Ok(());
        }
        let _serial = self.write_lock.lock();
        let stored: BTreeMap<String, AgentProfile> = self.table.read()?;
        validate(&stored)?;
        tracing::debug!(count = stored.len(), "Profile table changed on disk; reloaded");
        self.refresh(stored, stamp);
        Ok(())
    }

    /// Adopt the stored rows, except for what this handle changed and has
    /// not written yet.
    fn refresh(&self, stored: BTreeMap<String, AgentProfile>, stamp: Option<TableStamp>) {
        let _gate = self.gate.write();
        let pending = self.pending.lock();
        for (agent, profile) in stored {
            if pending.owns_row(&agent) {
                continue;
            }
            let existing = self.inner.profiles.get(&agent).map(|r| Arc::clone(r.value()));
            let Some(rec) = existing else {
                self.inner
                    .profiles
                    .insert(agent, Arc::new(ProfileRecord::from_profile(profile)));
                continue;
            };
            {
                let mut sets = rec.sets.write();
                sets.essential_ids = profile.essential_ids;
                sets.optional_ids = profile.optional_ids;
                sets.excluded_ids = profile.excluded_ids;
                sets.budget_bytes = profile.budget_bytes;
            }
            for (id, w) in profile.weights {
                if !pending.owns_weight(&agent, &id) {
                    rec.weights.insert(id, w);
                }
            }
            for (id, c) in profile.usage_counters {
                if !pending.owns_counter(&agent, &id) {
                    rec.counters.insert(id, c);
                }
            }
        }
        *self.synced.lock() = stamp;
    }
}

impl ProfileStore for FileProfileStore {
    fn get_profile(&self, agent_type: &str) -> Result<AgentProfile, CoreError> {
        self.reload_if_changed()?;
        let (rec, created) = {
            let _gate = self.gate.read();
            let (rec, created) = self.inner.record(agent_type);
            if created {
                self.pending.lock().created.insert(agent_type.to_string());
            }
            (rec, created)
        };
        if created {
            self.persist()?;
        }
        Ok(rec.snapshot())
    }

    fn put_profile(&self, profile: AgentProfile) -> Result<(), CoreError> {
        {
            let _gate = self.gate.read();
            let agent_type = profile.agent_type.clone();
            self.inner.put_profile(profile)?;
            self.pending.lock().replaced.insert(agent_type);
        }
        self.persist()
    }

    fn update_weight(
        &self,
        agent_type: &str,
        manifest_id: &ManifestId,
        target: f64,
        rate: f64,
    ) -> Result<f64, CoreError> {
        let _gate = self.gate.read();
        let w = self
            .inner
            .update_weight(agent_type, manifest_id, target, rate)?;
        self.pending
            .lock()
            .weights
            .insert((agent_type.to_string(), manifest_id.clone()));
        Ok(w)
    }

    fn record_usage(
        &self,
        agent_type: &str,
        manifest_id: &ManifestId,
        used: bool,
        success: bool,
    ) -> Result<(), CoreError> {
        let _gate = self.gate.read();
        self.inner
            .record_usage(agent_type, manifest_id, used, success)?;
        let delta = UsageCounter {
            loaded: 1,
            used: u64::from(used),
            used_in_success: u64::from(used && success),
        };
        let mut pending = self.pending.lock();
        add_counts(
            pending
                .counters
                .entry((agent_type.to_string(), manifest_id.clone()))
                .or_default(),
            &delta,
        );
        Ok(())
    }

    fn list_agent_types(&self) -> Result<Vec<String>, CoreError> {
        self.reload_if_changed()?;
        self.inner.list_agent_types()
    }

    fn flush(&self) -> Result<(), CoreError> {
        if !self.pending.lock().is_empty() {
            self.persist()?;
        }
        Ok(())
    }
}
