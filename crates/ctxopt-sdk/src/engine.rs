use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use ctxopt_cache::{
    CacheError, CommandGenerator, GeneratedManifest, ManifestCache, ManifestGenerator,
    NullGenerator, REGEN_GRACE,
};
use ctxopt_core::config::EngineConfig;
use ctxopt_core::model::{
    AgentProfile, ContextPackage, Manifest, ManifestId, ManifestMeta, UsageRecord,
};
use ctxopt_core::storage::{
    FileProfileStore, ManifestTable, MemoryProfileStore, ProfileStore, UsageLog, Workspace,
};
use ctxopt_core::CoreError;
use ctxopt_route::{
    ContextRouter, DistanceHint, DomainTable, FeedbackLoop, FeedbackSettings, FeedbackSummary,
    IntentAnalyzer, KeywordAnalyzer, RouteError, RoutedPackage, RouterSettings,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Generator setup failed: {0}")]
    Generator(#[from] ctxopt_cache::GenerateError),
}

impl EngineError {
    /// Whether the persisted state is unusable and the operator must step in.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Core(e) => e.is_fatal(),
            EngineError::Cache(CacheError::Core(e)) => e.is_fatal(),
            EngineError::Route(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Assembles a [`ContextEngine`] from optional collaborators.
///
/// Anything left unset falls back to what the workspace config names:
/// the configured generator command, the built-in vocabulary, no distance
/// hint.
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    generator: Option<Arc<dyn ManifestGenerator>>,
    analyzer: Option<Arc<dyn IntentAnalyzer>>,
    distance: Option<Arc<dyn DistanceHint>>,
    profiles: Option<Arc<dyn ProfileStore>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the configuration read from git config.
    pub fn config(&mut self, config: EngineConfig) -> &mut Self {
        self.config = Some(config);
        self
    }

    pub fn generator(&mut self, generator: Arc<dyn ManifestGenerator>) -> &mut Self {
        self.generator = Some(generator);
        self
    }

    pub fn analyzer(&mut self, analyzer: Arc<dyn IntentAnalyzer>) -> &mut Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Use a custom vocabulary with the keyword analyzer.
    pub fn vocabulary(&mut self, table: DomainTable) -> &mut Self {
        self.analyzer = Some(Arc::new(KeywordAnalyzer::new(table)));
        self
    }

    pub fn distance(&mut self, distance: Arc<dyn DistanceHint>) -> &mut Self {
        self.distance = Some(distance);
        self
    }

    pub fn profile_store(&mut self, profiles: Arc<dyn ProfileStore>) -> &mut Self {
        self.profiles = Some(profiles);
        self
    }

    /// Engine persisting its state under the workspace's git dir.
    pub fn open(&self, workspace: Workspace) -> Result<ContextEngine, EngineError> {
        if !workspace.is_initialized() {
            return Err(CoreError::NotInitialized.into());
        }
        let config = match &self.config {
            Some(c) => {
                c.validate()?;
                c.clone()
            }
            None => workspace.config()?,
        };

        let generator: Arc<dyn ManifestGenerator> = match (&self.generator, &config.generator) {
            (Some(g), _) => Arc::clone(g),
            (None, Some(command)) => Arc::new(
                CommandGenerator::new(command, workspace.workdir())?
                    .with_timeout(config.regen_timeout() * REGEN_GRACE),
            ),
            (None, None) => Arc::new(NullGenerator),
        };
        let table = ManifestTable::new(workspace.manifests_path(), workspace.content_dir());
        let cache = ManifestCache::with_table(
            workspace.workdir(),
            generator,
            config.regen_timeout(),
            table,
        )?;
        let profiles: Arc<dyn ProfileStore> = match &self.profiles {
            Some(p) => Arc::clone(p),
            None => Arc::new(FileProfileStore::open(
                workspace.profiles_path(),
                config.profile_defaults(),
            )?),
        };
        let log = Arc::new(UsageLog::open(workspace.usage_log_path()));

        tracing::debug!(state_dir = %workspace.state_dir().display(), "Opened context engine");
        Ok(self.assemble(Some(workspace), config, cache, profiles, log))
    }

    /// Engine keeping all state in memory; source paths resolve against `root`.
    pub fn in_memory(&self, root: &Path) -> Result<ContextEngine, EngineError> {
        let config = self.config.clone().unwrap_or_default();
        config.validate()?;
        let generator = self
            .generator
            .clone()
            .unwrap_or_else(|| Arc::new(NullGenerator) as Arc<dyn ManifestGenerator>);
        let cache = ManifestCache::new(root, generator, config.regen_timeout());
        let profiles: Arc<dyn ProfileStore> = match &self.profiles {
            Some(p) => Arc::clone(p),
            None => Arc::new(MemoryProfileStore::new(config.profile_defaults())),
        };
        let log = Arc::new(UsageLog::in_memory());
        Ok(self.assemble(None, config, cache, profiles, log))
    }

    fn assemble(
        &self,
        workspace: Option<Workspace>,
        config: EngineConfig,
        cache: ManifestCache,
        profiles: Arc<dyn ProfileStore>,
        log: Arc<UsageLog>,
    ) -> ContextEngine {
        let mut router = ContextRouter::new(
            cache.clone(),
            Arc::clone(&profiles),
            Arc::clone(&log),
            RouterSettings::from_config(&config),
        );
        if let Some(a) = &self.analyzer {
            router = router.with_analyzer(Arc::clone(a));
        }
        if let Some(d) = &self.distance {
            router = router.with_distance(Arc::clone(d));
        }
        let feedback = FeedbackLoop::new(
            Arc::clone(&profiles),
            Arc::clone(&log),
            FeedbackSettings::from_config(&config),
        );
        ContextEngine {
            workspace,
            config,
            cache,
            profiles,
            log,
            router,
            feedback,
        }
    }
}

/// The context optimization engine: route tasks, learn from outcomes,
/// keep manifests fresh.
pub struct ContextEngine {
    workspace: Option<Workspace>,
    config: EngineConfig,
    cache: ManifestCache,
    profiles: Arc<dyn ProfileStore>,
    log: Arc<UsageLog>,
    router: ContextRouter,
    feedback: FeedbackLoop,
}

impl ContextEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Open the engine for the repository at `path`.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        EngineBuilder::new().open(Workspace::open(path)?)
    }

    /// Open the engine for the repository containing the current directory.
    pub fn discover() -> Result<Self, EngineError> {
        EngineBuilder::new().open(Workspace::discover()?)
    }

    /// Build the context package for a task.
    pub async fn route(&self, task: &str, agent_type: &str) -> Result<ContextPackage, EngineError> {
        Ok(self.router.route(task, agent_type).await?)
    }

    /// Route and also return the content of every delivered manifest, as
    /// read while the package was built.
    pub async fn route_with_content(
        &self,
        task: &str,
        agent_type: &str,
    ) -> Result<RoutedPackage, EngineError> {
        Ok(self.router.route_with_content(task, agent_type).await?)
    }

    /// Report which offered manifests the agent actually used.
    pub fn record_outcome(&self, record: UsageRecord) -> Result<FeedbackSummary, EngineError> {
        Ok(self.feedback.record_outcome(record)?)
    }

    /// Source file changed: mark dependent manifests stale.
    pub fn invalidate(&self, path: &str) -> Result<Vec<ManifestId>, EngineError> {
        Ok(self.cache.invalidate(path)?)
    }

    pub fn get_profile(&self, agent_type: &str) -> Result<AgentProfile, EngineError> {
        Ok(self.profiles.get_profile(agent_type)?)
    }

    pub fn put_profile(&self, profile: AgentProfile) -> Result<(), EngineError> {
        Ok(self.profiles.put_profile(profile)?)
    }

    pub fn list_agent_types(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.profiles.list_agent_types()?)
    }

    /// Register generated manifest content directly.
    pub fn insert_manifest(
        &self,
        id: ManifestId,
        generated: GeneratedManifest,
    ) -> Result<Arc<Manifest>, EngineError> {
        Ok(self.cache.insert(id, generated)?)
    }

    pub fn manifests(&self) -> Vec<ManifestMeta> {
        self.cache.list()
    }

    /// Re-hash every manifest's sources; returns the ids found stale.
    pub fn reconcile(&self) -> Vec<ManifestId> {
        self.cache.reconcile()
    }

    /// Apply queued outcomes and write buffered profile changes.
    pub fn flush(&self) -> Result<usize, EngineError> {
        let applied = self.feedback.flush()?;
        self.profiles.flush()?;
        Ok(applied)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    pub fn usage_log(&self) -> &UsageLog {
        &self.log
    }

    pub fn cache(&self) -> &ManifestCache {
        &self.cache
    }
}

impl Drop for ContextEngine {
    fn drop(&mut self) {
        if self.feedback.pending() > 0 {
            if let Err(e) = self.flush() {
                tracing::warn!("Failed to apply queued outcomes on shutdown: {e}");
            }
        }
    }
}
