use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use ctxopt_cache::{CachedManifest, ManifestCache};
use ctxopt_core::config::EngineConfig;
use ctxopt_core::model::{
    snippet, AgentProfile, ContextPackage, Layer, Manifest, ManifestId, PackageEntry, RouteState,
    RoutingDecision, UsageEvent,
};
use ctxopt_core::storage::{ProfileStore, UsageLog};

use crate::error::RouteError;
use crate::intent::{IntentAnalyzer, KeywordAnalyzer, TaskAnalysis};
use crate::score::{rank, DistanceHint, NoDistance, ScoreBreakdown, Scorer};

/// Thresholds and deadline applied to every routing request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterSettings {
    pub min_relevance: f64,
    pub extended_threshold: f64,
    pub route_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            min_relevance: 0.3,
            extended_threshold: 0.6,
            route_timeout: Duration::from_secs(5),
        }
    }
}

impl RouterSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            min_relevance: config.min_relevance,
            extended_threshold: config.extended_threshold,
            route_timeout: config.route_timeout(),
        }
    }
}

/// A package together with the exact manifest versions it was built from.
#[derive(Debug, Clone)]
pub struct RoutedPackage {
    pub package: ContextPackage,
    /// One entry per package entry, keyed by id.
    pub manifests: BTreeMap<ManifestId, Arc<Manifest>>,
}

/// Builds budgeted context packages for (task, agent type) requests.
pub struct ContextRouter {
    cache: ManifestCache,
    profiles: Arc<dyn ProfileStore>,
    log: Arc<UsageLog>,
    analyzer: Arc<dyn IntentAnalyzer>,
    distance: Arc<dyn DistanceHint>,
    scorer: Scorer,
    settings: RouterSettings,
}

impl ContextRouter {
    pub fn new(
        cache: ManifestCache,
        profiles: Arc<dyn ProfileStore>,
        log: Arc<UsageLog>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            cache,
            profiles,
            log,
            analyzer: Arc::new(KeywordAnalyzer::default()),
            distance: Arc::new(NoDistance),
            scorer: Scorer::default(),
            settings,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn IntentAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_distance(mut self, distance: Arc<dyn DistanceHint>) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn settings(&self) -> RouterSettings {
        self.settings
    }

    pub fn analyze(&self, task: &str) -> TaskAnalysis {
        self.analyzer.analyze(task)
    }

    /// Assemble the context package for `task` on behalf of `agent_type`.
    ///
    /// Essentials are always included whole. Optional manifests are added in
    /// rank order while they fit the profile budget. Never waits longer than
    /// the route timeout: once it passes, only already-cached content is used.
    pub async fn route(&self, task: &str, agent_type: &str) -> Result<ContextPackage, RouteError> {
        Ok(self.route_with_content(task, agent_type).await?.package)
    }

    /// Like [`route`](Self::route), also returning the manifests whose sizes
    /// and freshness the package records.
    pub async fn route_with_content(
        &self,
        task: &str,
        agent_type: &str,
    ) -> Result<RoutedPackage, RouteError> {
        let deadline = Instant::now() + self.settings.route_timeout;
        let mut timed_out = false;
        let state = RouteState::Requested;

        let profile = self.profiles.get_profile(agent_type)?;
        let state = advance(state, RouteState::ProfileResolved)?;
        let analysis = self.analyzer.analyze(task);

        let mut entries = Vec::new();
        let mut unresolved = Vec::new();
        let mut total_bytes = 0u64;
        let mut read: BTreeMap<ManifestId, Arc<Manifest>> = BTreeMap::new();

        for id in &profile.essential_ids {
            match self.fetch(id, deadline, &mut timed_out).await {
                Some(hit) => {
                    let b = self.score(&hit, &analysis, &profile);
                    total_bytes += b.size_bytes;
                    entries.push(PackageEntry {
                        manifest_id: id.clone(),
                        layer: Layer::Essential,
                        size_bytes: b.size_bytes,
                        score: b.score,
                        fresh: hit.fresh,
                    });
                    read.insert(id.clone(), hit.manifest);
                }
                None => {
                    tracing::error!(
                        agent_type,
                        manifest_id = %id,
                        "Essential manifest unavailable; delivering without it"
                    );
                    unresolved.push(id.clone());
                }
            }
        }

        let mut scored: Vec<ScoreBreakdown> = Vec::new();
        for id in profile.candidate_ids() {
            match self.fetch(&id, deadline, &mut timed_out).await {
                Some(hit) => {
                    scored.push(self.score(&hit, &analysis, &profile));
                    read.entry(id).or_insert(hit.manifest);
                }
                None => tracing::debug!(manifest_id = %id, "Candidate unavailable"),
            }
        }
        rank(&mut scored);
        let state = advance(state, RouteState::Scored)?;

        let candidate_scores: BTreeMap<ManifestId, f64> = scored
            .iter()
            .map(|b| (b.manifest_id.clone(), b.score))
            .collect();

        let budget = profile.budget_bytes;
        for b in &scored {
            if b.score < self.settings.min_relevance || b.overlap <= 0.0 {
                continue;
            }
            if total_bytes + b.size_bytes > budget {
                tracing::debug!(
                    manifest_id = %b.manifest_id,
                    size_bytes = b.size_bytes,
                    total_bytes,
                    budget_bytes = budget,
                    "Skipping candidate that does not fit"
                );
                continue;
            }
            let layer = if b.score >= self.settings.extended_threshold {
                Layer::Extended
            } else {
                Layer::Optional
            };
            total_bytes += b.size_bytes;
            entries.push(PackageEntry {
                manifest_id: b.manifest_id.clone(),
                layer,
                size_bytes: b.size_bytes,
                score: b.score,
                fresh: b.fresh,
            });
        }
        let state = advance(state, RouteState::Assembled)?;

        let over_budget = total_bytes > budget;
        let empty = entries.is_empty();
        let terminal = if empty {
            RouteState::EmptyDelivered
        } else if over_budget {
            RouteState::OverBudgetDelivered
        } else {
            RouteState::Delivered
        };
        let state = advance(state, terminal)?;

        if over_budget {
            tracing::warn!(
                agent_type,
                total_bytes,
                budget_bytes = budget,
                "Essential manifests exceed the budget"
            );
        }
        if empty {
            tracing::info!(agent_type, "No manifest relevant to task");
        }

        let package = ContextPackage {
            agent_type: agent_type.to_string(),
            entries,
            total_bytes,
            budget_bytes: budget,
            routing_confidence: analysis.peak_confidence(),
            over_budget,
            empty,
            state,
            unresolved_essentials: unresolved,
        };

        let decision = RoutingDecision {
            task_snippet: snippet(task),
            agent_type: agent_type.to_string(),
            chosen: package.manifest_ids(),
            candidate_scores,
            task_tags: analysis.domain_tags.clone(),
            routing_confidence: package.routing_confidence,
            total_bytes,
            budget_bytes: budget,
            over_budget,
            empty,
            timed_out,
        };
        if let Err(e) = self.log.append(UsageEvent::Routing(decision)) {
            tracing::warn!(agent_type, "Failed to log routing decision: {e}");
        }

        tracing::info!(
            agent_type,
            manifests = package.entries.len(),
            total_bytes,
            confidence = package.routing_confidence,
            timed_out,
            "Routed context"
        );
        read.retain(|id, _| package.entries.iter().any(|e| &e.manifest_id == id));
        Ok(RoutedPackage {
            package,
            manifests: read,
        })
    }

    fn score(
        &self,
        hit: &CachedManifest,
        analysis: &TaskAnalysis,
        profile: &AgentProfile,
    ) -> ScoreBreakdown {
        let distance = self.distance.distance(&hit.manifest);
        self.scorer
            .score(&hit.manifest, analysis, profile, distance, hit.fresh)
    }

    /// Read through the cache, bounded by what is left of the route deadline.
    async fn fetch(
        &self,
        id: &ManifestId,
        deadline: Instant,
        timed_out: &mut bool,
    ) -> Option<CachedManifest> {
        let now = Instant::now();
        if now >= deadline {
            if !*timed_out {
                tracing::warn!(
                    timeout_ms = self.settings.route_timeout.as_millis() as u64,
                    "Route deadline passed; using cached content only"
                );
            }
            *timed_out = true;
            return self.cache.peek(id);
        }
        let bound = self.cache.regen_timeout().min(deadline - now);
        self.cache.get_within(id, bound).await
    }
}

fn advance(from: RouteState, to: RouteState) -> Result<RouteState, RouteError> {
    from.advance(to)
        .ok_or(RouteError::IllegalTransition { from, to })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxopt_cache::{GeneratedManifest, NullGenerator};
    use ctxopt_core::model::ProfileDefaults;
    use ctxopt_core::storage::MemoryProfileStore;
    use tempfile::TempDir;

    const KB: u64 = 1024;

    struct Fixture {
        _tmp: TempDir,
        cache: ManifestCache,
        profiles: Arc<MemoryProfileStore>,
        log: Arc<UsageLog>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let cache = ManifestCache::new(
                tmp.path(),
                Arc::new(NullGenerator),
                Duration::from_millis(200),
            );
            Self {
                _tmp: tmp,
                cache,
                profiles: Arc::new(MemoryProfileStore::new(ProfileDefaults::default())),
                log: Arc::new(UsageLog::in_memory()),
            }
        }

        fn add(&self, id: &str, tags: &[&str], size: u64) {
            let generated = GeneratedManifest {
                content: serde_json::Value::String("x".repeat(size as usize - 2)),
                source_files: Default::default(),
                domain_tags: tags.iter().map(|t| t.to_string()).collect(),
            };
            let m = self.cache.insert(ManifestId::from(id), generated).unwrap();
            assert_eq!(m.size_bytes, size);
        }

        fn profile(&self, agent: &str, essential: &[&str], optional: &[&str], budget: u64) {
            let mut p = AgentProfile::with_defaults(agent, &ProfileDefaults::default());
            p.essential_ids = essential.iter().map(|s| ManifestId::from(*s)).collect();
            p.optional_ids = optional.iter().map(|s| ManifestId::from(*s)).collect();
            p.budget_bytes = budget;
            self.profiles.put_profile(p).unwrap();
        }

        fn router(&self) -> ContextRouter {
            ContextRouter::new(
                self.cache.clone(),
                self.profiles.clone(),
                self.log.clone(),
                RouterSettings::default(),
            )
        }

        /// Profile and manifests of the course-card example.
        fn course_card() -> Self {
            let f = Self::new();
            f.add("project-manifest", &["docs"], 2 * KB);
            f.add("component-manifest", &["frontend", "ui"], 5 * KB);
            f.add("database-manifest", &["backend", "data"], 10 * KB);
            f.profile(
                "frontend",
                &["project-manifest"],
                &["component-manifest", "database-manifest"],
                20 * KB,
            );
            f
        }
    }

    const COURSE_CARD: &str = "Create a responsive course card component";

    fn id(s: &str) -> ManifestId {
        ManifestId::from(s)
    }

    #[tokio::test]
    async fn test_course_card_package() {
        let f = Fixture::course_card();
        let pkg = f.router().route(COURSE_CARD, "frontend").await.unwrap();

        assert_eq!(
            pkg.manifest_ids(),
            vec![id("project-manifest"), id("component-manifest")]
        );
        assert!(!pkg.contains(&id("database-manifest")));
        assert_eq!(pkg.total_bytes, 7 * KB);
        assert!(!pkg.over_budget);
        assert!(!pkg.empty);
        assert_eq!(pkg.state, RouteState::Delivered);
        assert_eq!(pkg.layer_of(&id("project-manifest")), Some(Layer::Essential));
        assert_eq!(pkg.layer_of(&id("component-manifest")), Some(Layer::Extended));
        assert_eq!(pkg.routing_confidence, 1.0);
        assert!((pkg.entries[1].score - 0.825).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_routed_content_is_the_version_scored() {
        let f = Fixture::course_card();
        let routed = f
            .router()
            .route_with_content(COURSE_CARD, "frontend")
            .await
            .unwrap();
        let ids: Vec<_> = routed.manifests.keys().cloned().collect();
        assert_eq!(ids, vec![id("component-manifest"), id("project-manifest")]);
        for e in &routed.package.entries {
            assert_eq!(routed.manifests[&e.manifest_id].size_bytes, e.size_bytes);
        }

        // A later commit replaces the cached copy, not the one handed out
        f.add("component-manifest", &["frontend", "ui"], 3 * KB);
        let held = &routed.manifests[&id("component-manifest")];
        assert_eq!(held.size_bytes, 5 * KB);
        assert_eq!(f.cache.peek(&id("component-manifest")).unwrap().manifest.size_bytes, 3 * KB);
    }

    #[tokio::test]
    async fn test_empty_task_yields_essentials_only() {
        let f = Fixture::course_card();
        // Even a strongly learned manifest needs some tag overlap
        f.profiles
            .update_weight("frontend", &id("component-manifest"), 1.0, 1.0)
            .unwrap();

        let pkg = f.router().route("", "frontend").await.unwrap();
        assert_eq!(pkg.manifest_ids(), vec![id("project-manifest")]);
        assert!(!pkg.empty);
        assert_eq!(pkg.routing_confidence, 0.0);
    }

    #[tokio::test]
    async fn test_no_essentials_and_no_match_is_empty() {
        let f = Fixture::course_card();
        f.profile("frontend", &[], &["component-manifest", "database-manifest"], 20 * KB);

        let pkg = f.router().route("Refactor quarterly report wording", "frontend").await.unwrap();
        assert!(pkg.empty);
        assert_eq!(pkg.total_bytes, 0);
        assert!(pkg.entries.is_empty());
        assert_eq!(pkg.state, RouteState::EmptyDelivered);
    }

    #[tokio::test]
    async fn test_essentials_over_budget_still_delivered() {
        let f = Fixture::course_card();
        f.profile(
            "frontend",
            &["project-manifest"],
            &["component-manifest"],
            KB,
        );

        let pkg = f.router().route(COURSE_CARD, "frontend").await.unwrap();
        assert_eq!(pkg.manifest_ids(), vec![id("project-manifest")]);
        assert!(pkg.over_budget);
        assert_eq!(pkg.state, RouteState::OverBudgetDelivered);
        assert_eq!(pkg.total_bytes, 2 * KB);
    }

    #[tokio::test]
    async fn test_budget_is_respected_greedily() {
        let f = Fixture::course_card();
        f.add("ui-kit-manifest", &["ui"], 3 * KB);
        f.add("styles-manifest", &["frontend"], 4 * KB);
        f.profile(
            "frontend",
            &["project-manifest"],
            &["component-manifest", "ui-kit-manifest", "styles-manifest"],
            10 * KB,
        );

        let pkg = f.router().route(COURSE_CARD, "frontend").await.unwrap();
        // component (0.825) fits, then ui-kit (3KB) fits; styles would overflow
        assert_eq!(
            pkg.manifest_ids(),
            vec![
                id("project-manifest"),
                id("component-manifest"),
                id("ui-kit-manifest")
            ]
        );
        assert!(pkg.total_bytes <= pkg.budget_bytes);
        assert_eq!(pkg.total_bytes, 10 * KB);
        assert_eq!(pkg.layer_of(&id("ui-kit-manifest")), Some(Layer::Optional));
    }

    #[tokio::test]
    async fn test_excluded_and_unknown_ids() {
        let f = Fixture::course_card();
        let mut p = f.profiles.get_profile("frontend").unwrap();
        p.excluded_ids.insert(id("component-manifest"));
        p.essential_ids.insert(id("missing-manifest"));
        f.profiles.put_profile(p).unwrap();

        let pkg = f.router().route(COURSE_CARD, "frontend").await.unwrap();
        assert!(!pkg.contains(&id("component-manifest")));
        assert_eq!(pkg.unresolved_essentials, vec![id("missing-manifest")]);
        assert_eq!(pkg.manifest_ids(), vec![id("project-manifest")]);
    }

    #[tokio::test]
    async fn test_unseen_agent_type_gets_default_profile() {
        let f = Fixture::course_card();
        let pkg = f.router().route(COURSE_CARD, "reviewer").await.unwrap();
        assert_eq!(pkg.manifest_ids(), vec![id("project-manifest")]);
        assert_eq!(pkg.budget_bytes, 16 * KB);
        assert!(f
            .profiles
            .list_agent_types()
            .unwrap()
            .contains(&"reviewer".to_string()));
    }

    #[tokio::test]
    async fn test_routing_is_deterministic() {
        let f = Fixture::course_card();
        let router = f.router();
        let a = router.route(COURSE_CARD, "frontend").await.unwrap();
        let b = router.route(COURSE_CARD, "frontend").await.unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn test_decision_is_logged_with_all_candidates() {
        let f = Fixture::course_card();
        f.router().route(COURSE_CARD, "frontend").await.unwrap();

        let entries = f.log.load().unwrap();
        assert_eq!(entries.len(), 1);
        let UsageEvent::Routing(d) = &entries[0].event else {
            panic!("expected routing event");
        };
        assert_eq!(d.chosen.len(), 2);
        assert!(d.candidate_scores.contains_key(&id("database-manifest")));
        assert!((d.candidate_scores[&id("database-manifest")] - 0.225).abs() < 1e-9);
        assert_eq!(d.task_tags.get("frontend"), Some(&1.0));
        assert!(!d.timed_out);
    }

    #[tokio::test]
    async fn test_stale_manifest_is_served_and_marked() {
        let f = Fixture::new();
        std::fs::write(f.cache.root().join("card.tsx"), "v1").unwrap();
        let generated = GeneratedManifest {
            content: serde_json::json!({"components": ["CourseCard"]}),
            source_files: ["card.tsx".to_string()].into_iter().collect(),
            domain_tags: ["frontend".to_string(), "ui".to_string()].into_iter().collect(),
        };
        f.cache.insert(id("component-manifest"), generated).unwrap();
        f.profile("frontend", &[], &["component-manifest"], 20 * KB);
        std::fs::write(f.cache.root().join("card.tsx"), "v2").unwrap();
        f.cache.invalidate("card.tsx").unwrap();

        let pkg = f.router().route(COURSE_CARD, "frontend").await.unwrap();
        assert_eq!(pkg.entries.len(), 1);
        assert!(!pkg.entries[0].fresh);
        assert!((pkg.entries[0].score - 0.775).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_elapsed_deadline_uses_cached_content() {
        let f = Fixture::course_card();
        let router = ContextRouter::new(
            f.cache.clone(),
            f.profiles.clone(),
            f.log.clone(),
            RouterSettings {
                route_timeout: Duration::ZERO,
                ..RouterSettings::default()
            },
        );
        let pkg = router.route(COURSE_CARD, "frontend").await.unwrap();
        assert_eq!(pkg.total_bytes, 7 * KB);

        let UsageEvent::Routing(d) = &f.log.load().unwrap()[0].event else {
            panic!("expected routing event");
        };
        assert!(d.timed_out);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = EngineConfig::default_init();
        config.min_relevance = 0.4;
        config.route_timeout_ms = 750;
        let s = RouterSettings::from_config(&config);
        assert_eq!(s.min_relevance, 0.4);
        assert_eq!(s.route_timeout, Duration::from_millis(750));
    }
}
