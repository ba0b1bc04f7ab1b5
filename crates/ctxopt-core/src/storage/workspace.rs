use std::fs;
use std::path::{Path, PathBuf};

use git2::Repository;

use crate::config::EngineConfig;
use crate::error::CoreError;

const STATE_DIR: &str = "ctxopt";
const PROFILES_FILE: &str = "profiles.json";
const MANIFESTS_FILE: &str = "manifests.json";
const CONTENT_DIR: &str = "content";
const USAGE_LOG_FILE: &str = "usage.jsonl";

/// Location of all persisted ctxopt state for one repository.
///
/// Holds paths rather than a `git2::Repository` because the repository
/// handle is `!Send` and the engine is shared across async tasks. Each
/// operation that needs git opens the repository fresh.
#[derive(Debug, Clone)]
pub struct Workspace {
    git_dir: PathBuf,
    workdir: PathBuf,
}

impl Workspace {
    /// Open the Git repository at the given path.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let repo = Repository::open(path)?;
        Ok(Self::from_repo(&repo))
    }

    /// Discover the Git repository from the current directory.
    pub fn discover() -> Result<Self, CoreError> {
        let repo = Repository::discover(".")?;
        Ok(Self::from_repo(&repo))
    }

    fn from_repo(repo: &Repository) -> Self {
        let git_dir = repo.path().to_path_buf();
        // Bare repositories have no working tree; resolve sources from the git dir.
        let workdir = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| git_dir.clone());
        Self { git_dir, workdir }
    }

    fn repo(&self) -> Result<Repository, CoreError> {
        Ok(Repository::open(&self.git_dir)?)
    }

    /// Check if ctxopt has been initialized in this repo.
    pub fn is_initialized(&self) -> bool {
        self.repo()
            .ok()
            .and_then(|r| r.config().ok())
            .and_then(|c| c.get_bool("ctxopt.enabled").ok())
            .unwrap_or(false)
    }

    /// Write the default config and create the state directory.
    pub fn init(&self) -> Result<(), CoreError> {
        self.init_with(&EngineConfig::default_init())
    }

    pub fn init_with(&self, config: &EngineConfig) -> Result<(), CoreError> {
        let repo = self.repo()?;
        let mut git_config = repo.config()?;
        config.save(&mut git_config)?;
        git_config.set_i32("ctxopt.version", 1)?;
        fs::create_dir_all(self.content_dir())?;
        tracing::info!(state_dir = %self.state_dir().display(), "ctxopt workspace initialized");
        Ok(())
    }

    /// Load the engine configuration from the repository's git config.
    pub fn config(&self) -> Result<EngineConfig, CoreError> {
        let repo = self.repo()?;
        let config = repo.config()?;
        EngineConfig::load(&config)
    }

    /// Persist a modified configuration.
    pub fn save_config(&self, config: &EngineConfig) -> Result<(), CoreError> {
        let repo = self.repo()?;
        let mut git_config = repo.config()?;
        config.save(&mut git_config)
    }

    /// Root against which manifest source paths are resolved.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn state_dir(&self) -> PathBuf {
        self.git_dir.join(STATE_DIR)
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.state_dir().join(PROFILES_FILE)
    }

    pub fn manifests_path(&self) -> PathBuf {
        self.state_dir().join(MANIFESTS_FILE)
    }

    pub fn content_dir(&self) -> PathBuf {
        self.state_dir().join(CONTENT_DIR)
    }

    pub fn usage_log_path(&self) -> PathBuf {
        self.state_dir().join(USAGE_LOG_FILE)
    }
}
