use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use ctxopt_core::model::ManifestId;

use crate::error::GenerateError;

/// Output of a manifest generator before the cache hashes its sources.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GeneratedManifest {
    pub content: serde_json::Value,
    #[serde(default)]
    pub source_files: BTreeSet<String>,
    #[serde(default)]
    pub domain_tags: BTreeSet<String>,
}

/// Produces manifest content from the codebase.
///
/// Called on a blocking worker thread, so implementations may do file or
/// process IO freely.
pub trait ManifestGenerator: Send + Sync + 'static {
    fn generate(&self, id: &ManifestId) -> Result<GeneratedManifest, GenerateError>;
}

/// Generator used when none is configured: every regeneration fails, so
/// the cache serves only what was inserted or persisted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGenerator;

impl ManifestGenerator for NullGenerator {
    fn generate(&self, id: &ManifestId) -> Result<GeneratedManifest, GenerateError> {
        Err(GenerateError::Unknown(id.to_string()))
    }
}

/// Runs an external command (`ctxopt.generator`) with the manifest id as
/// its last argument and parses its stdout as a [`GeneratedManifest`].
///
/// The child is killed once it outlives the configured timeout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(command_line: &str, workdir: impl Into<PathBuf>) -> Result<Self, GenerateError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| GenerateError::Failed("generator command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            workdir: workdir.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl ManifestGenerator for CommandGenerator {
    fn generate(&self, id: &ManifestId) -> Result<GeneratedManifest, GenerateError> {
        tracing::debug!(manifest_id = %id, program = %self.program, "Running generator");
        // Own runtime: this runs on a blocking worker, never inside an async task
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let output = rt
            .block_on(async {
                let mut cmd = tokio::process::Command::new(&self.program);
                cmd.args(&self.args)
                    .arg(id.as_str())
                    .current_dir(&self.workdir)
                    .kill_on_drop(true);
                tokio::time::timeout(self.timeout, cmd.output()).await
            })
            .map_err(|_| GenerateError::TimedOut(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerateError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_generator_always_fails() {
        let err = NullGenerator.generate(&ManifestId::from("x")).unwrap_err();
        assert!(matches!(err, GenerateError::Unknown(id) if id == "x"));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandGenerator::new("   ", ".").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_generator_parses_stdout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("gen.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf '{\"content\":{\"id\":\"%s\"},\"source_files\":[\"src/a.rs\"],\"domain_tags\":[\"backend\"]}' \"$1\"\n",
        )
        .unwrap();

        let gen = CommandGenerator::new(&format!("sh {}", script.display()), tmp.path()).unwrap();
        let out = gen.generate(&ManifestId::from("api-manifest")).unwrap();
        assert_eq!(out.content, serde_json::json!({"id": "api-manifest"}));
        assert!(out.source_files.contains("src/a.rs"));
        assert!(out.domain_tags.contains("backend"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_generator_kills_child_after_timeout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 5\n").unwrap();
        let gen = CommandGenerator::new(&format!("sh {}", script.display()), tmp.path())
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = gen.generate(&ManifestId::from("x")).unwrap_err();
        assert!(matches!(err, GenerateError::TimedOut(t) if t == Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_generator_reports_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let gen = CommandGenerator::new("sh -c false", tmp.path()).unwrap();
        let err = gen.generate(&ManifestId::from("x")).unwrap_err();
        assert!(matches!(err, GenerateError::Failed(_)));
    }
}
