use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use rmcp::model::{ServerCapabilities, ServerInfo};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    tool, tool_handler, tool_router, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ctxopt_sdk::{ContextEngine, ContextPackage, ManifestId, UsageRecord};

/// MCP server exposing context routing to AI agents.
///
/// Holds one shared [`ContextEngine`]; every tool call goes through it, so
/// the cache and profiles stay warm for the life of the server.
#[derive(Clone)]
pub struct CtxMcpServer {
    engine: Arc<ContextEngine>,
    tool_router: ToolRouter<Self>,
}

impl std::fmt::Debug for CtxMcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtxMcpServer")
            .field("workspace", &self.engine.workspace())
            .finish()
    }
}

impl CtxMcpServer {
    pub fn new(engine: Arc<ContextEngine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }
}

// -- Tool parameter structs --

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RouteParams {
    /// Natural-language description of the task about to be run
    pub task: String,
    /// Agent type that will run it, e.g. "frontend" or "backend"
    pub agent_type: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct OutcomeParams {
    /// Task description the package was routed for
    pub task: String,
    pub agent_type: String,
    /// Manifest ids that were delivered to the agent
    pub loaded: Vec<String>,
    /// Manifest ids the agent actually referenced
    #[serde(default)]
    pub used: Vec<String>,
    /// Whether the task succeeded
    pub success: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InvalidateParams {
    /// Changed source file, relative to the repository root or absolute
    pub file_path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProfileParams {
    pub agent_type: String,
}

/// Tool response for `ctx_route`: the package plus the content it names.
#[derive(Debug, Serialize)]
struct RouteResponse<'a> {
    package: &'a ContextPackage,
    manifests: BTreeMap<ManifestId, &'a serde_json::Value>,
}

fn parse_ids(ids: &[String]) -> Result<Vec<ManifestId>, String> {
    ids.iter()
        .map(|s| ManifestId::parse(s.as_str()).map_err(|e| e.to_string()))
        .collect()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Failed to encode response: {e}"))
}

// -- Tool implementations --

#[tool_router]
impl CtxMcpServer {
    #[tool(
        description = "Get the context package for a task: the manifests most relevant to the task for this agent type, within its byte budget, with their content."
    )]
    async fn ctx_route(&self, Parameters(params): Parameters<RouteParams>) -> Result<String, String> {
        let routed = self
            .engine
            .route_with_content(&params.task, &params.agent_type)
            .await
            .map_err(|e| format!("Routing failed: {e}"))?;

        let manifests = routed
            .manifests
            .iter()
            .map(|(id, m)| (id.clone(), &m.content))
            .collect();
        to_json(&RouteResponse {
            package: &routed.package,
            manifests,
        })
    }

    #[tool(
        description = "Report which delivered manifests an agent actually used and whether the task succeeded. Future routing for the agent type learns from it."
    )]
    fn ctx_record_outcome(
        &self,
        Parameters(params): Parameters<OutcomeParams>,
    ) -> Result<String, String> {
        let record = UsageRecord::new(
            &params.task,
            &params.agent_type,
            parse_ids(&params.loaded)?,
            parse_ids(&params.used)?,
            params.success,
        );
        let summary = self
            .engine
            .record_outcome(record)
            .map_err(|e| format!("Failed to record outcome: {e}"))?;
        to_json(&summary)
    }

    #[tool(
        description = "Notify that a source file changed. Marks every manifest built from it stale and returns their ids."
    )]
    fn ctx_invalidate(
        &self,
        Parameters(params): Parameters<InvalidateParams>,
    ) -> Result<String, String> {
        let ids = self
            .engine
            .invalidate(&params.file_path)
            .map_err(|e| format!("Invalidation failed: {e}"))?;
        if ids.is_empty() {
            return Ok(format!("No manifest depends on {}", params.file_path));
        }
        let list: Vec<String> = ids.iter().map(ToString::to_string).collect();
        Ok(format!("Marked stale: {}", list.join(", ")))
    }

    #[tool(
        description = "Show the routing profile of an agent type: essential, optional and excluded manifests, budget, learned weights and usage counters."
    )]
    fn ctx_profile(&self, Parameters(params): Parameters<ProfileParams>) -> Result<String, String> {
        let profile = self
            .engine
            .get_profile(&params.agent_type)
            .map_err(|e| format!("Failed to load profile: {e}"))?;
        to_json(&profile)
    }
}

#[tool_handler]
impl ServerHandler for CtxMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "ctxopt MCP Server - Ask for task-relevant codebase context before starting \
                 work (ctx_route), then report what was used (ctx_record_outcome)."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Start the MCP server on stdio transport.
pub async fn run_stdio(repo_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    use rmcp::transport::stdio;
    use rmcp::ServiceExt;

    let engine = Arc::new(ContextEngine::open(&repo_path)?);
    let stale = engine.reconcile();
    if !stale.is_empty() {
        tracing::info!(count = stale.len(), "Manifests changed since last run");
    }

    let server = CtxMcpServer::new(engine);
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxopt_sdk::{GeneratedManifest, Workspace};
    use git2::Repository;
    use tempfile::TempDir;

    fn server() -> (TempDir, CtxMcpServer) {
        let tmp = TempDir::new().unwrap();
        Repository::init(tmp.path()).unwrap();
        Workspace::open(tmp.path()).unwrap().init().unwrap();
        let engine = ContextEngine::open(tmp.path()).unwrap();
        engine
            .insert_manifest(
                ManifestId::from("project-manifest"),
                GeneratedManifest {
                    content: serde_json::json!({ "name": "course-platform" }),
                    source_files: ["package.json".to_string()].into_iter().collect(),
                    domain_tags: Default::default(),
                },
            )
            .unwrap();
        (tmp, CtxMcpServer::new(Arc::new(engine)))
    }

    #[tokio::test]
    async fn test_route_returns_package_with_content() {
        let (_tmp, server) = server();
        let out = server
            .ctx_route(Parameters(RouteParams {
                task: "Add a login form".into(),
                agent_type: "frontend".into(),
            }))
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["package"]["entries"][0]["manifest_id"], "project-manifest");
        assert_eq!(v["manifests"]["project-manifest"]["name"], "course-platform");
        let size = serde_json::to_vec(&v["manifests"]["project-manifest"]).unwrap().len();
        assert_eq!(v["package"]["entries"][0]["size_bytes"], size as u64);
    }

    #[test]
    fn test_outcome_profile_and_invalidate() {
        let (_tmp, server) = server();
        let out = server
            .ctx_record_outcome(Parameters(OutcomeParams {
                task: "Add a login form".into(),
                agent_type: "frontend".into(),
                loaded: vec!["project-manifest".into()],
                used: vec![],
                success: true,
            }))
            .unwrap();
        let summary: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(summary["updated"]["project-manifest"].as_f64().unwrap() < 0.5);

        let profile = server
            .ctx_profile(Parameters(ProfileParams {
                agent_type: "frontend".into(),
            }))
            .unwrap();
        assert!(profile.contains("project-manifest"));

        let out = server
            .ctx_invalidate(Parameters(InvalidateParams {
                file_path: "package.json".into(),
            }))
            .unwrap();
        assert_eq!(out, "Marked stale: project-manifest");

        let err = server
            .ctx_record_outcome(Parameters(OutcomeParams {
                task: "x".into(),
                agent_type: "frontend".into(),
                loaded: vec!["bad/id".into()],
                used: vec![],
                success: true,
            }))
            .unwrap_err();
        assert!(err.contains("invalid character"));
    }
}
