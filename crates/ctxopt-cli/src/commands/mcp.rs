use anyhow::{Context, Result};

pub fn run() -> Result<()> {
    let ws = super::workspace()?;
    let repo_path = ws.workdir().to_path_buf();

    let rt = super::runtime()?;
    rt.block_on(async {
        ctxopt_mcp::run_stdio(repo_path)
            .await
            .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))
    })
    .context("MCP server exited")
}
