use std::collections::BTreeMap;

use anyhow::{Context, Result};
use ctxopt_core::model::UsageEvent;

use crate::output::OutputFormat;

#[derive(Default)]
struct AgentStats {
    routings: usize,
    over_budget: usize,
    empty: usize,
    outcomes: usize,
    successes: usize,
    loaded: usize,
    used: usize,
}

pub fn run(format: OutputFormat) -> Result<()> {
    let engine = super::open_engine()?;
    let entries = engine
        .usage_log()
        .load()
        .context("Failed to read usage log")?;

    if entries.is_empty() {
        println!("No routing activity recorded.");
        return Ok(());
    }

    let mut by_agent: BTreeMap<String, AgentStats> = BTreeMap::new();
    for entry in &entries {
        let stats = by_agent.entry(entry.agent_type().to_string()).or_default();
        match &entry.event {
            UsageEvent::Routing(d) => {
                stats.routings += 1;
                stats.over_budget += usize::from(d.over_budget);
                stats.empty += usize::from(d.empty);
            }
            UsageEvent::Outcome(r) => {
                stats.outcomes += 1;
                stats.successes += usize::from(r.success);
                stats.loaded += r.manifests_loaded.len();
                stats.used += r.manifests_used.len();
            }
        }
    }

    let earliest = entries.first().map(|e| e.occurred_at);
    let latest = entries.last().map(|e| e.occurred_at);

    match format {
        OutputFormat::Json => {
            let stats = serde_json::json!({
                "total_events": entries.len(),
                "manifests": engine.manifests().len(),
                "earliest": earliest,
                "latest": latest,
                "by_agent": by_agent.iter().map(|(agent, s)| {
                    serde_json::json!({
                        "agent_type": agent,
                        "routings": s.routings,
                        "over_budget": s.over_budget,
                        "empty": s.empty,
                        "outcomes": s.outcomes,
                        "successes": s.successes,
                        "manifests_loaded": s.loaded,
                        "manifests_used": s.used,
                    })
                }).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        OutputFormat::Text => {
            println!("ctxopt Statistics");
            println!("=================");
            println!("Events:     {}", entries.len());
            println!("Manifests:  {}", engine.manifests().len());
            if let (Some(e), Some(l)) = (earliest, latest) {
                println!(
                    "Date range: {} to {}",
                    e.format("%Y-%m-%d"),
                    l.format("%Y-%m-%d")
                );
            }
            println!();

            println!("By Agent Type:");
            for (agent, s) in &by_agent {
                let hit_rate = if s.loaded == 0 {
                    0.0
                } else {
                    s.used as f64 / s.loaded as f64 * 100.0
                };
                println!(
                    "  {agent}: {} routings ({} over budget, {} empty), {}/{} successful outcomes, {hit_rate:.0}% of loaded manifests used",
                    s.routings, s.over_budget, s.empty, s.successes, s.outcomes
                );
            }
        }
    }

    Ok(())
}
