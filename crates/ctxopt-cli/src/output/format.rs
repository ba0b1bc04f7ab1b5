use chrono::{DateTime, Utc};
use ctxopt_core::model::{UsageEvent, UsageLogEntry};
use ctxopt_sdk::{AgentProfile, ContextPackage, Layer, ManifestMeta};

use super::OutputFormat;

pub fn format_package(package: &ContextPackage, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => with_newline(serde_json::to_string_pretty(package).unwrap_or_default()),
        OutputFormat::Text => format_package_text(package),
    }
}

fn format_package_text(p: &ContextPackage) -> String {
    let mut out = format!(
        "Context package for {} (confidence {:.2})\n",
        p.agent_type, p.routing_confidence
    );
    if p.empty {
        out.push_str("  (empty: no essentials and nothing relevant)\n");
    }
    for e in &p.entries {
        let marker = match e.layer {
            Layer::Essential => "\u{25c6}",
            Layer::Extended => "+",
            Layer::Optional => "-",
        };
        let stale = if e.fresh { "" } else { " [stale]" };
        out.push_str(&format!(
            "  {marker} {:<28} {:<9} {:>7} B  score {:.3}{stale}\n",
            e.manifest_id.as_str(),
            e.layer.to_string(),
            e.size_bytes,
            e.score
        ));
    }
    out.push_str(&format!("Total: {} / {} bytes", p.total_bytes, p.budget_bytes));
    if p.over_budget {
        out.push_str(" (over budget: essentials alone exceed it)");
    }
    out.push('\n');
    if !p.unresolved_essentials.is_empty() {
        let ids: Vec<&str> = p.unresolved_essentials.iter().map(|i| i.as_str()).collect();
        out.push_str(&format!("Unresolved essentials: {}\n", ids.join(", ")));
    }
    out
}

pub fn format_manifest_list(manifests: &[ManifestMeta], fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => {
            with_newline(serde_json::to_string_pretty(manifests).unwrap_or_default())
        }
        OutputFormat::Text => format_manifest_list_text(manifests),
    }
}

fn format_manifest_list_text(manifests: &[ManifestMeta]) -> String {
    if manifests.is_empty() {
        return "No manifests found.\n".to_string();
    }

    let mut out = String::new();
    for m in manifests {
        let state = if m.stale { "stale" } else { "fresh" };
        let tags: Vec<&str> = m.domain_tags.iter().map(String::as_str).collect();
        out.push_str(&format!(
            "{:<28} {:>7} B  {state}  [{}]  {}\n",
            m.id.as_str(),
            m.size_bytes,
            tags.join(","),
            short_time(&m.updated_at)
        ));
    }
    out
}

pub fn format_profile(profile: &AgentProfile, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => with_newline(serde_json::to_string_pretty(profile).unwrap_or_default()),
        OutputFormat::Text => format_profile_text(profile),
    }
}

fn format_profile_text(p: &AgentProfile) -> String {
    let join = |ids: &std::collections::BTreeSet<ctxopt_sdk::ManifestId>| {
        if ids.is_empty() {
            "-".to_string()
        } else {
            ids.iter().map(|i| i.as_str()).collect::<Vec<_>>().join(", ")
        }
    };

    let mut out = String::new();
    out.push_str(&format!("Agent type: {}\n", p.agent_type));
    out.push_str(&format!("Budget:     {} bytes\n", p.budget_bytes));
    out.push_str(&format!("Essential:  {}\n", join(&p.essential_ids)));
    out.push_str(&format!("Optional:   {}\n", join(&p.optional_ids)));
    out.push_str(&format!("Excluded:   {}\n", join(&p.excluded_ids)));

    let mut ids: Vec<_> = p.weights.keys().chain(p.usage_counters.keys()).collect();
    ids.sort();
    ids.dedup();
    if !ids.is_empty() {
        out.push_str("\n--- Learned ---\n");
        for id in ids {
            let c = p.usage_counters.get(id).copied().unwrap_or_default();
            out.push_str(&format!(
                "  {:<28} weight {:.4}  loaded {} used {} (in success {})\n",
                id.as_str(),
                p.weight(id),
                c.loaded,
                c.used,
                c.used_in_success
            ));
        }
    }
    out
}

pub fn format_log_entries(entries: &[UsageLogEntry], fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => with_newline(serde_json::to_string_pretty(entries).unwrap_or_default()),
        OutputFormat::Text => format_log_entries_text(entries),
    }
}

fn format_log_entries_text(entries: &[UsageLogEntry]) -> String {
    if entries.is_empty() {
        return "No usage recorded.\n".to_string();
    }

    let mut out = String::new();
    for entry in entries {
        let time = short_time(&entry.occurred_at);
        let line = match &entry.event {
            UsageEvent::Routing(d) => {
                let mut flags = String::new();
                if d.over_budget {
                    flags.push_str(" over-budget");
                }
                if d.empty {
                    flags.push_str(" empty");
                }
                if d.timed_out {
                    flags.push_str(" timed-out");
                }
                format!(
                    "route   [{}] {} manifest(s), {}/{} B{flags}  \"{}\"",
                    d.agent_type,
                    d.chosen.len(),
                    d.total_bytes,
                    d.budget_bytes,
                    d.task_snippet
                )
            }
            UsageEvent::Outcome(r) => format!(
                "outcome [{}] {} used of {} loaded, {}  \"{}\"",
                r.agent_type,
                r.manifests_used.len(),
                r.manifests_loaded.len(),
                if r.success { "success" } else { "failed" },
                r.task_snippet
            ),
        };
        out.push_str(&format!("{time}  {line}\n"));
    }
    out
}

fn short_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

fn with_newline(mut s: String) -> String {
    s.push('\n');
    s
}
