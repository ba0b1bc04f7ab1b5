use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RouteError;

/// Sum of matched term weights at which a domain reaches full confidence.
pub const DEFAULT_SATURATION: f64 = 2.0;

/// Domain tags inferred from a task description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskAnalysis {
    pub description: String,
    /// Domain → confidence in `(0, 1]`. Domains with no match are absent.
    pub domain_tags: BTreeMap<String, f64>,
}

impl TaskAnalysis {
    pub fn confidence(&self, tag: &str) -> f64 {
        self.domain_tags.get(tag).copied().unwrap_or(0.0)
    }

    pub fn total_confidence(&self) -> f64 {
        self.domain_tags.values().sum()
    }

    /// Highest per-domain confidence, 0 when nothing matched.
    pub fn peak_confidence(&self) -> f64 {
        self.domain_tags.values().copied().fold(0.0, f64::max)
    }

    pub fn is_empty(&self) -> bool {
        self.domain_tags.is_empty()
    }
}

/// Turns a free-text task description into weighted domain tags.
pub trait IntentAnalyzer: Send + Sync {
    fn analyze(&self, description: &str) -> TaskAnalysis;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainTerm {
    /// A word or multi-word phrase, matched case-insensitively.
    pub term: String,
    /// Specificity; generic words carry less than precise ones.
    #[serde(default = "default_term_weight")]
    pub weight: f64,
}

fn default_term_weight() -> f64 {
    1.0
}

fn default_saturation() -> f64 {
    DEFAULT_SATURATION
}

/// Domain → vocabulary table driving [`KeywordAnalyzer`].
///
/// ```json
/// { "saturation": 2.0,
///   "domains": { "frontend": [ { "term": "component", "weight": 1.0 } ] } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainTable {
    #[serde(default = "default_saturation")]
    pub saturation: f64,
    pub domains: BTreeMap<String, Vec<DomainTerm>>,
}

const BUILTIN: &[(&str, &[(&str, f64)])] = &[
    (
        "frontend",
        &[
            ("frontend", 1.0),
            ("front end", 1.0),
            ("component", 1.0),
            ("responsive", 1.0),
            ("react", 1.0),
            ("vue", 1.0),
            ("svelte", 1.0),
            ("css", 1.0),
            ("tsx", 1.0),
            ("jsx", 1.0),
            ("html", 0.8),
            ("browser", 0.5),
            ("page", 0.5),
            ("client", 0.5),
        ],
    ),
    (
        "ui",
        &[
            ("ui", 1.0),
            ("user interface", 1.0),
            ("card", 1.0),
            ("button", 1.0),
            ("modal", 1.0),
            ("layout", 1.0),
            ("navbar", 1.0),
            ("dropdown", 1.0),
            ("responsive", 1.0),
            ("form", 0.8),
            ("theme", 0.8),
            ("icon", 0.8),
            ("design", 0.5),
        ],
    ),
    (
        "backend",
        &[
            ("backend", 1.0),
            ("back end", 1.0),
            ("server", 1.0),
            ("middleware", 1.0),
            ("controller", 1.0),
            ("endpoint", 1.0),
            ("handler", 0.8),
            ("queue", 0.8),
            ("service", 0.5),
            ("worker", 0.5),
        ],
    ),
    (
        "api",
        &[
            ("api", 1.0),
            ("rest", 1.0),
            ("graphql", 1.0),
            ("endpoint", 1.0),
            ("webhook", 1.0),
            ("http", 0.8),
            ("route", 0.8),
            ("request", 0.5),
            ("response", 0.5),
        ],
    ),
    (
        "data",
        &[
            ("database", 1.0),
            ("db", 1.0),
            ("sql", 1.0),
            ("schema", 1.0),
            ("migration", 1.0),
            ("orm", 1.0),
            ("postgres", 1.0),
            ("query", 0.8),
            ("table", 0.8),
            ("data", 0.5),
            ("model", 0.5),
        ],
    ),
    (
        "security",
        &[
            ("security", 1.0),
            ("auth", 1.0),
            ("authentication", 1.0),
            ("authorization", 1.0),
            ("login", 1.0),
            ("password", 1.0),
            ("permission", 1.0),
            ("encryption", 1.0),
            ("vulnerability", 1.0),
            ("csrf", 1.0),
            ("xss", 1.0),
            ("token", 0.8),
        ],
    ),
    (
        "testing",
        &[
            ("test", 1.0),
            ("testing", 1.0),
            ("unit test", 1.0),
            ("e2e", 1.0),
            ("coverage", 1.0),
            ("mock", 1.0),
            ("fixture", 1.0),
            ("assert", 0.8),
        ],
    ),
    (
        "devops",
        &[
            ("deploy", 1.0),
            ("deployment", 1.0),
            ("docker", 1.0),
            ("kubernetes", 1.0),
            ("ci", 1.0),
            ("pipeline", 1.0),
            ("terraform", 1.0),
            ("infrastructure", 1.0),
            ("monitoring", 0.8),
            ("release", 0.8),
            ("build", 0.5),
        ],
    ),
    (
        "docs",
        &[
            ("docs", 1.0),
            ("documentation", 1.0),
            ("readme", 1.0),
            ("tutorial", 1.0),
            ("changelog", 1.0),
            ("guide", 0.8),
            ("comment", 0.5),
        ],
    ),
];

impl DomainTable {
    /// Vocabulary shipped with the engine.
    pub fn builtin() -> Self {
        let domains = BUILTIN
            .iter()
            .map(|(domain, terms)| {
                let terms = terms
                    .iter()
                    .map(|(term, weight)| DomainTerm {
                        term: term.to_string(),
                        weight: *weight,
                    })
                    .collect();
                (domain.to_string(), terms)
            })
            .collect();
        Self {
            saturation: DEFAULT_SATURATION,
            domains,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, RouteError> {
        let table: Self = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, RouteError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Merge `other` into this table. Terms already present take the
    /// incoming weight; `other.saturation` wins.
    pub fn extend(&mut self, other: DomainTable) {
        self.saturation = other.saturation;
        for (domain, terms) in other.domains {
            let existing = self.domains.entry(domain).or_default();
            for term in terms {
                let key = normalize(&term.term);
                match existing.iter_mut().find(|t| normalize(&t.term) == key) {
                    Some(t) => t.weight = term.weight,
                    None => existing.push(term),
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), RouteError> {
        if !(self.saturation.is_finite() && self.saturation > 0.0) {
            return Err(RouteError::Vocabulary(format!(
                "saturation must be positive, got {}",
                self.saturation
            )));
        }
        for (domain, terms) in &self.domains {
            if domain.trim().is_empty() {
                return Err(RouteError::Vocabulary("empty domain name".into()));
            }
            for t in terms {
                if normalize(&t.term).is_empty() {
                    return Err(RouteError::Vocabulary(format!(
                        "domain '{domain}' has an empty term"
                    )));
                }
                if !(t.weight.is_finite() && t.weight >= 0.0) {
                    return Err(RouteError::Vocabulary(format!(
                        "term '{}' in '{domain}' has invalid weight {}",
                        t.term, t.weight
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for DomainTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Lowercase alphanumeric words separated by single spaces.
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Scores domains by the distinct vocabulary terms a description contains.
#[derive(Debug, Clone, Default)]
pub struct KeywordAnalyzer {
    table: DomainTable,
}

impl KeywordAnalyzer {
    pub fn new(table: DomainTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &DomainTable {
        &self.table
    }
}

struct Tokens {
    words: BTreeSet<String>,
    padded: String,
}

impl Tokens {
    fn new(description: &str) -> Self {
        let normalized = normalize(description);
        Self {
            words: normalized.split(' ').map(str::to_string).collect(),
            padded: format!(" {normalized} "),
        }
    }

    /// Whole-word match; a trailing plural `s`/`es` is tolerated.
    fn contains(&self, term: &str) -> bool {
        if term.contains(' ') {
            return self.padded.contains(&format!(" {term} "))
                || self.padded.contains(&format!(" {term}s "))
                || self.padded.contains(&format!(" {term}es "));
        }
        self.words.contains(term)
            || self.words.contains(&format!("{term}s"))
            || self.words.contains(&format!("{term}es"))
    }
}

impl IntentAnalyzer for KeywordAnalyzer {
    fn analyze(&self, description: &str) -> TaskAnalysis {
        let tokens = Tokens::new(description);
        let mut domain_tags = BTreeMap::new();

        for (domain, terms) in &self.table.domains {
            let mut seen = BTreeSet::new();
            let mut sum = 0.0;
            for t in terms {
                let key = normalize(&t.term);
                if key.is_empty() || !seen.insert(key.clone()) {
                    continue;
                }
                if tokens.contains(&key) {
                    sum += t.weight;
                }
            }
            let confidence = (sum / self.table.saturation).min(1.0);
            if confidence > 0.0 {
                domain_tags.insert(domain.clone(), confidence);
            }
        }

        tracing::debug!(tags = ?domain_tags, "Analyzed task");
        TaskAnalysis {
            description: description.to_string(),
            domain_tags,
        }
    }
}
