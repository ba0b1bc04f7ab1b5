use serde::{Deserialize, Serialize};

use super::manifest::ManifestId;

/// Which tier of the package a manifest was placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Essential,
    Extended,
    Optional,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Layer::Essential => "essential",
            Layer::Extended => "extended",
            Layer::Optional => "optional",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single routing request.
///
/// ```text
/// Requested -> ProfileResolved -> Scored -> Assembled -> Delivered
///                                                     -> OverBudgetDelivered
///                                                     -> EmptyDelivered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Requested,
    ProfileResolved,
    Scored,
    Assembled,
    Delivered,
    OverBudgetDelivered,
    EmptyDelivered,
}

impl RouteState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RouteState::Delivered | RouteState::OverBudgetDelivered | RouteState::EmptyDelivered
        )
    }

    /// Move to `next`, or `None` if the transition is not part of the lifecycle.
    pub fn advance(self, next: RouteState) -> Option<RouteState> {
        use RouteState::*;
        let ok = matches!(
            (self, next),
            (Requested, ProfileResolved)
                | (ProfileResolved, Scored)
                | (Scored, Assembled)
                | (Assembled, Delivered)
                | (Assembled, OverBudgetDelivered)
                | (Assembled, EmptyDelivered)
        );
        ok.then_some(next)
    }
}

/// One manifest placed in a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub manifest_id: ManifestId,
    pub layer: Layer,
    pub size_bytes: u64,
    /// Composite relevance score; essentials are scored for reporting only.
    pub score: f64,
    /// False when the cached copy is known to be behind its sources.
    pub fresh: bool,
}

/// The budgeted context assembled for one task/agent request.
///
/// Holds no timestamps or request ids: two routings against unchanged state
/// serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPackage {
    pub agent_type: String,
    pub entries: Vec<PackageEntry>,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub routing_confidence: f64,
    pub over_budget: bool,
    pub empty: bool,
    pub state: RouteState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_essentials: Vec<ManifestId>,
}

impl ContextPackage {
    pub fn manifest_ids(&self) -> Vec<ManifestId> {
        self.entries.iter().map(|e| e.manifest_id.clone()).collect()
    }

    pub fn contains(&self, id: &ManifestId) -> bool {
        self.entries.iter().any(|e| &e.manifest_id == id)
    }

    pub fn layer_of(&self, id: &ManifestId) -> Option<Layer> {
        self.entries
            .iter()
            .find(|e| &e.manifest_id == id)
            .map(|e| e.layer)
    }
}
