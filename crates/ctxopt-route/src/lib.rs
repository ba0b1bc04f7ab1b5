//! Task → context routing for ctxopt.
//!
//! [`ContextRouter`] scores a profile's candidate manifests against the
//! domains a task mentions and packs the best ones under the profile's byte
//! budget. [`FeedbackLoop`] feeds reported usage back into the profile's
//! learned weights.

pub mod error;
pub mod feedback;
pub mod intent;
pub mod router;
pub mod score;

pub use error::RouteError;
pub use feedback::{FeedbackLoop, FeedbackSettings, FeedbackSummary};
pub use intent::{DomainTable, DomainTerm, IntentAnalyzer, KeywordAnalyzer, TaskAnalysis};
pub use router::{ContextRouter, RoutedPackage, RouterSettings};
pub use score::{DistanceHint, NoDistance, PathDistance, ScoreBreakdown, ScoreWeights, Scorer};
