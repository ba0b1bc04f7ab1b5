pub mod manifest;
pub mod package;
pub mod profile;
pub mod usage;

pub use manifest::{content_size, Manifest, ManifestId, ManifestMeta};
pub use package::{ContextPackage, Layer, PackageEntry, RouteState};
pub use profile::{ema_update, AgentProfile, ProfileDefaults, UsageCounter, NEUTRAL_WEIGHT};
pub use usage::{snippet, RoutingDecision, UsageEvent, UsageLogEntry, UsageRecord};
