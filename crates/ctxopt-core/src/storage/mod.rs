pub mod manifests;
pub mod profiles;
pub mod table;
pub mod usage_log;
pub mod workspace;

pub use manifests::ManifestTable;
pub use profiles::{FileProfileStore, MemoryProfileStore, ProfileStore};
pub use table::{JsonTable, TableStamp};
pub use usage_log::UsageLog;
pub use workspace::Workspace;
