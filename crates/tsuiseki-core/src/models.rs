mod progress;
mod record;

pub use progress::ShowProgress;
pub use record::{EpisodeKey, ShowIds, SyncStatus, WatchMeta, WatchRecord};
