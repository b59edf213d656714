use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Composite identity of a watch record: one episode of one show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpisodeKey {
    pub show_id: u64,
    pub season: u32,
    pub episode: u32,
}

impl EpisodeKey {
    pub fn new(show_id: u64, season: u32, episode: u32) -> Self {
        Self {
            show_id,
            season,
            episode,
        }
    }
}

impl std::fmt::Display for EpisodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:S{:02}E{:02}", self.show_id, self.season, self.episode)
    }
}

/// Reconciliation state of a watch record against the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Watched locally, remote not yet told.
    PendingAdd,
    /// Local and remote agree the episode is watched.
    Synced,
    /// Unwatched locally, remote removal not yet confirmed.
    PendingRemove,
}

impl SyncStatus {
    /// Database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::PendingAdd => "pending_add",
            Self::Synced => "synced",
            Self::PendingRemove => "pending_remove",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending_add" => Some(Self::PendingAdd),
            "synced" => Some(Self::Synced),
            "pending_remove" => Some(Self::PendingRemove),
            _ => None,
        }
    }

    /// Whether read paths treat a record in this state as watched.
    ///
    /// `PendingRemove` is masked: the user already unmarked the episode, even
    /// though the record stays around until the remote confirms.
    pub fn counts_as_watched(&self) -> bool {
        match self {
            Self::PendingAdd | Self::Synced => true,
            Self::PendingRemove => false,
        }
    }

    pub const ALL: &[SyncStatus] = &[Self::PendingAdd, Self::Synced, Self::PendingRemove];
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::PendingAdd => "Pending add",
            Self::Synced => "Synced",
            Self::PendingRemove => "Pending remove",
        })
    }
}

/// Cross-reference identifiers for a show. Opaque to the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trakt: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvdb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmdb: Option<u64>,
}

impl ShowIds {
    pub fn is_empty(&self) -> bool {
        self.trakt.is_none()
            && self.slug.is_none()
            && self.tvdb.is_none()
            && self.imdb.is_none()
            && self.tmdb.is_none()
    }
}

/// Optional metadata recorded alongside a new watch.
#[derive(Debug, Clone, Default)]
pub struct WatchMeta {
    pub remote_episode_id: Option<u64>,
    pub show_ids: Option<ShowIds>,
}

/// Local watch intent for a single episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRecord {
    pub key: EpisodeKey,
    pub remote_episode_id: Option<u64>,
    pub show_ids: Option<ShowIds>,
    pub watched_at: DateTime<Utc>,
    pub status: SyncStatus,
    /// Local mutation clock. Diagnostics only, never used to resolve conflicts.
    pub last_modified: DateTime<Utc>,
}

impl WatchRecord {
    pub fn is_watched(&self) -> bool {
        self.status.counts_as_watched()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_db_roundtrip() {
        for status in SyncStatus::ALL {
            assert_eq!(SyncStatus::from_db_str(status.as_db_str()), Some(*status));
        }
        assert_eq!(SyncStatus::from_db_str("watching"), None);
    }

    #[test]
    fn test_masking() {
        assert!(SyncStatus::PendingAdd.counts_as_watched());
        assert!(SyncStatus::Synced.counts_as_watched());
        assert!(!SyncStatus::PendingRemove.counts_as_watched());
    }

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            EpisodeKey::new(2, 1, 1),
            EpisodeKey::new(1, 2, 1),
            EpisodeKey::new(1, 1, 10),
            EpisodeKey::new(1, 1, 2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                EpisodeKey::new(1, 1, 2),
                EpisodeKey::new(1, 1, 10),
                EpisodeKey::new(1, 2, 1),
                EpisodeKey::new(2, 1, 1),
            ]
        );
    }

    #[test]
    fn test_key_display() {
        assert_eq!(EpisodeKey::new(100, 1, 3).to_string(), "100:S01E03");
    }
}
