//! Trait definitions for remote watch-history services.
//!
//! The sync engine only talks to a [`HistoryService`]; the concrete Trakt
//! client implements it, and tests substitute an in-memory fake.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bearer credential supplied by the authentication provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// How a remote failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transport error, timeout, rate limit or server error. Retry later.
    Network,
    /// Credential rejected. Refresh or reacquire before retrying.
    Auth,
    /// Unparseable or unexpected response. Logged as a hard failure.
    Malformed,
}

/// Errors returned by a [`HistoryService`] must say which kind they are.
pub trait ServiceError: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> FailureKind;
}

/// A remote watch-history service.
///
/// Add and remove must be idempotent per `(show, season, episode)`: the
/// engine delivers batches at least once and may resend after a crash.
pub trait HistoryService: Send + Sync {
    type Error: ServiceError;

    /// Record the given episodes as watched.
    fn add_history(
        &self,
        credential: &Credential,
        batch: &[ShowHistory],
    ) -> impl Future<Output = Result<HistoryAck, Self::Error>> + Send;

    /// Remove the given episodes from the watch history.
    fn remove_history(
        &self,
        credential: &Credential,
        batch: &[ShowHistory],
    ) -> impl Future<Output = Result<HistoryAck, Self::Error>> + Send;

    /// Fetch the canonical set of watched episodes for the user.
    fn get_watched_shows(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<Vec<WatchedShow>, Self::Error>> + Send;
}

// ── Batch payloads ──────────────────────────────────────────────

/// Episodes of one show, grouped by season, as sent in a history batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowHistory {
    pub show_id: u64,
    pub seasons: Vec<SeasonHistory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonHistory {
    pub number: u32,
    pub episodes: Vec<EpisodeHistory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeHistory {
    pub number: u32,
    /// Sent for additions; `None` for removals.
    pub watched_at: Option<DateTime<Utc>>,
}

impl ShowHistory {
    pub fn episode_count(&self) -> usize {
        self.seasons.iter().map(|s| s.episodes.len()).sum()
    }
}

/// Remote acknowledgement of a history batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryAck {
    /// Episodes the remote reports as added or removed.
    pub count: u32,
    /// Items the remote could not resolve (unknown show or episode).
    pub not_found: u32,
    /// Remote episode ids, when the service reports them.
    pub episode_ids: Vec<RemoteEpisodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteEpisodeId {
    pub show_id: u64,
    pub season: u32,
    pub episode: u32,
    pub remote_id: u64,
}

// ── Watched snapshot ────────────────────────────────────────────

/// A show from the remote watched snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedShow {
    pub show_id: u64,
    pub ids: ExternalIds,
    pub seasons: Vec<WatchedSeason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedSeason {
    pub number: u32,
    pub episodes: Vec<WatchedEpisode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEpisode {
    pub number: u32,
    pub last_watched_at: DateTime<Utc>,
}

/// Cross-reference ids the remote reports for a show.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    pub trakt: Option<u64>,
    pub slug: Option<String>,
    pub tvdb: Option<u64>,
    pub imdb: Option<String>,
    pub tmdb: Option<u64>,
}
