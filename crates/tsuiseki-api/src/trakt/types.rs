use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::TraktError;
use crate::traits::{
    EpisodeHistory, ExternalIds, HistoryAck, SeasonHistory, ShowHistory, WatchedEpisode,
    WatchedSeason, WatchedShow,
};

// ── Sync history requests ───────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct TraktHistoryRequest {
    pub shows: Vec<TraktHistoryShow>,
}

#[derive(Debug, Serialize)]
pub struct TraktHistoryShow {
    pub ids: TraktIds,
    pub seasons: Vec<TraktHistorySeason>,
}

#[derive(Debug, Serialize)]
pub struct TraktHistorySeason {
    pub number: u32,
    pub episodes: Vec<TraktHistoryEpisode>,
}

#[derive(Debug, Serialize)]
pub struct TraktHistoryEpisode {
    pub number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watched_at: Option<DateTime<Utc>>,
}

impl TraktHistoryRequest {
    pub fn from_batch(batch: &[ShowHistory]) -> Self {
        Self {
            shows: batch.iter().map(TraktHistoryShow::from_show).collect(),
        }
    }
}

impl TraktHistoryShow {
    fn from_show(show: &ShowHistory) -> Self {
        Self {
            ids: TraktIds {
                trakt: Some(show.show_id),
                ..Default::default()
            },
            seasons: show.seasons.iter().map(TraktHistorySeason::from_season).collect(),
        }
    }
}

impl TraktHistorySeason {
    fn from_season(season: &SeasonHistory) -> Self {
        Self {
            number: season.number,
            episodes: season
                .episodes
                .iter()
                .map(|e: &EpisodeHistory| TraktHistoryEpisode {
                    number: e.number,
                    watched_at: e.watched_at,
                })
                .collect(),
        }
    }
}

// ── Sync history responses ──────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TraktCounts {
    #[serde(default)]
    pub movies: u32,
    #[serde(default)]
    pub episodes: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct TraktNotFound {
    #[serde(default)]
    pub movies: Vec<serde_json::Value>,
    #[serde(default)]
    pub shows: Vec<serde_json::Value>,
    #[serde(default)]
    pub seasons: Vec<serde_json::Value>,
    #[serde(default)]
    pub episodes: Vec<serde_json::Value>,
}

impl TraktNotFound {
    fn total(&self) -> u32 {
        (self.shows.len() + self.seasons.len() + self.episodes.len()) as u32
    }
}

#[derive(Debug, Deserialize)]
pub struct TraktAddResponse {
    pub added: TraktCounts,
    #[serde(default)]
    pub not_found: TraktNotFound,
}

#[derive(Debug, Deserialize)]
pub struct TraktRemoveResponse {
    pub deleted: TraktCounts,
    #[serde(default)]
    pub not_found: TraktNotFound,
}

impl TraktAddResponse {
    pub fn into_ack(self) -> HistoryAck {
        HistoryAck {
            count: self.added.episodes,
            not_found: self.not_found.total(),
            episode_ids: Vec::new(),
        }
    }
}

impl TraktRemoveResponse {
    pub fn into_ack(self) -> HistoryAck {
        HistoryAck {
            count: self.deleted.episodes,
            not_found: self.not_found.total(),
            episode_ids: Vec::new(),
        }
    }
}

// ── Watched shows ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraktIds {
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

#[derive(Debug, Deserialize)]
pub struct TraktWatchedShow {
    pub show: TraktShow,
    #[serde(default)]
    pub seasons: Vec<TraktWatchedSeason>,
}

#[derive(Debug, Deserialize)]
pub struct TraktShow {
    pub title: Option<String>,
    pub year: Option<u32>,
    pub ids: TraktIds,
}

#[derive(Debug, Deserialize)]
pub struct TraktWatchedSeason {
    pub number: u32,
    #[serde(default)]
    pub episodes: Vec<TraktWatchedEpisode>,
}

#[derive(Debug, Deserialize)]
pub struct TraktWatchedEpisode {
    pub number: u32,
    #[serde(default)]
    pub plays: u32,
    pub last_watched_at: DateTime<Utc>,
}

impl TraktWatchedShow {
    /// Convert to the service-agnostic type. A show without a Trakt id cannot
    /// be keyed locally, so it makes the whole response malformed.
    pub fn into_watched_show(self) -> Result<WatchedShow, TraktError> {
        let show_id = self.show.ids.trakt.ok_or_else(|| {
            TraktError::Parse(format!(
                "watched show {:?} has no trakt id",
                self.show.title.as_deref().unwrap_or("<untitled>")
            ))
        })?;

        Ok(WatchedShow {
            show_id,
            ids: ExternalIds {
                trakt: self.show.ids.trakt,
                slug: self.show.ids.slug,
                tvdb: self.show.ids.tvdb,
                imdb: self.show.ids.imdb,
                tmdb: self.show.ids.tmdb,
            },
            seasons: self
                .seasons
                .into_iter()
                .map(|s| WatchedSeason {
                    number: s.number,
                    episodes: s
                        .episodes
                        .into_iter()
                        .map(|e| WatchedEpisode {
                            number: e.number,
                            last_watched_at: e.last_watched_at,
                        })
                        .collect(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_watched_shows() {
        let json = r#"[
            {
                "plays": 3,
                "last_watched_at": "2024-02-11T21:00:00.000Z",
                "last_updated_at": "2024-02-11T21:00:00.000Z",
                "show": {
                    "title": "Breaking Bad",
                    "year": 2008,
                    "ids": { "trakt": 1388, "slug": "breaking-bad", "tvdb": 81189, "imdb": "tt0903747", "tmdb": 1396 }
                },
                "seasons": [
                    {
                        "number": 1,
                        "episodes": [
                            { "number": 1, "plays": 2, "last_watched_at": "2024-02-10T20:00:00.000Z" },
                            { "number": 2, "plays": 1, "last_watched_at": "2024-02-11T21:00:00.000Z" }
                        ]
                    }
                ]
            }
        ]"#;

        let shows: Vec<TraktWatchedShow> = serde_json::from_str(json).unwrap();
        let show = shows.into_iter().next().unwrap().into_watched_show().unwrap();
        assert_eq!(show.show_id, 1388);
        assert_eq!(show.ids.slug.as_deref(), Some("breaking-bad"));
        assert_eq!(show.seasons[0].episodes.len(), 2);
        assert_eq!(
            show.seasons[0].episodes[1].last_watched_at.to_rfc3339(),
            "2024-02-11T21:00:00+00:00"
        );
    }

    #[test]
    fn test_show_without_trakt_id_is_parse_error() {
        let json = r#"{ "show": { "title": "Mystery", "ids": { "slug": "mystery" } }, "seasons": [] }"#;
        let show: TraktWatchedShow = serde_json::from_str(json).unwrap();
        assert!(matches!(show.into_watched_show(), Err(TraktError::Parse(_))));
    }

    #[test]
    fn test_add_response_into_ack() {
        let json = r#"{
            "added": { "movies": 0, "episodes": 3 },
            "not_found": { "movies": [], "shows": [], "seasons": [], "episodes": [{ "ids": { "trakt": 1 } }] }
        }"#;
        let resp: TraktAddResponse = serde_json::from_str(json).unwrap();
        let ack = resp.into_ack();
        assert_eq!(ack.count, 3);
        assert_eq!(ack.not_found, 1);
    }

    #[test]
    fn test_history_request_shape() {
        let batch = vec![ShowHistory {
            show_id: 1388,
            seasons: vec![SeasonHistory {
                number: 1,
                episodes: vec![EpisodeHistory {
                    number: 1,
                    watched_at: None,
                }],
            }],
        }];
        let value = serde_json::to_value(TraktHistoryRequest::from_batch(&batch)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "shows": [{
                    "ids": { "trakt": 1388 },
                    "seasons": [{ "number": 1, "episodes": [{ "number": 1 }] }]
                }]
            })
        );
    }
}
