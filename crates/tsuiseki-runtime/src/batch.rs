//! Mapping between ledger records and the remote service's batch shapes.

use std::collections::{BTreeMap, HashMap};

use tsuiseki_api::traits::{
    EpisodeHistory, ExternalIds, HistoryAck, SeasonHistory, ShowHistory, WatchedShow,
};
use tsuiseki_core::models::{EpisodeKey, ShowIds, WatchRecord};
use tsuiseki_core::storage::RemoteEntry;

/// Group pending additions by show then season, carrying the watch time.
pub fn group_for_add(records: &[WatchRecord]) -> Vec<ShowHistory> {
    group(records, true)
}

/// Group pending removals by show then season. Removals carry no watch time.
pub fn group_for_remove(records: &[WatchRecord]) -> Vec<ShowHistory> {
    group(records, false)
}

/// Ordering is by show, season, then episode regardless of input order, so
/// the same pending set always produces the same payload.
fn group(records: &[WatchRecord], with_time: bool) -> Vec<ShowHistory> {
    let mut shows: BTreeMap<u64, BTreeMap<u32, BTreeMap<u32, EpisodeHistory>>> = BTreeMap::new();

    for record in records {
        let key = record.key;
        shows
            .entry(key.show_id)
            .or_default()
            .entry(key.season)
            .or_default()
            .insert(
                key.episode,
                EpisodeHistory {
                    number: key.episode,
                    watched_at: with_time.then_some(record.watched_at),
                },
            );
    }

    shows
        .into_iter()
        .map(|(show_id, seasons)| ShowHistory {
            show_id,
            seasons: seasons
                .into_iter()
                .map(|(number, episodes)| SeasonHistory {
                    number,
                    episodes: episodes.into_values().collect(),
                })
                .collect(),
        })
        .collect()
}

/// Remote episode ids reported in an acknowledgement, keyed for the ledger.
pub fn remote_ids(ack: &HistoryAck) -> HashMap<EpisodeKey, u64> {
    ack.episode_ids
        .iter()
        .map(|id| (EpisodeKey::new(id.show_id, id.season, id.episode), id.remote_id))
        .collect()
}

/// Flatten a watched snapshot into ledger entries, optionally for one show.
///
/// An episode listed more than once keeps its latest watch time.
pub fn flatten_snapshot(shows: Vec<WatchedShow>, show_filter: Option<u64>) -> Vec<RemoteEntry> {
    let mut entries: BTreeMap<EpisodeKey, RemoteEntry> = BTreeMap::new();

    for show in shows {
        if show_filter.is_some_and(|id| id != show.show_id) {
            continue;
        }
        let show_ids = to_show_ids(show.ids);

        for season in show.seasons {
            for episode in season.episodes {
                let key = EpisodeKey::new(show.show_id, season.number, episode.number);
                let entry = RemoteEntry {
                    key,
                    watched_at: episode.last_watched_at,
                    show_ids: show_ids.clone(),
                };
                match entries.get(&key) {
                    Some(existing) if existing.watched_at >= entry.watched_at => {}
                    _ => {
                        entries.insert(key, entry);
                    }
                }
            }
        }
    }

    entries.into_values().collect()
}

fn to_show_ids(ids: ExternalIds) -> Option<ShowIds> {
    let ids = ShowIds {
        trakt: ids.trakt,
        slug: ids.slug,
        tvdb: ids.tvdb,
        imdb: ids.imdb,
        tmdb: ids.tmdb,
    };
    (!ids.is_empty()).then_some(ids)
}
