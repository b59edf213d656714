//! Per-show watch progress derived from the ledger.

use crate::error::TsuisekiError;
use crate::models::{ShowProgress, WatchRecord};
use crate::storage::Ledger;

/// Compute progress for a show from the current ledger contents.
pub fn compute_progress(
    ledger: &Ledger,
    show_id: u64,
    total_episodes: u32,
) -> Result<ShowProgress, TsuisekiError> {
    let records = ledger.records_for_show(show_id)?;
    Ok(progress_from_records(show_id, &records, total_episodes))
}

/// Count watched records for `show_id`, applying the same masking rule as
/// [`Ledger::is_watched`].
///
/// The count is clamped to `total_episodes`: episode totals for an airing
/// show can lag behind what the user has already watched.
pub fn progress_from_records(
    show_id: u64,
    records: &[WatchRecord],
    total_episodes: u32,
) -> ShowProgress {
    let watched = records
        .iter()
        .filter(|r| r.key.show_id == show_id && r.is_watched())
        .count();
    let watched = u32::try_from(watched).unwrap_or(u32::MAX);

    ShowProgress {
        show_id,
        watched_count: watched.min(total_episodes),
        total_count: total_episodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EpisodeKey, WatchMeta};
    use crate::storage::Confirmed;

    fn watch(db: &Ledger, show: u64, episode: u32) {
        db.mark_watched(EpisodeKey::new(show, 1, episode), &WatchMeta::default())
            .unwrap();
    }

    #[test]
    fn test_counts_pending_and_synced() {
        let db = Ledger::open_memory().unwrap();
        watch(&db, 100, 1);
        watch(&db, 100, 2);
        watch(&db, 100, 3);
        db.apply_sync_success(
            &[EpisodeKey::new(100, 1, 1)],
            &Confirmed::Added {
                remote_ids: Default::default(),
            },
        )
        .unwrap();
        watch(&db, 999, 1);

        let progress = compute_progress(&db, 100, 12).unwrap();
        assert_eq!(progress.watched_count, 3);
        assert_eq!(progress.total_count, 12);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_pending_remove_is_masked() {
        let db = Ledger::open_memory().unwrap();
        let k = EpisodeKey::new(100, 1, 1);
        watch(&db, 100, 1);
        watch(&db, 100, 2);
        db.apply_sync_success(
            &[k],
            &Confirmed::Added {
                remote_ids: Default::default(),
            },
        )
        .unwrap();
        db.mark_unwatched(k).unwrap();

        let progress = compute_progress(&db, 100, 12).unwrap();
        assert_eq!(progress.watched_count, 1);
    }

    #[test]
    fn test_clamped_to_stale_total() {
        let db = Ledger::open_memory().unwrap();
        for ep in 1..=5 {
            watch(&db, 100, ep);
        }

        let progress = compute_progress(&db, 100, 3).unwrap();
        assert_eq!(progress.watched_count, 3);
        assert!(progress.is_complete());

        let unknown = compute_progress(&db, 100, 0).unwrap();
        assert_eq!(unknown.watched_count, 0);
        assert_eq!(unknown.ratio(), 0.0);
    }

    #[test]
    fn test_empty_show() {
        let db = Ledger::open_memory().unwrap();
        let progress = compute_progress(&db, 42, 10).unwrap();
        assert_eq!(progress.watched_count, 0);
        assert_eq!(progress.ratio(), 0.0);
    }
}
