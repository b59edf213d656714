//! Push/pull reconciliation between the local ledger and a remote history service.
//!
//! A session reads pending mutations from the ledger, sends them to the remote
//! in grouped batches, applies each confirmed batch atomically, and then merges
//! the remote's watched snapshot back without touching unpushed local intent.
//! Delivery is at-least-once: a batch confirmed remotely but not yet applied
//! locally is resent on the next session, so the remote must be idempotent.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use tsuiseki_api::traits::{Credential, FailureKind, HistoryService, ServiceError};
use tsuiseki_core::error::TsuisekiError;
use tsuiseki_core::models::{EpisodeKey, WatchRecord};
use tsuiseki_core::storage::{ConfirmStats, Confirmed, MergeStats};

use crate::batch;
use crate::db::LedgerHandle;

/// Why a sync step failed. Pending ledger state is preserved in every case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("credential rejected: {0}")]
    Auth(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("ledger error: {0}")]
    Ledger(String),
    #[error("a sync session is already running")]
    AlreadyRunning,
}

impl SyncError {
    fn from_service<E: ServiceError>(err: &E) -> Self {
        let message = err.to_string();
        match err.kind() {
            FailureKind::Network => Self::Network(message),
            FailureKind::Auth => Self::Auth(message),
            FailureKind::Malformed => Self::MalformedResponse(message),
        }
    }

    fn ledger(err: TsuisekiError) -> Self {
        Self::Ledger(err.to_string())
    }

    /// Whether retrying the same call later, unchanged, may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Ledger(_) | Self::AlreadyRunning => true,
            Self::Auth(_) | Self::MalformedResponse(_) => false,
        }
    }
}

/// Outcome of a push, a pull, or a full session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Records confirmed added (`PendingAdd` → `Synced`).
    pub added: usize,
    /// Records confirmed removed and deleted.
    pub removed: usize,
    /// Records whose intent flipped during the call, queued for the opposite call.
    pub requeued: usize,
    pub merged: MergeStats,
    /// First failure of the run; later steps still ran where independent.
    pub error: Option<SyncError>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn rejected() -> Self {
        Self {
            error: Some(SyncError::AlreadyRunning),
            ..Default::default()
        }
    }

    fn fail(&mut self, err: SyncError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn absorb(&mut self, other: SyncReport) {
        self.added += other.added;
        self.removed += other.removed;
        self.requeued += other.requeued;
        self.merged = other.merged;
        if let Some(err) = other.error {
            self.fail(err);
        }
    }
}

/// Snapshot published to status subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub in_progress: bool,
    pub last_report: Option<SyncReport>,
    pub last_success: Option<DateTime<Utc>>,
}

/// Reconciles the ledger with a remote [`HistoryService`].
///
/// The engine never schedules itself; callers invoke [`sync_pending`],
/// [`refresh_from_remote`] or [`run_session`]. Only one of these runs at a
/// time: a concurrent call is rejected with [`SyncError::AlreadyRunning`].
///
/// [`sync_pending`]: SyncEngine::sync_pending
/// [`refresh_from_remote`]: SyncEngine::refresh_from_remote
/// [`run_session`]: SyncEngine::run_session
pub struct SyncEngine<S> {
    ledger: LedgerHandle,
    service: S,
    running: AtomicBool,
    status: watch::Sender<SyncState>,
}

/// Releases the single-flight flag when dropped, including on cancellation.
struct SessionGuard<'a> {
    running: &'a AtomicBool,
    status: &'a watch::Sender<SyncState>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.status.send_modify(|s| s.in_progress = false);
    }
}

impl<S: HistoryService> SyncEngine<S> {
    pub fn new(ledger: LedgerHandle, service: S) -> Self {
        let (status, _) = watch::channel(SyncState::default());
        Self {
            ledger,
            service,
            running: AtomicBool::new(false),
            status,
        }
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to session status updates.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.status.subscribe()
    }

    /// Push pending additions and removals to the remote.
    pub async fn sync_pending(&self, credential: &Credential) -> SyncReport {
        let Some(_guard) = self.begin() else {
            return SyncReport::rejected();
        };
        let report = self.push(credential).await;
        self.finish(&report);
        report
    }

    /// Merge the remote watched snapshot into the ledger, optionally for one show.
    pub async fn refresh_from_remote(
        &self,
        credential: &Credential,
        show_filter: Option<u64>,
    ) -> SyncReport {
        let Some(_guard) = self.begin() else {
            return SyncReport::rejected();
        };
        let report = self.pull(credential, show_filter).await;
        self.finish(&report);
        report
    }

    /// Push, then pull, as one session.
    ///
    /// The pull still runs when the push failed: it never touches pending
    /// records, so it cannot undo anything the push left for retry.
    pub async fn run_session(
        &self,
        credential: &Credential,
        show_filter: Option<u64>,
    ) -> SyncReport {
        let Some(_guard) = self.begin() else {
            return SyncReport::rejected();
        };
        let mut report = self.push(credential).await;
        report.absorb(self.pull(credential, show_filter).await);
        self.finish(&report);
        report
    }

    fn begin(&self) -> Option<SessionGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sync requested while another session is running");
            return None;
        }
        self.status.send_modify(|s| s.in_progress = true);
        Some(SessionGuard {
            running: &self.running,
            status: &self.status,
        })
    }

    fn finish(&self, report: &SyncReport) {
        match &report.error {
            None => tracing::info!(
                added = report.added,
                removed = report.removed,
                requeued = report.requeued,
                inserted = report.merged.inserted,
                updated = report.merged.updated,
                "sync finished"
            ),
            Some(err) => tracing::warn!(
                added = report.added,
                removed = report.removed,
                retryable = err.is_retryable(),
                "sync finished with error: {err}"
            ),
        }

        let now = Utc::now();
        self.status.send_modify(|s| {
            s.last_report = Some(report.clone());
            if report.is_success() {
                s.last_success = Some(now);
            }
        });
    }

    // ── Push ────────────────────────────────────────────────────

    async fn push(&self, credential: &Credential) -> SyncReport {
        let mut report = SyncReport::default();

        // Both snapshots are taken before any network call.
        let adds = match self.ledger.pending_add_batch().await {
            Ok(records) => records,
            Err(e) => {
                report.fail(SyncError::ledger(e));
                return report;
            }
        };
        let removes = match self.ledger.pending_remove_batch().await {
            Ok(records) => records,
            Err(e) => {
                report.fail(SyncError::ledger(e));
                return report;
            }
        };

        if !adds.is_empty() {
            match self.push_adds(credential, &adds).await {
                Ok(stats) => {
                    report.added = stats.applied;
                    report.requeued += stats.requeued;
                }
                Err(err) => report.fail(err),
            }
        }

        if !removes.is_empty() {
            match self.push_removes(credential, &removes).await {
                Ok(stats) => {
                    report.removed = stats.applied;
                    report.requeued += stats.requeued;
                }
                Err(err) => report.fail(err),
            }
        }

        report
    }

    async fn push_adds(
        &self,
        credential: &Credential,
        records: &[WatchRecord],
    ) -> Result<ConfirmStats, SyncError> {
        let payload = batch::group_for_add(records);
        let keys = keys_of(records);
        tracing::debug!(shows = payload.len(), episodes = keys.len(), "pushing additions");

        let ack = self
            .service
            .add_history(credential, &payload)
            .await
            .map_err(|e| {
                tracing::warn!(episodes = keys.len(), "add batch failed: {e}");
                SyncError::from_service(&e)
            })?;
        if ack.not_found > 0 {
            tracing::warn!(not_found = ack.not_found, "remote could not resolve some additions");
        }

        let confirmed = Confirmed::Added {
            remote_ids: batch::remote_ids(&ack),
        };
        let stats = self
            .ledger
            .apply_sync_success(keys, confirmed)
            .await
            .map_err(SyncError::ledger)?;
        if stats.skipped > 0 {
            tracing::debug!(skipped = stats.skipped, "records changed while add was in flight");
        }
        if stats.requeued > 0 {
            tracing::info!(
                requeued = stats.requeued,
                "unwatched during add, queued for removal"
            );
        }
        Ok(stats)
    }

    async fn push_removes(
        &self,
        credential: &Credential,
        records: &[WatchRecord],
    ) -> Result<ConfirmStats, SyncError> {
        let payload = batch::group_for_remove(records);
        let keys = keys_of(records);
        tracing::debug!(shows = payload.len(), episodes = keys.len(), "pushing removals");

        let ack = self
            .service
            .remove_history(credential, &payload)
            .await
            .map_err(|e| {
                tracing::warn!(episodes = keys.len(), "remove batch failed: {e}");
                SyncError::from_service(&e)
            })?;
        if ack.not_found > 0 {
            tracing::debug!(not_found = ack.not_found, "removals already absent remotely");
        }

        let stats = self
            .ledger
            .apply_sync_success(keys, Confirmed::Removed)
            .await
            .map_err(SyncError::ledger)?;
        if stats.requeued > 0 {
            tracing::info!(
                requeued = stats.requeued,
                "re-watched during removal, queued to be added again"
            );
        }
        Ok(stats)
    }

    // ── Pull ────────────────────────────────────────────────────

    async fn pull(&self, credential: &Credential, show_filter: Option<u64>) -> SyncReport {
        let mut report = SyncReport::default();

        let shows = match self.service.get_watched_shows(credential).await {
            Ok(shows) => shows,
            Err(e) => {
                tracing::warn!("fetching watched shows failed: {e}");
                report.fail(SyncError::from_service(&e));
                return report;
            }
        };

        let entries = batch::flatten_snapshot(shows, show_filter);
        tracing::debug!(episodes = entries.len(), ?show_filter, "merging remote snapshot");

        match self.ledger.apply_remote_snapshot(entries).await {
            Ok(stats) => {
                if stats.skipped_pending > 0 {
                    tracing::debug!(
                        skipped = stats.skipped_pending,
                        "kept local pending records over remote snapshot"
                    );
                }
                report.merged = stats;
            }
            Err(e) => report.fail(SyncError::ledger(e)),
        }
        report
    }
}

fn keys_of(records: &[WatchRecord]) -> Vec<EpisodeKey> {
    records.iter().map(|r| r.key).collect()
}
