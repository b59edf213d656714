use std::path::Path;

use tokio::sync::{mpsc, oneshot};

use tsuiseki_core::error::TsuisekiError;
use tsuiseki_core::models::{EpisodeKey, ShowProgress, WatchMeta, WatchRecord};
use tsuiseki_core::progress;
use tsuiseki_core::storage::{
    ConfirmStats, Confirmed, Ledger, MarkOutcome, MergeStats, RemoteEntry, StatusCounts,
    UnmarkOutcome,
};

type Reply<T> = oneshot::Sender<Result<T, TsuisekiError>>;

/// Cloneable handle to the ledger actor.
///
/// The ledger lives on its own thread and processes one command at a time,
/// so every mutation of every key is serialized without holding locks across
/// network calls.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::UnboundedSender<LedgerCommand>,
}

enum LedgerCommand {
    MarkWatched {
        key: EpisodeKey,
        meta: WatchMeta,
        reply: Reply<MarkOutcome>,
    },
    MarkUnwatched {
        key: EpisodeKey,
        reply: Reply<UnmarkOutcome>,
    },
    IsWatched {
        key: EpisodeKey,
        reply: Reply<bool>,
    },
    GetRecord {
        key: EpisodeKey,
        reply: Reply<Option<WatchRecord>>,
    },
    RecordsForShow {
        show_id: u64,
        reply: Reply<Vec<WatchRecord>>,
    },
    ComputeProgress {
        show_id: u64,
        total_episodes: u32,
        reply: Reply<ShowProgress>,
    },
    PendingAddBatch {
        reply: Reply<Vec<WatchRecord>>,
    },
    PendingRemoveBatch {
        reply: Reply<Vec<WatchRecord>>,
    },
    CountByStatus {
        reply: Reply<StatusCounts>,
    },
    ApplySyncSuccess {
        keys: Vec<EpisodeKey>,
        confirmed: Confirmed,
        reply: Reply<ConfirmStats>,
    },
    ApplyRemoteSnapshot {
        entries: Vec<RemoteEntry>,
        reply: Reply<MergeStats>,
    },
    SaveToken {
        service: String,
        token: String,
        reply: Reply<()>,
    },
    GetToken {
        service: String,
        reply: Reply<Option<String>>,
    },
}

impl LedgerHandle {
    /// Open the ledger database at `path` and start the actor thread.
    pub fn open(path: &Path) -> Result<Self, TsuisekiError> {
        let ledger = Ledger::open(path).inspect_err(|e| {
            tracing::error!("Failed to open ledger: {e}");
        })?;
        Self::spawn(ledger)
    }

    /// Start an actor over an in-memory ledger (for tests).
    pub fn open_memory() -> Result<Self, TsuisekiError> {
        Self::spawn(Ledger::open_memory()?)
    }

    fn spawn(ledger: Ledger) -> Result<Self, TsuisekiError> {
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("ledger-actor".into())
            .spawn(move || actor_loop(ledger, rx))
            .inspect_err(|e| tracing::error!("Failed to spawn ledger thread: {e}"))?;

        Ok(Self { tx })
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> LedgerCommand,
    ) -> Result<T, TsuisekiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| TsuisekiError::LedgerClosed)?;
        rx.await.unwrap_or(Err(TsuisekiError::LedgerClosed))
    }

    pub async fn mark_watched(
        &self,
        key: EpisodeKey,
        meta: WatchMeta,
    ) -> Result<MarkOutcome, TsuisekiError> {
        self.call(|reply| LedgerCommand::MarkWatched { key, meta, reply })
            .await
    }

    pub async fn mark_unwatched(&self, key: EpisodeKey) -> Result<UnmarkOutcome, TsuisekiError> {
        self.call(|reply| LedgerCommand::MarkUnwatched { key, reply })
            .await
    }

    pub async fn is_watched(&self, key: EpisodeKey) -> Result<bool, TsuisekiError> {
        self.call(|reply| LedgerCommand::IsWatched { key, reply })
            .await
    }

    pub async fn get_record(&self, key: EpisodeKey) -> Result<Option<WatchRecord>, TsuisekiError> {
        self.call(|reply| LedgerCommand::GetRecord { key, reply })
            .await
    }

    pub async fn records_for_show(&self, show_id: u64) -> Result<Vec<WatchRecord>, TsuisekiError> {
        self.call(|reply| LedgerCommand::RecordsForShow { show_id, reply })
            .await
    }

    pub async fn compute_progress(
        &self,
        show_id: u64,
        total_episodes: u32,
    ) -> Result<ShowProgress, TsuisekiError> {
        self.call(|reply| LedgerCommand::ComputeProgress {
            show_id,
            total_episodes,
            reply,
        })
        .await
    }

    pub async fn pending_add_batch(&self) -> Result<Vec<WatchRecord>, TsuisekiError> {
        self.call(|reply| LedgerCommand::PendingAddBatch { reply })
            .await
    }

    pub async fn pending_remove_batch(&self) -> Result<Vec<WatchRecord>, TsuisekiError> {
        self.call(|reply| LedgerCommand::PendingRemoveBatch { reply })
            .await
    }

    pub async fn count_by_status(&self) -> Result<StatusCounts, TsuisekiError> {
        self.call(|reply| LedgerCommand::CountByStatus { reply })
            .await
    }

    pub(crate) async fn apply_sync_success(
        &self,
        keys: Vec<EpisodeKey>,
        confirmed: Confirmed,
    ) -> Result<ConfirmStats, TsuisekiError> {
        self.call(|reply| LedgerCommand::ApplySyncSuccess {
            keys,
            confirmed,
            reply,
        })
        .await
    }

    pub(crate) async fn apply_remote_snapshot(
        &self,
        entries: Vec<RemoteEntry>,
    ) -> Result<MergeStats, TsuisekiError> {
        self.call(|reply| LedgerCommand::ApplyRemoteSnapshot { entries, reply })
            .await
    }

    pub async fn save_token(
        &self,
        service: impl Into<String>,
        token: String,
    ) -> Result<(), TsuisekiError> {
        let service = service.into();
        self.call(|reply| LedgerCommand::SaveToken {
            service,
            token,
            reply,
        })
        .await
    }

    pub async fn get_token(
        &self,
        service: impl Into<String>,
    ) -> Result<Option<String>, TsuisekiError> {
        let service = service.into();
        self.call(|reply| LedgerCommand::GetToken { service, reply })
            .await
    }
}

fn actor_loop(ledger: Ledger, mut rx: mpsc::UnboundedReceiver<LedgerCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            LedgerCommand::MarkWatched { key, meta, reply } => {
                let _ = reply.send(ledger.mark_watched(key, &meta));
            }
            LedgerCommand::MarkUnwatched { key, reply } => {
                let _ = reply.send(ledger.mark_unwatched(key));
            }
            LedgerCommand::IsWatched { key, reply } => {
                let _ = reply.send(ledger.is_watched(key));
            }
            LedgerCommand::GetRecord { key, reply } => {
                let _ = reply.send(ledger.get_record(key));
            }
            LedgerCommand::RecordsForShow { show_id, reply } => {
                let _ = reply.send(ledger.records_for_show(show_id));
            }
            LedgerCommand::ComputeProgress {
                show_id,
                total_episodes,
                reply,
            } => {
                let _ = reply.send(progress::compute_progress(&ledger, show_id, total_episodes));
            }
            LedgerCommand::PendingAddBatch { reply } => {
                let _ = reply.send(ledger.pending_add_batch());
            }
            LedgerCommand::PendingRemoveBatch { reply } => {
                let _ = reply.send(ledger.pending_remove_batch());
            }
            LedgerCommand::CountByStatus { reply } => {
                let _ = reply.send(ledger.count_by_status());
            }
            LedgerCommand::ApplySyncSuccess {
                keys,
                confirmed,
                reply,
            } => {
                let result = ledger.apply_sync_success(&keys, &confirmed);
                if let Err(e) = &result {
                    tracing::error!("Failed to apply confirmed batch: {e}");
                }
                let _ = reply.send(result);
            }
            LedgerCommand::ApplyRemoteSnapshot { entries, reply } => {
                let result = ledger.apply_remote_snapshot(&entries);
                if let Err(e) = &result {
                    tracing::error!("Failed to merge remote snapshot: {e}");
                }
                let _ = reply.send(result);
            }
            LedgerCommand::SaveToken {
                service,
                token,
                reply,
            } => {
                let _ = reply.send(ledger.save_token(&service, &token));
            }
            LedgerCommand::GetToken { service, reply } => {
                let _ = reply.send(ledger.get_token(&service));
            }
        }
    }
    tracing::debug!("ledger actor stopped");
}
