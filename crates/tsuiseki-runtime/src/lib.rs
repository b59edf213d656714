mod batch;
mod db;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use tsuiseki_api::traits::Credential;
use tsuiseki_api::trakt::TraktClient;
use tsuiseki_core::config::AppConfig;
use tsuiseki_core::models::{EpisodeKey, ShowProgress, WatchMeta};
use tsuiseki_core::storage::{MarkOutcome, StatusCounts, UnmarkOutcome};

pub use db::LedgerHandle;
pub use sync::{SyncEngine, SyncError, SyncReport, SyncState};

/// Token service key for the Trakt credential in the ledger database.
pub const TRAKT_SERVICE: &str = "trakt";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("config error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("not logged in to {0}")]
    NotAuthenticated(String),
}

/// Application facade: ledger, config and sync engine wired together.
pub struct Runtime {
    ledger: LedgerHandle,
    config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
    engine: Option<Arc<SyncEngine<TraktClient>>>,
}

impl Runtime {
    pub fn new() -> Result<Self, RuntimeError> {
        let config = AppConfig::load().map_err(|e| RuntimeError::Config(e.to_string()))?;
        let db_path =
            AppConfig::ensure_db_path().map_err(|e| RuntimeError::Config(e.to_string()))?;
        let ledger =
            LedgerHandle::open(&db_path).map_err(|e| RuntimeError::Database(e.to_string()))?;
        Self::with_ledger(config, ledger)
    }

    /// Build a runtime over an already opened ledger.
    ///
    /// Sync is only available when a Trakt client id is configured.
    pub fn with_ledger(config: AppConfig, ledger: LedgerHandle) -> Result<Self, RuntimeError> {
        let engine = match config.trakt.client_id.clone() {
            Some(client_id) => {
                let client = TraktClient::new(
                    client_id,
                    &config.trakt.base_url,
                    Duration::from_secs(config.sync.request_timeout_secs),
                )
                .map_err(|e| RuntimeError::Config(e.to_string()))?;
                Some(Arc::new(SyncEngine::new(ledger.clone(), client)))
            }
            None => {
                tracing::info!("no trakt client_id configured, sync disabled");
                None
            }
        };

        Ok(Self {
            ledger,
            config: Arc::new(RwLock::new(config)),
            config_path: AppConfig::config_path(),
            engine,
        })
    }

    /// Write config updates to `path` instead of the user config file.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = path;
        self
    }

    pub async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Persist a new config. Trakt settings apply from the next start.
    pub async fn update_config(&self, new_config: AppConfig) -> Result<(), RuntimeError> {
        new_config
            .save_to(&self.config_path)
            .map_err(|e| RuntimeError::Config(e.to_string()))?;
        *self.config.write().await = new_config;
        Ok(())
    }

    pub async fn mark_watched(&self, key: EpisodeKey) -> Result<MarkOutcome, RuntimeError> {
        self.ledger
            .mark_watched(key, WatchMeta::default())
            .await
            .map_err(|e| RuntimeError::Database(e.to_string()))
    }

    pub async fn mark_unwatched(&self, key: EpisodeKey) -> Result<UnmarkOutcome, RuntimeError> {
        self.ledger
            .mark_unwatched(key)
            .await
            .map_err(|e| RuntimeError::Database(e.to_string()))
    }

    pub async fn is_watched(&self, key: EpisodeKey) -> Result<bool, RuntimeError> {
        self.ledger
            .is_watched(key)
            .await
            .map_err(|e| RuntimeError::Database(e.to_string()))
    }

    pub async fn show_progress(
        &self,
        show_id: u64,
        total_episodes: u32,
    ) -> Result<ShowProgress, RuntimeError> {
        self.ledger
            .compute_progress(show_id, total_episodes)
            .await
            .map_err(|e| RuntimeError::Database(e.to_string()))
    }

    pub async fn pending_counts(&self) -> Result<StatusCounts, RuntimeError> {
        self.ledger
            .count_by_status()
            .await
            .map_err(|e| RuntimeError::Database(e.to_string()))
    }

    /// Store the Trakt access token used for sync.
    pub async fn login(&self, token: String) -> Result<(), RuntimeError> {
        self.ledger
            .save_token(TRAKT_SERVICE, token)
            .await
            .map_err(|e| RuntimeError::Database(e.to_string()))
    }

    /// Push pending changes, then pull when `pull_after_push` is enabled.
    pub async fn sync(&self) -> Result<SyncReport, RuntimeError> {
        let engine = self.engine()?;
        let credential = self.credential().await?;

        if self.config.read().await.sync.pull_after_push {
            Ok(engine.run_session(&credential, None).await)
        } else {
            Ok(engine.sync_pending(&credential).await)
        }
    }

    /// Pull the remote snapshot, optionally for a single show.
    pub async fn refresh(&self, show_filter: Option<u64>) -> Result<SyncReport, RuntimeError> {
        let engine = self.engine()?;
        let credential = self.credential().await?;
        Ok(engine.refresh_from_remote(&credential, show_filter).await)
    }

    /// Status updates from the sync engine, if sync is configured.
    pub fn subscribe(&self) -> Option<watch::Receiver<SyncState>> {
        self.engine.as_ref().map(|engine| engine.subscribe())
    }

    fn engine(&self) -> Result<&SyncEngine<TraktClient>, RuntimeError> {
        self.engine
            .as_deref()
            .ok_or_else(|| RuntimeError::Config("trakt.client_id is not set".into()))
    }

    async fn credential(&self) -> Result<Credential, RuntimeError> {
        self.ledger
            .get_token(TRAKT_SERVICE)
            .await
            .map_err(|e| RuntimeError::Database(e.to_string()))?
            .map(Credential::new)
            .ok_or_else(|| RuntimeError::NotAuthenticated(TRAKT_SERVICE.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(client_id: Option<&str>) -> Runtime {
        let mut config = AppConfig::default();
        config.trakt.client_id = client_id.map(String::from);
        config.trakt.base_url = "http://127.0.0.1:9".into();
        Runtime::with_ledger(config, LedgerHandle::open_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_local_operations_work_without_sync() {
        let rt = runtime(None);
        let key = EpisodeKey::new(42, 1, 1);

        assert_eq!(rt.mark_watched(key).await.unwrap(), MarkOutcome::Inserted);
        assert!(rt.is_watched(key).await.unwrap());
        assert_eq!(rt.show_progress(42, 10).await.unwrap().watched_count, 1);
        assert_eq!(rt.pending_counts().await.unwrap().pending_add, 1);
        assert!(rt.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_sync_requires_client_id() {
        let rt = runtime(None);
        assert!(matches!(rt.sync().await, Err(RuntimeError::Config(_))));
    }

    #[tokio::test]
    async fn test_sync_requires_token() {
        let rt = runtime(Some("client"));
        assert!(rt.subscribe().is_some());
        assert!(matches!(
            rt.refresh(None).await,
            Err(RuntimeError::NotAuthenticated(_))
        ));

        rt.login("tok".into()).await.unwrap();
        assert_eq!(rt.credential().await.unwrap().secret(), "tok");
    }

    #[tokio::test]
    async fn test_update_config_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let rt = runtime(None).with_config_path(path.clone());

        let mut config = rt.get_config().await;
        config.trakt.client_id = Some("new-client".into());
        rt.update_config(config).await.unwrap();

        assert_eq!(
            rt.get_config().await.trakt.client_id.as_deref(),
            Some("new-client")
        );
        let saved = AppConfig::load_from(&path).unwrap();
        assert_eq!(saved.trakt.client_id.as_deref(), Some("new-client"));
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        let mut config = AppConfig::default();
        config.trakt.client_id = Some("client".into());
        config.trakt.base_url = "::not a url::".into();
        let result = Runtime::with_ledger(config, LedgerHandle::open_memory().unwrap());
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }
}
