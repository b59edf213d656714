use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tsuiseki_core::config::AppConfig;
use tsuiseki_core::models::EpisodeKey;
use tsuiseki_runtime::{Runtime, RuntimeError, SyncReport};

#[derive(Parser)]
#[command(name = "tsuiseki", about = "Offline-first episode watch tracking with Trakt sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mark an episode as watched
    Watch(EpisodeArgs),
    /// Mark an episode as not watched
    Unwatch(EpisodeArgs),
    /// Show watch progress for a show
    Status {
        show: u64,
        /// Total number of aired episodes
        #[arg(long)]
        total: u32,
    },
    /// Push pending changes to Trakt (and pull, unless disabled in config)
    Sync,
    /// Pull watched history from Trakt
    Refresh {
        /// Only merge this show
        #[arg(long)]
        show: Option<u64>,
    },
    /// Store a Trakt access token
    Login {
        #[arg(long)]
        token: String,
        /// Trakt API client id, saved to the config file
        #[arg(long)]
        client_id: Option<String>,
    },
    /// Count records waiting to be pushed
    Pending,
}

#[derive(Args)]
struct EpisodeArgs {
    show: u64,
    season: u32,
    episode: u32,
}

impl EpisodeArgs {
    fn key(&self) -> EpisodeKey {
        EpisodeKey::new(self.show, self.season, self.episode)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let configured = AppConfig::load()
            .map(|c| c.general.log_filter)
            .unwrap_or_else(|_| AppConfig::default().general.log_filter);
        EnvFilter::new(configured)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Command) -> Result<ExitCode, RuntimeError> {
    let rt = Runtime::new()?;

    match command {
        Command::Watch(args) => {
            let outcome = rt.mark_watched(args.key()).await?;
            println!("{}: {outcome:?}", args.key());
        }
        Command::Unwatch(args) => {
            let outcome = rt.mark_unwatched(args.key()).await?;
            println!("{}: {outcome:?}", args.key());
        }
        Command::Status { show, total } => {
            let progress = rt.show_progress(show, total).await?;
            println!(
                "show {show}: {}/{} watched ({:.0}%)",
                progress.watched_count,
                progress.total_count,
                progress.ratio() * 100.0
            );
        }
        Command::Sync => return Ok(print_report(&rt.sync().await?)),
        Command::Refresh { show } => return Ok(print_report(&rt.refresh(show).await?)),
        Command::Login { token, client_id } => {
            if let Some(client_id) = client_id {
                let mut config = rt.get_config().await;
                config.trakt.client_id = Some(client_id);
                rt.update_config(config).await?;
                tracing::info!("trakt client id saved to config");
            }
            rt.login(token).await?;
            println!("token saved");
        }
        Command::Pending => {
            let counts = rt.pending_counts().await?;
            println!(
                "pending add: {}, pending remove: {}, synced: {}",
                counts.pending_add, counts.pending_remove, counts.synced
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &SyncReport) -> ExitCode {
    println!(
        "added {}, removed {}, requeued {}, merged {} new / {} updated",
        report.added,
        report.removed,
        report.requeued,
        report.merged.inserted,
        report.merged.updated
    );
    match &report.error {
        None => ExitCode::SUCCESS,
        Some(err) => {
            tracing::warn!(retryable = err.is_retryable(), "sync failed: {err}");
            if err.is_retryable() {
                eprintln!("pending changes were kept and will be retried on the next sync");
            }
            ExitCode::FAILURE
        }
    }
}
