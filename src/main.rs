use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use letter_scan::config::ScanConfig;
use letter_scan::infrastructure::{database, storage};
use letter_scan::services::analysis::AnalysisStatus;
use letter_scan::services::notifier::BackendNotifier;
use letter_scan::{
    AccountTier, AnalysisSynchronizer, ImageRef, IngestionService, Language, Session, SyncNotice,
    SyncSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "letter-scan", about = "Ingest letter scans and follow their analysis")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress, upload and save a scan
    Ingest {
        path: PathBuf,
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "de")]
        language: Language,
        /// Skip the free tier quota
        #[arg(long)]
        paid: bool,
        /// Wait up to this many seconds for the analysis
        #[arg(long)]
        wait: Option<u64>,
    },
    /// List an owner's scans, newest first
    List {
        #[arg(long)]
        owner: String,
    },
    /// Delete one scan
    Delete {
        #[arg(long)]
        owner: String,
        id: String,
    },
    /// Follow an owner's scans until interrupted
    Watch {
        #[arg(long)]
        owner: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "letter_scan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ScanConfig::from_env();

    let db_url = database::database_url()?;
    let db = database::setup_database(&db_url).await?;
    let store = Arc::new(database::scan_store(db, &db_url));
    let settings = SyncSettings::from(&config);

    match cli.command {
        Command::Ingest {
            path,
            owner,
            language,
            paid,
            wait,
        } => {
            let tier = if paid { AccountTier::Paid } else { AccountTier::Free };
            let session = Session::new(owner, language).with_tier(tier);
            let sync = AnalysisSynchronizer::start(session.clone(), store.clone(), settings).await;

            let storage_service = storage::setup_storage().await?;
            let mut service =
                IngestionService::new(config.clone(), storage_service, store, sync.clone());
            if let Some(url) = &config.backend_url {
                service = service.with_notifier(BackendNotifier::new(
                    url,
                    config.backend_token.clone(),
                    config.request_timeout,
                )?);
            }

            let scan = match service.ingest(&session, ImageRef::Path(path)).await {
                Ok(scan) => scan,
                Err(e) => {
                    error!("❌ {}", e);
                    sync.shutdown();
                    anyhow::bail!(e.user_message());
                }
            };
            println!("{}\t{}", scan.id, scan.image_url);

            if let Some(secs) = wait {
                wait_for_analysis(&sync, &scan.id, Duration::from_secs(secs)).await;
            }
            sync.shutdown();
        }
        Command::List { owner } => {
            let session = Session::new(owner, Language::De);
            let sync = AnalysisSynchronizer::new(session, store, settings);
            sync.refresh().await?;
            for scan in sync.snapshot().scans() {
                let status = match AnalysisStatus::of(scan) {
                    AnalysisStatus::Ready(_) => "analyzed",
                    _ => "analyzing",
                };
                println!(
                    "{}\t{}\t{}\t{}",
                    scan.id,
                    scan.created_at.to_rfc3339(),
                    scan.language,
                    status
                );
            }
        }
        Command::Delete { owner, id } => {
            let sync = AnalysisSynchronizer::new(Session::new(owner, Language::De), store, settings);
            sync.delete_scan(&id).await?;
            info!("✅ Deleted scan {}", id);
        }
        Command::Watch { owner } => {
            let sync =
                AnalysisSynchronizer::start(Session::new(owner, Language::De), store, settings)
                    .await;
            let mut notices = sync.notices();
            info!("👀 Watching {} scans", sync.snapshot().len());

            loop {
                tokio::select! {
                    _ = shutdown_signal() => break,
                    notice = notices.recv() => match notice {
                        Ok(SyncNotice::AnalysisReady { id }) => println!("analyzed\t{}", id),
                        Ok(SyncNotice::SelectionCleared { id }) => println!("removed\t{}", id),
                        Err(e) => warn!("Notice stream lagged: {}", e),
                    }
                }
            }
            sync.shutdown();
        }
    }

    Ok(())
}

async fn wait_for_analysis(sync: &AnalysisSynchronizer, id: &str, limit: Duration) {
    let mut notices = sync.notices();
    sync.select(Some(id));

    // Already analyzed scans produce no notice
    let pending = sync
        .analysis_status(id)
        .is_some_and(|status| status.is_still_analyzing());
    if pending {
        let _ = tokio::time::timeout(limit, async {
            loop {
                match notices.recv().await {
                    Ok(SyncNotice::AnalysisReady { id: ready }) if ready == id => break,
                    Ok(SyncNotice::SelectionCleared { .. }) => break,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
        .await;
    }

    match sync.analysis_status(id) {
        Some(AnalysisStatus::Ready(parsed)) => match serde_json::to_string_pretty(&parsed) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Could not render analysis: {}", e),
        },
        _ => info!("⏳ Scan {} is still being analyzed", id),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, shutting down...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, shutting down...");
        },
    }
}
