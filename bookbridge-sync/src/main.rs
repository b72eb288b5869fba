//! BookBridge reading-progress synchronization bridge
//!
//! Composition root: reads settings once, builds every component, spawns
//! the trigger workers and job manager, and serves the two HTTP surfaces.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bookbridge_common::config::{resolve_data_dir, PollMode, Settings};
use bookbridge_common::db::{self, ProgressStore};
use bookbridge_common::events::EventBus;

use bookbridge_sync::align::AlignmentStore;
use bookbridge_sync::api;
use bookbridge_sync::clients::abs::{AbsClient, AbsSyncClient};
use bookbridge_sync::clients::booklore::BookloreSyncClient;
use bookbridge_sync::clients::hardcover::HardcoverSyncClient;
use bookbridge_sync::clients::kosync::KosyncSyncClient;
use bookbridge_sync::clients::storyteller::StorytellerSyncClient;
use bookbridge_sync::clients::{ClientName, SyncClient};
use bookbridge_sync::ebook::epub::ZipEpubParser;
use bookbridge_sync::ebook::EbookCache;
use bookbridge_sync::engine::election::DeltaPolicy;
use bookbridge_sync::engine::SyncEngine;
use bookbridge_sync::jobs::{JobConfig, JobManager};
use bookbridge_sync::state::AppState;
use bookbridge_sync::suggest::SuggestionScanner;
use bookbridge_sync::suppress::WriteTracker;
use bookbridge_sync::transcript::{RemoteTranscriber, TranscriptStore};
use bookbridge_sync::translate::Translator;
use bookbridge_sync::triggers::listener::AbsEventListener;
use bookbridge_sync::triggers::poller::spawn_pollers;
use bookbridge_sync::triggers::tick::GlobalTick;
use bookbridge_sync::triggers::SyncDispatcher;

/// BookBridge reading-progress sync bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data folder path (overrides environment variable and config file)
    #[arg(short, long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Admin API port (overrides PRIMARY_PORT)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// KoSync server port (overrides KOSYNC_PORT)
    #[arg(long, value_name = "PORT")]
    kosync_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("bookbridge_sync={log_level},bookbridge_common={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("BookBridge starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let data_dir = resolve_data_dir(
        args.data_dir.as_deref().and_then(|p| p.to_str()),
        args.config.as_ref(),
    )?;
    std::fs::create_dir_all(&data_dir)?;
    info!("Data folder: {}", data_dir.display());

    let db_path = data_dir.join("bookbridge.db");
    let pool = db::init_database(&db_path).await?;
    let store = ProgressStore::new(pool.clone());

    let mut settings = Settings::from_env(data_dir.clone());
    settings.apply_store_overrides(&pool).await?;
    if let Some(port) = args.port {
        settings.primary_port = port;
    }
    if let Some(port) = args.kosync_port {
        settings.kosync_port = port;
    }
    let settings = Arc::new(settings);

    // Shared infrastructure
    let events = EventBus::new(256);
    let suppressor = Arc::new(WriteTracker::new(settings.write_suppress_ttl));
    let ebooks = Arc::new(EbookCache::new(
        Arc::new(ZipEpubParser),
        settings.books_dir.clone(),
        settings.epub_cache_dir(),
        settings.ebook_cache_size,
    ));
    let transcripts = Arc::new(TranscriptStore::new(settings.transcripts_dir()));
    let alignments = AlignmentStore::new(settings.alignments_dir());

    // Clients
    let abs_client = Arc::new(AbsClient::new(
        settings.abs_server_url.clone(),
        settings.abs_key.clone(),
        settings.client_timeout,
    )?);
    let booklore = if settings.booklore_url.is_empty() {
        None
    } else {
        Some(Arc::new(BookloreSyncClient::new(
            settings.booklore_url.clone(),
            settings.booklore_token.clone(),
            settings.client_timeout,
            ebooks.clone(),
        )?))
    };

    let mut clients: Vec<Arc<dyn SyncClient>> = vec![
        Arc::new(AbsSyncClient::new(
            abs_client.clone(),
            transcripts.clone(),
            settings.abs_progress_offset_seconds,
        )),
        Arc::new(KosyncSyncClient::new(store.clone(), ebooks.clone())),
        Arc::new(StorytellerSyncClient::new(
            settings.storyteller_url.clone(),
            settings.storyteller_user.clone(),
            settings.storyteller_password.clone(),
            settings.client_timeout,
            ebooks.clone(),
        )?),
        Arc::new(HardcoverSyncClient::new(
            settings.hardcover_token.clone(),
            settings.client_timeout,
        )?),
    ];
    if let Some(booklore) = &booklore {
        clients.push(booklore.clone() as Arc<dyn SyncClient>);
    }

    // Engine
    let translator = Translator::new(
        alignments.clone(),
        transcripts.clone(),
        ebooks.clone(),
        settings.fuzzy_threshold,
    );
    let policy = DeltaPolicy {
        abs_seconds: settings.delta_abs_seconds,
        kosync_percent: settings.delta_kosync_percent,
        kosync_words: settings.delta_kosync_words,
        default_percent: 0.005,
        between_clients: settings.delta_between_clients,
        regression_tolerance: 0.005,
    };
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        clients,
        translator,
        suppressor.clone(),
        events.clone(),
        ebooks.clone(),
        policy,
        settings.cycle_timeout,
    ));

    engine.startup_checks().await;

    let cancel = CancellationToken::new();
    let dispatcher = SyncDispatcher::start(engine.clone(), settings.sync_workers, cancel.clone());

    // Suggestion scanner rides on the global tick's bulk snapshot.
    let suggestions = settings.suggestions_enabled.then(|| {
        Arc::new(SuggestionScanner::new(
            store.clone(),
            abs_client.clone(),
            booklore.clone(),
            settings.books_dir.clone(),
            events.clone(),
        ))
    });

    // Transcription job manager
    let transcriber = Arc::new(RemoteTranscriber::new(settings.whisper_url.clone())?);
    let job_manager = Arc::new(JobManager::new(
        store.clone(),
        abs_client.clone(),
        transcriber,
        transcripts.clone(),
        alignments.clone(),
        ebooks.clone(),
        booklore.clone(),
        events.clone(),
        JobConfig {
            max_retries: settings.job_max_retries,
            retry_delay: settings.job_retry_delay,
            model: settings.whisper_model.clone(),
            audio_cache_dir: settings.audio_cache_dir(),
            epub_cache_dir: settings.epub_cache_dir(),
        },
    ));
    job_manager.recover_stale_jobs().await?;
    tokio::spawn(job_manager.clone().run(cancel.clone()));

    // Trigger workers
    if !settings.abs_server_url.is_empty() {
        let listener = Arc::new(AbsEventListener::new(
            settings.abs_server_url.clone(),
            settings.abs_key.clone(),
            store.clone(),
            dispatcher.clone(),
            suppressor.clone(),
            settings.abs_event_debounce,
        ));
        tokio::spawn(listener.run(cancel.clone()));
    }

    let mut pollers = Vec::new();
    if settings.storyteller_poll_mode == PollMode::Custom {
        pollers.push((
            ClientName::Storyteller,
            std::time::Duration::from_secs(settings.storyteller_poll_seconds),
        ));
    }
    if settings.booklore_poll_mode == PollMode::Custom {
        pollers.push((
            ClientName::Booklore,
            std::time::Duration::from_secs(settings.booklore_poll_seconds),
        ));
    }
    spawn_pollers(pollers, &engine, &dispatcher, &suppressor, &cancel);

    let tick = GlobalTick::new(
        engine.clone(),
        dispatcher.clone(),
        suggestions,
        settings.sync_period,
    );
    tokio::spawn(tick.run(cancel.clone()));

    // HTTP surfaces
    let app_state = AppState {
        store,
        engine,
        dispatcher,
        events,
        ebooks,
        suppressor,
        settings: settings.clone(),
    };

    let admin_addr = format!("0.0.0.0:{}", settings.primary_port);
    let kosync_addr = format!("0.0.0.0:{}", settings.kosync_port);

    let admin_listener = tokio::net::TcpListener::bind(&admin_addr).await?;
    let kosync_listener = tokio::net::TcpListener::bind(&kosync_addr).await?;
    info!("Admin API listening on http://{admin_addr}");
    info!("KoSync server listening on http://{kosync_addr}");

    let admin = axum::serve(admin_listener, api::admin_router(app_state.clone())).into_future();
    let kosync = axum::serve(kosync_listener, api::kosync_router(app_state)).into_future();

    tokio::select! {
        result = admin => {
            warn!("Admin server exited");
            result?;
        }
        result = kosync => {
            warn!("KoSync server exited");
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    cancel.cancel();
    info!("BookBridge stopped");
    Ok(())
}
