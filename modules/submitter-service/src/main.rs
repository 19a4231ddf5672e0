//! Transaction Submitter Service: standalone binary running the submission
//! core against the configured chain, with an operator RPC API.
//!
//! Default: http://127.0.0.1:9110/

mod config;
mod db;
mod routes;

use config::{ChainMode, ServiceConfig};
use routes::AppState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use submitter_core::{
    Dispatcher, EmulatorChain, JobQueue, JobTracker, KeyPool, SequenceSource, SettingsService,
    TransactionSubmitter,
};

/// Finished jobs stay visible in memory this long; the database keeps them
const TRACKER_RETENTION_HOURS: i64 = 24;
const TRACKER_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("[SUBMITTER] {}", e);
            std::process::exit(1);
        }
    };

    log::info!("Opening database at: {}", config.db_path);
    let database = match db::Db::open(&config.db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            log::error!("[SUBMITTER] Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let settings = match SettingsService::new(database.clone()) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            log::error!("[SUBMITTER] Failed to load settings: {}", e);
            std::process::exit(1);
        }
    };

    let submitter_config = config.submitter.clone();
    let (submitter, sequences): (Arc<dyn TransactionSubmitter>, Arc<dyn SequenceSource>) =
        match config.chain_mode {
            ChainMode::Emulator => {
                log::warn!(
                    "[SUBMITTER] Chain mode 'emulator': transactions stay in this process"
                );
                let chain = Arc::new(EmulatorChain::new(
                    submitter_config.admin_address.clone(),
                    submitter_config.proposal_key_count,
                    config.emulator_start_sequence,
                ));
                let submitter: Arc<dyn TransactionSubmitter> = chain.clone();
                let sequences: Arc<dyn SequenceSource> = chain;
                (submitter, sequences)
            }
        };

    // sequences are read from the chain on each key's first lease
    let keys = KeyPool::unsynced(
        submitter_config.admin_address.clone(),
        submitter_config.proposal_key_count,
        sequences,
    );
    let queue = Arc::new(JobQueue::new(
        submitter_config.queue_capacity,
        settings.clone(),
    ));
    let tracker = Arc::new(JobTracker::with_outbox(database.clone()));
    let dispatcher = Dispatcher::new(
        Arc::new(submitter_config),
        queue,
        keys,
        submitter,
        tracker.clone(),
    );

    match database.load_requeued_jobs() {
        Ok(parked) if !parked.is_empty() => {
            log::info!("[SUBMITTER] Found {} jobs parked by the last run", parked.len());
            dispatcher.resume(parked);
        }
        Ok(_) => {}
        Err(e) => log::error!("[SUBMITTER] Failed to load parked jobs: {}", e),
    }
    dispatcher.start();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TRACKER_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            tracker.cleanup_old(TRACKER_RETENTION_HOURS);
        }
    });

    let state = Arc::new(AppState {
        settings,
        dispatcher: dispatcher.clone(),
        db: database,
        start_time: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        .route(
            "/rpc/settings",
            axum::routing::get(routes::get_settings).post(routes::set_settings),
        )
        .route("/rpc/status", axum::routing::get(routes::status))
        .route("/rpc/jobs/submit", axum::routing::post(routes::job_submit))
        .route("/rpc/jobs/get", axum::routing::post(routes::job_get))
        .route("/rpc/jobs/recent", axum::routing::get(routes::jobs_recent))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", config.port);
    log::info!("Transaction Submitter Service listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("[SUBMITTER] Failed to bind {}: {}", addr, e);
            dispatcher.shutdown(config.submitter.drain_timeout).await;
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!("[SUBMITTER] Server error: {}", e);
    }

    let report = dispatcher.shutdown(config.submitter.drain_timeout).await;
    if !report.requeued.is_empty() {
        log::info!(
            "[SUBMITTER] {} jobs parked for the next start",
            report.requeued.len()
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("[SUBMITTER] Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("[SUBMITTER] Shutdown requested; draining");
}
