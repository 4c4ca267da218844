use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use pharmcall_core::config::{CallMode, DispatchKind};
use pharmcall_core::PharmcallConfig;
use pharmcall_scheduler::{
    CallExecutor, CallScheduler, CallingWindow, JobTask, LocalDispatcher, QStashDispatcher,
    RateGuard, RetryPolicy, SqliteStore, TaskDispatcher,
};
use pharmcall_voice::{CallWaiters, SimulatedExecutor, VapiProvider, VoiceCallExecutor};
use tokio::sync::{mpsc, watch};

mod app;
mod auth;
mod http;

/// Capacity of the in-process delivery channel.
const LOCAL_QUEUE_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pharmcall_gateway=info,pharmcall_scheduler=info,pharmcall_voice=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // load config: PHARMCALL_CONFIG env > ~/.pharmcall/pharmcall.toml
    let config_path = std::env::var("PHARMCALL_CONFIG").ok();
    let config = PharmcallConfig::load(config_path.as_deref())?;
    config.validate()?;

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SqliteStore::open(db_path)?);

    let window = CallingWindow::from_config(&config.calling)?;
    let retry = RetryPolicy::from_config(&config.calling);
    let rate_guard = RateGuard::new(store.clone(), config.calling.rate_limit_secs);

    let waiters = Arc::new(CallWaiters::new());
    let executor = build_executor(&config, waiters.clone());

    let (dispatcher, local_rx) = build_dispatcher(&config);
    let scheduler = Arc::new(CallScheduler::new(
        store.clone(),
        store,
        rate_guard,
        window,
        retry,
        executor,
        dispatcher,
    )
    .with_processing_timeout(config.calling.processing_timeout_secs()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Some(rx) = local_rx {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { drain_local(scheduler, rx, shutdown_rx).await });
    }

    let state = Arc::new(app::AppState::new(config, scheduler, waiters));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Pharmcall gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    // stop the local delivery loop
    let _ = shutdown_tx.send(true);
    Ok(())
}

fn build_executor(config: &PharmcallConfig, waiters: Arc<CallWaiters>) -> Arc<dyn CallExecutor> {
    match config.calling.mode {
        CallMode::Real => {
            let voice = &config.voice;
            info!(base_url = %voice.base_url, "call executor: Vapi");
            let provider = VapiProvider::new(
                voice.api_key.clone().unwrap_or_default(),
                voice.assistant_id.clone().unwrap_or_default(),
                voice.phone_number_id.clone().unwrap_or_default(),
                Some(voice.base_url.clone()),
            );
            Arc::new(VoiceCallExecutor::from_config(
                Arc::new(provider),
                waiters,
                &config.calling,
            ))
        }
        CallMode::Simulated => {
            warn!("call executor: simulated, no real calls will be placed");
            Arc::new(SimulatedExecutor::new())
        }
    }
}

fn build_dispatcher(
    config: &PharmcallConfig,
) -> (Arc<dyn TaskDispatcher>, Option<mpsc::Receiver<JobTask>>) {
    let dispatch = &config.dispatch;
    match dispatch.kind {
        DispatchKind::Qstash => {
            info!(base_url = %dispatch.base_url, "dispatcher: QStash");
            let mut dispatcher = QStashDispatcher::new(
                dispatch.base_url.clone(),
                dispatch.token.clone().unwrap_or_default(),
                dispatch.callback_url.clone().unwrap_or_default(),
            );
            if let Some(bearer) = dispatch.callback_bearer(&config.gateway) {
                dispatcher = dispatcher.with_forward_auth(bearer);
            }
            (Arc::new(dispatcher), None)
        }
        DispatchKind::Local => {
            warn!("dispatcher: local, delayed jobs are lost on restart");
            let (dispatcher, rx) = LocalDispatcher::new(LOCAL_QUEUE_DEPTH);
            (Arc::new(dispatcher), Some(rx))
        }
    }
}

/// Feed in-process deliveries to the scheduler. Each delivery runs on its own
/// task since a real call can take minutes.
async fn drain_local(
    scheduler: Arc<CallScheduler>,
    mut rx: mpsc::Receiver<JobTask>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            task = rx.recv() => {
                let Some(task) = task else { break };
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    match scheduler.process_job(&task).await {
                        Ok(outcome) => info!(
                            search_id = %task.search_id,
                            pharmacy_id = %task.pharmacy_id,
                            ?outcome,
                            "local delivery handled"
                        ),
                        Err(e) => warn!(
                            search_id = %task.search_id,
                            pharmacy_id = %task.pharmacy_id,
                            code = e.code(),
                            "local delivery failed: {e}"
                        ),
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("local delivery loop stopped");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "could not create database directory");
            }
        }
    }
}
