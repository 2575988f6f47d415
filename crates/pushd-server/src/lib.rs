pub mod admin;
pub mod config;
pub mod delivery;
pub mod http;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod store;
pub mod wakeup;

use axum::routing::{any, get};
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::delivery::DeliveryHandle;
use crate::registry::Registry;
use crate::store::StateStore;

/// Shared state behind every handler: the configuration, the registry under
/// a single lock, the durable store, and the delivery engine intake.
pub struct AppState {
    config: ServerConfig,
    registry: Arc<RwLock<Registry>>,
    store: StateStore,
    delivery: DeliveryHandle,
    session_counter: AtomicU64,
}

impl AppState {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &RwLock<Registry> {
        &self.registry
    }

    pub(crate) fn delivery(&self) -> &DeliveryHandle {
        &self.delivery
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write the current registry state to the durable store. Persistence
    /// failures are logged; serving continues from memory.
    pub(crate) async fn snapshot(&self) {
        let persisted = self.registry.read().await.persistable();
        if let Err(err) = self.store.save(&persisted).await {
            warn!(event = "state_save_failed", error = %err);
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let notify_route = format!("{}*id", state.config.notify_prefix);
    let group_route = format!("{}/*rest", state.config.group_prefix.trim_end_matches('/'));
    Router::new()
        .route("/", get(session::ws_handler))
        .route("/health", get(admin::health_handler))
        .route("/admin", get(admin::admin_handler))
        .route(&notify_route, any(http::notify_handler))
        .route(&group_route, any(http::group_handler))
        .with_state(state)
}

/// Bind the listener, restore durable state, spawn the delivery engine and
/// reaper, and serve until the shutdown flag flips. Returns the bound
/// address (port 0 in the config resolves to the real port, which is also
/// what advertised endpoint URLs will carry).
pub async fn start(
    config: ServerConfig,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind((config.hostname.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    let mut config = config;
    if config.port == 0 {
        config.port = addr.port();
    }

    let store = StateStore::new(config.state_file.clone());
    let registry = match store.load().await {
        Ok(Some(persisted)) => {
            let registry = Registry::from_persisted(persisted);
            info!(
                event = "state_restored",
                agents = registry.agent_count(),
                channels = registry.channel_count()
            );
            registry
        }
        Ok(None) => {
            info!(event = "state_fresh");
            Registry::new()
        }
        Err(err) => {
            warn!(event = "state_load_failed", error = %err);
            Registry::new()
        }
    };
    let registry = Arc::new(RwLock::new(registry));

    let (delivery, _engine_task) = delivery::spawn(
        registry.clone(),
        delivery::REDRIVE_INTERVAL,
        shutdown.clone(),
    );
    reaper::spawn(registry.clone(), shutdown.clone());

    let state = Arc::new(AppState {
        config,
        registry,
        store,
        delivery,
        session_counter: AtomicU64::new(0),
    });
    let app = router(state);

    let mut shutdown_rx = shutdown;
    let shutdown_future = async move {
        loop {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
            if *shutdown_rx.borrow() {
                break;
            }
        }
    };

    let serve_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
        {
            error!(event = "serve_error", error = %err);
        }
    });

    info!(event = "listening", addr = %addr);
    Ok((addr, serve_task))
}
