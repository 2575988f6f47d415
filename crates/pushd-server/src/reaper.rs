use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::registry::Registry;

pub const REAP_INTERVAL: Duration = Duration::from_secs(10);
pub const STALE_AFTER: Duration = Duration::from_secs(15);

/// Close status telling the agent to reconnect when the wake-up prod lands.
pub const WAKEUP_CLOSE_STATUS: u16 = 4774;

/// Periodically close sessions of wake-capable agents that have gone
/// silent. Agents without a rendezvous are left alone: disconnecting them
/// would lose the only way to deliver.
pub fn spawn(registry: Arc<RwLock<Registry>>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    reap_once(&registry, STALE_AFTER).await;
                }
            }
        }
    })
}

pub(crate) async fn reap_once(registry: &RwLock<Registry>, stale_after: Duration) {
    let mut registry = registry.write().await;
    let stale: Vec<String> = registry
        .agents()
        .filter(|agent| {
            agent.wakeup.is_some()
                && agent.session.is_some()
                && agent.last_contact.elapsed() > stale_after
        })
        .map(|agent| agent.uaid.clone())
        .collect();

    for uaid in stale {
        if let Some(session) = registry.take_session(&uaid) {
            info!(
                event = "session_reaped",
                uaid = %uaid,
                close_status = WAKEUP_CLOSE_STATUS
            );
            session.try_close(WAKEUP_CLOSE_STATUS, "wake-up reconnect expected");
        }
    }
}
