use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pushd_core::protocol::{encode_server_message, ServerMessage, Update};

use crate::registry::Registry;
use crate::wakeup;

/// Redrive cadence for entries that have not been acked yet.
pub const REDRIVE_INTERVAL: Duration = Duration::from_secs(15);

/// The latest notification owed to an agent for one channel. Keyed by
/// channel id inside the engine so a newer version silently replaces an
/// older one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub uaid: String,
    pub channel_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub channel_id: String,
    pub version: u64,
}

/// Intake side of the engine. Submissions and acks ride disjoint unbounded
/// queues; all pending-map mutation happens on the engine task.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    pending_tx: mpsc::UnboundedSender<PendingDelivery>,
    ack_tx: mpsc::UnboundedSender<Ack>,
}

impl DeliveryHandle {
    pub fn submit(&self, delivery: PendingDelivery) {
        if self.pending_tx.send(delivery).is_err() {
            warn!(event = "delivery_queue_closed");
        }
    }

    pub fn ack(&self, ack: Ack) {
        if self.ack_tx.send(ack).is_err() {
            warn!(event = "ack_queue_closed");
        }
    }
}

pub fn spawn(
    registry: Arc<RwLock<Registry>>,
    redrive_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> (DeliveryHandle, JoinHandle<()>) {
    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_engine(
        registry,
        pending_rx,
        ack_rx,
        redrive_interval,
        shutdown,
    ));
    (DeliveryHandle { pending_tx, ack_tx }, task)
}

async fn run_engine(
    registry: Arc<RwLock<Registry>>,
    mut pending_rx: mpsc::UnboundedReceiver<PendingDelivery>,
    mut ack_rx: mpsc::UnboundedReceiver<Ack>,
    redrive_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending: HashMap<String, PendingDelivery> = HashMap::new();
    let mut redrive = tokio::time::interval(redrive_interval);
    redrive.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(delivery) = pending_rx.recv() => {
                debug!(
                    event = "pending_new",
                    channel_id = %delivery.channel_id,
                    version = delivery.version
                );
                let channel_id = delivery.channel_id.clone();
                pending.insert(channel_id.clone(), delivery);
                attempt_one(&registry, &mut pending, &channel_id).await;
            }
            Some(ack) = ack_rx.recv() => {
                reconcile_ack(&mut pending, ack);
            }
            _ = redrive.tick() => {
                if pending.is_empty() {
                    continue;
                }
                info!(event = "redrive", pending = pending.len());
                let channel_ids: Vec<String> = pending.keys().cloned().collect();
                for channel_id in channel_ids {
                    attempt_one(&registry, &mut pending, &channel_id).await;
                }
            }
        }
    }
    info!(event = "delivery_engine_stopped", pending = pending.len());
}

fn reconcile_ack(pending: &mut HashMap<String, PendingDelivery>, ack: Ack) {
    match pending.get(&ack.channel_id) {
        Some(entry) if entry.version == ack.version => {
            pending.remove(&ack.channel_id);
            debug!(event = "pending_acked", channel_id = %ack.channel_id, version = ack.version);
        }
        Some(entry) => {
            // stale acks and acks from the future are both ignored
            debug!(
                event = "ack_version_mismatch",
                channel_id = %ack.channel_id,
                acked = ack.version,
                pending = entry.version
            );
        }
        None => {
            debug!(event = "ack_without_pending", channel_id = %ack.channel_id);
        }
    }
}

async fn attempt_one(
    registry: &RwLock<Registry>,
    pending: &mut HashMap<String, PendingDelivery>,
    channel_id: &str,
) {
    let Some(entry) = pending.get(channel_id) else {
        return;
    };
    if attempt_delivery(registry, entry).await {
        pending.remove(channel_id);
    }
}

/// One delivery attempt. Returns true when the entry should be removed
/// (the channel was unregistered); every other outcome keeps it pending
/// for the next redrive.
async fn attempt_delivery(registry: &RwLock<Registry>, entry: &PendingDelivery) -> bool {
    let wake_target = {
        let registry = registry.read().await;
        let Some(channel) = registry.channel(&entry.channel_id) else {
            debug!(
                event = "pending_dropped",
                reason = "channel_unregistered",
                channel_id = %entry.channel_id
            );
            return true;
        };
        let Some(agent) = registry.agent(&entry.uaid) else {
            warn!(
                event = "delivery_no_agent",
                uaid = %entry.uaid,
                channel_id = %entry.channel_id
            );
            return false;
        };

        if let Some(session) = &agent.session {
            let message = ServerMessage::Notification {
                updates: vec![Update {
                    uaid: entry.uaid.clone(),
                    channel_id: entry.channel_id.clone(),
                    version: channel.version,
                }],
            };
            match encode_server_message(&message) {
                Ok(frame) => {
                    if session.try_send_text(frame) {
                        debug!(
                            event = "notification_sent",
                            uaid = %entry.uaid,
                            channel_id = %entry.channel_id,
                            version = channel.version
                        );
                    } else {
                        warn!(
                            event = "notification_send_failed",
                            uaid = %entry.uaid,
                            channel_id = %entry.channel_id
                        );
                    }
                }
                Err(err) => {
                    warn!(event = "notification_encode_failed", error = %err);
                }
            }
            return false;
        }

        match &agent.wakeup {
            Some(rendezvous) => Some(rendezvous.clone()),
            None => {
                warn!(
                    event = "delivery_unreachable",
                    uaid = %entry.uaid,
                    channel_id = %entry.channel_id
                );
                None
            }
        }
    };

    if let Some(rendezvous) = wake_target {
        wakeup::send_wakeup(&rendezvous).await;
    }
    false
}
