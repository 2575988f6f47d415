use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

use crate::registry::Rendezvous;

/// Fixed datagram payload; receivers treat any datagram as a prod, the
/// bytes are kept for compatibility.
pub const WAKEUP_PAYLOAD: &[u8] = b"push";

/// Send a single UDP prod to an agent's published rendezvous. Every failure
/// mode is terminal for this attempt; the pending entry stays queued for the
/// next redrive.
pub async fn send_wakeup(rendezvous: &Rendezvous) {
    let target = format!("{}:{}", rendezvous.ip, rendezvous.port);
    let addr = match lookup_host(&target).await {
        Ok(mut addrs) => match addrs.find(|addr| addr.is_ipv4()) {
            Some(addr) => addr,
            None => {
                warn!(event = "wakeup_resolve_failed", target = %target, reason = "no ipv4 address");
                return;
            }
        },
        Err(err) => {
            warn!(event = "wakeup_resolve_failed", target = %target, error = %err);
            return;
        }
    };

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(event = "wakeup_socket_failed", error = %err);
            return;
        }
    };

    match socket.send_to(WAKEUP_PAYLOAD, addr).await {
        Ok(_) => debug!(event = "wakeup_sent", target = %addr),
        Err(err) => warn!(event = "wakeup_send_failed", target = %addr, error = %err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_push_datagram_to_rendezvous() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let port = receiver.local_addr().expect("addr").port();

        send_wakeup(&Rendezvous {
            ip: "127.0.0.1".to_string(),
            port,
        })
        .await;

        let mut buf = [0u8; 16];
        let (len, _from) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("datagram timeout")
            .expect("recv");
        assert_eq!(&buf[..len], WAKEUP_PAYLOAD);
    }

    #[tokio::test]
    async fn unresolvable_rendezvous_is_swallowed() {
        // must not panic or error; failures are log-only
        send_wakeup(&Rendezvous {
            ip: "definitely-not-a-host.invalid".to_string(),
            port: 1,
        })
        .await;
    }
}
