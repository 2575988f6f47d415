use axum::extract::State;
use axum::response::Html;
use std::sync::Arc;

use crate::registry::Registry;
use crate::AppState;

pub async fn health_handler() -> &'static str {
    "ok"
}

/// Read-only introspection page: every known agent with its connectedness
/// and owned channels, plus resident memory.
pub async fn admin_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    let registry = state.registry().read().await;
    Html(render_admin_page(&registry, resident_memory_bytes()))
}

fn render_admin_page(registry: &Registry, resident_bytes: u64) -> String {
    let mut agents: Vec<_> = registry.agents().collect();
    agents.sort_by(|a, b| a.uaid.cmp(&b.uaid));

    let mut rows = String::new();
    for agent in agents {
        let mut channels: Vec<_> = agent.channels.iter().cloned().collect();
        channels.sort();
        let channels = channels
            .iter()
            .map(|channel_id| {
                let version = registry
                    .channel(channel_id)
                    .map(|channel| channel.version)
                    .unwrap_or(0);
                format!("{}@{}", escape_html(channel_id), version)
            })
            .collect::<Vec<_>>()
            .join(", ");
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&agent.uaid),
            if agent.session.is_some() { "yes" } else { "no" },
            channels
        ));
    }

    format!(
        "<!doctype html>\n<html><head><title>pushd</title></head><body>\n\
         <h1>pushd</h1>\n\
         <p>resident memory: {} bytes &middot; {} agents &middot; {} channels</p>\n\
         <table border=\"1\">\n\
         <tr><th>uaid</th><th>connected</th><th>channels</th></tr>\n\
         {}\
         </table>\n</body></html>\n",
        resident_bytes,
        registry.agent_count(),
        registry.channel_count(),
        rows
    )
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> u64 {
    // second field of /proc/self/statm is resident pages
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
            Some(pages * 4096)
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Rendezvous, SessionHandle};
    use tokio::sync::mpsc;

    #[test]
    fn page_lists_agents_channels_and_connectedness() {
        let mut registry = Registry::new();
        registry.register_channel("agent-a", "c1");
        registry.register_channel("agent-a", "c2");
        registry.bump_version("c2");
        registry.register_channel("agent-b", "c3");
        registry.set_wakeup(
            "agent-b",
            Rendezvous {
                ip: "10.0.0.1".to_string(),
                port: 9999,
            },
        );
        let (tx, _rx) = mpsc::channel(1);
        registry.attach_session("agent-a", SessionHandle::new(1, tx));

        let page = render_admin_page(&registry, 12_345);

        assert!(page.contains("agent-a"));
        assert!(page.contains("agent-b"));
        assert!(page.contains("c2@1"));
        assert!(page.contains("c3@0"));
        assert!(page.contains("12345 bytes"));
        assert!(page.contains("<td>yes</td>"));
        assert!(page.contains("<td>no</td>"));
    }

    #[test]
    fn ids_are_html_escaped() {
        let mut registry = Registry::new();
        registry.register_channel("<script>", "c&1");

        let page = render_admin_page(&registry, 0);
        assert!(page.contains("&lt;script&gt;"));
        assert!(page.contains("c&amp;1"));
        assert!(!page.contains("<script>"));
    }
}
