use axum::extract::ws::{CloseFrame, Message};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::mpsc;

/// UDP rendezvous an agent publishes so it can be prodded while offline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rendezvous {
    pub ip: String,
    pub port: u16,
}

/// A channel in the global table. The channel id is the map key; the value
/// carries the owner and the monotonically non-decreasing version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub uaid: String,
    pub version: u64,
}

/// Outbound half of a live agent session. The session id disambiguates a
/// replaced socket from the one currently attached.
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    sender: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub fn new(id: u64, sender: mpsc::Sender<Message>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a text frame without blocking; a full or closed queue is a
    /// failed delivery attempt, reported to the caller.
    pub fn try_send_text(&self, text: String) -> bool {
        self.sender.try_send(Message::Text(text)).is_ok()
    }

    /// Queue a close frame with the given status code.
    pub fn try_close(&self, code: u16, reason: &'static str) -> bool {
        self.sender
            .try_send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .is_ok()
    }
}

#[derive(Debug)]
pub struct Agent {
    pub uaid: String,
    pub wakeup: Option<Rendezvous>,
    pub last_contact: Instant,
    pub channels: HashSet<String>,
    pub session: Option<SessionHandle>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    Conflict,
}

/// The projection of the registry that survives restarts. Sessions,
/// last-contact timestamps, and pending deliveries are deliberately absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    #[serde(default)]
    pub agents: HashMap<String, PersistedAgent>,
    #[serde(default)]
    pub channels: HashMap<String, Channel>,
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedAgent {
    #[serde(default)]
    pub wakeup: Option<Rendezvous>,
}

/// Authoritative in-memory state: agents, the global channel table, and
/// broadcast groups. Callers serialize access through a single lock.
#[derive(Default)]
pub struct Registry {
    agents: HashMap<String, Agent>,
    channels: HashMap<String, Channel>,
    groups: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_persisted(persisted: PersistedState) -> Self {
        let mut registry = Self::new();
        for (uaid, agent) in persisted.agents {
            registry.agents.insert(
                uaid.clone(),
                Agent {
                    uaid,
                    wakeup: agent.wakeup,
                    last_contact: Instant::now(),
                    channels: HashSet::new(),
                    session: None,
                },
            );
        }
        // Owned sets are derived from the channel table so the two can never
        // disagree after a restore.
        for (channel_id, channel) in persisted.channels {
            registry
                .ensure_agent(&channel.uaid)
                .channels
                .insert(channel_id.clone());
            registry.channels.insert(channel_id, channel);
        }
        registry.groups = persisted.groups;
        registry
    }

    pub fn persistable(&self) -> PersistedState {
        PersistedState {
            agents: self
                .agents
                .iter()
                .map(|(uaid, agent)| {
                    (
                        uaid.clone(),
                        PersistedAgent {
                            wakeup: agent.wakeup.clone(),
                        },
                    )
                })
                .collect(),
            channels: self.channels.clone(),
            groups: self.groups.clone(),
        }
    }

    pub fn ensure_agent(&mut self, uaid: &str) -> &mut Agent {
        self.agents.entry(uaid.to_string()).or_insert_with(|| Agent {
            uaid: uaid.to_string(),
            wakeup: None,
            last_contact: Instant::now(),
            channels: HashSet::new(),
            session: None,
        })
    }

    pub fn agent(&self, uaid: &str) -> Option<&Agent> {
        self.agents.get(uaid)
    }

    pub fn agent_mut(&mut self, uaid: &str) -> Option<&mut Agent> {
        self.agents.get_mut(uaid)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn touch(&mut self, uaid: &str) {
        if let Some(agent) = self.agents.get_mut(uaid) {
            agent.last_contact = Instant::now();
        }
    }

    pub fn set_wakeup(&mut self, uaid: &str, rendezvous: Rendezvous) {
        self.ensure_agent(uaid).wakeup = Some(rendezvous);
    }

    pub fn agent_owns(&self, uaid: &str, channel_id: &str) -> bool {
        self.agents
            .get(uaid)
            .map(|agent| agent.channels.contains(channel_id))
            .unwrap_or(false)
    }

    /// Create a channel owned by `uaid` at version 0. Conflicts when the
    /// channel exists under a different owner; re-registering an owned
    /// channel is a no-op (the version is left alone).
    pub fn register_channel(&mut self, uaid: &str, channel_id: &str) -> RegisterOutcome {
        if let Some(channel) = self.channels.get(channel_id) {
            if channel.uaid != uaid {
                return RegisterOutcome::Conflict;
            }
            return RegisterOutcome::Registered;
        }
        self.channels.insert(
            channel_id.to_string(),
            Channel {
                uaid: uaid.to_string(),
                version: 0,
            },
        );
        self.ensure_agent(uaid)
            .channels
            .insert(channel_id.to_string());
        RegisterOutcome::Registered
    }

    /// Remove a channel its owner no longer wants. Group references are left
    /// stale on purpose; they are filtered against the channel table at
    /// fan-out time.
    pub fn unregister_channel(&mut self, uaid: &str, channel_id: &str) -> bool {
        if !self.agent_owns(uaid, channel_id) {
            return false;
        }
        if let Some(agent) = self.agents.get_mut(uaid) {
            agent.channels.remove(channel_id);
        }
        self.channels.remove(channel_id);
        true
    }

    /// Drop an agent together with every channel it owns. Used when a
    /// re-hello claims channels the registry does not know.
    pub fn reset_agent(&mut self, uaid: &str) {
        if let Some(agent) = self.agents.remove(uaid) {
            for channel_id in &agent.channels {
                self.channels.remove(channel_id);
            }
        }
    }

    pub fn attach_session(&mut self, uaid: &str, session: SessionHandle) {
        self.ensure_agent(uaid).session = Some(session);
    }

    /// Clear the session slot only when it still belongs to the given
    /// session id; a replaced socket's late disconnect must not clobber the
    /// successor session.
    pub fn detach_session(&mut self, uaid: &str, session_id: u64) -> bool {
        if let Some(agent) = self.agents.get_mut(uaid) {
            if agent.session.as_ref().map(SessionHandle::id) == Some(session_id) {
                agent.session = None;
                return true;
            }
        }
        false
    }

    /// Unconditionally take the attached session, if any (reaper path).
    pub fn take_session(&mut self, uaid: &str) -> Option<SessionHandle> {
        self.agents.get_mut(uaid).and_then(|agent| agent.session.take())
    }

    pub fn channel(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    /// Increment a channel's version, returning the owner and new version.
    pub fn bump_version(&mut self, channel_id: &str) -> Option<(String, u64)> {
        let channel = self.channels.get_mut(channel_id)?;
        channel.version += 1;
        Some((channel.uaid.clone(), channel.version))
    }

    pub fn group_add(&mut self, group_id: &str, channel_id: &str) {
        self.groups
            .entry(group_id.to_string())
            .or_default()
            .push(channel_id.to_string());
    }

    /// Remove the first occurrence of the channel id from the group.
    pub fn group_remove(&mut self, group_id: &str, channel_id: &str) {
        if let Some(members) = self.groups.get_mut(group_id) {
            if let Some(index) = members.iter().position(|id| id == channel_id) {
                members.swap_remove(index);
            }
        }
    }

    pub fn group_members(&self, group_id: &str) -> Option<Vec<String>> {
        self.groups.get(group_id).cloned()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: u64) -> (SessionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (SessionHandle::new(id, tx), rx)
    }

    fn owned_sets_agree(registry: &Registry) -> bool {
        for agent in registry.agents() {
            for channel_id in &agent.channels {
                match registry.channel(channel_id) {
                    Some(channel) if channel.uaid == agent.uaid => {}
                    _ => return false,
                }
            }
        }
        for (channel_id, channel) in &registry.channels {
            if !registry.agent_owns(&channel.uaid, channel_id) {
                return false;
            }
        }
        true
    }

    #[test]
    fn register_unregister_keeps_owned_set_and_table_in_agreement() {
        let mut registry = Registry::new();
        registry.ensure_agent("u1");

        for step in [
            ("register", "c1"),
            ("register", "c2"),
            ("unregister", "c1"),
            ("register", "c3"),
            ("unregister", "c9"),
            ("unregister", "c2"),
            ("register", "c1"),
        ] {
            match step {
                ("register", id) => {
                    assert_eq!(
                        registry.register_channel("u1", id),
                        RegisterOutcome::Registered
                    );
                }
                (_, id) => {
                    registry.unregister_channel("u1", id);
                }
            }
            assert!(owned_sets_agree(&registry), "diverged after {step:?}");
        }

        assert!(registry.agent_owns("u1", "c1"));
        assert!(registry.agent_owns("u1", "c3"));
        assert!(!registry.agent_owns("u1", "c2"));
    }

    #[test]
    fn register_conflict_leaves_state_unchanged() {
        let mut registry = Registry::new();
        registry.register_channel("u1", "c1");
        registry.bump_version("c1");

        assert_eq!(
            registry.register_channel("u2", "c1"),
            RegisterOutcome::Conflict
        );
        let channel = registry.channel("c1").expect("channel kept");
        assert_eq!(channel.uaid, "u1");
        assert_eq!(channel.version, 1);
        assert!(!registry.agent_owns("u2", "c1"));
    }

    #[test]
    fn re_register_by_owner_is_idempotent() {
        let mut registry = Registry::new();
        registry.register_channel("u1", "c1");
        registry.bump_version("c1");
        registry.bump_version("c1");

        assert_eq!(
            registry.register_channel("u1", "c1"),
            RegisterOutcome::Registered
        );
        assert_eq!(registry.channel("c1").expect("channel").version, 2);
    }

    #[test]
    fn unregister_by_non_owner_is_a_no_op() {
        let mut registry = Registry::new();
        registry.register_channel("u1", "c1");

        assert!(!registry.unregister_channel("u2", "c1"));
        assert!(registry.has_channel("c1"));
        assert!(!registry.unregister_channel("u1", "missing"));
    }

    #[test]
    fn reset_agent_drops_owned_channels_but_not_groups() {
        let mut registry = Registry::new();
        registry.register_channel("u1", "c1");
        registry.register_channel("u1", "c2");
        registry.group_add("g1", "c1");

        registry.reset_agent("u1");

        assert!(registry.agent("u1").is_none());
        assert!(!registry.has_channel("c1"));
        assert!(!registry.has_channel("c2"));
        assert_eq!(
            registry.group_members("g1"),
            Some(vec!["c1".to_string()]),
            "stale group references are tolerated"
        );
    }

    #[test]
    fn group_add_then_remove_restores_membership() {
        let mut registry = Registry::new();
        registry.group_add("g1", "c1");
        registry.group_add("g1", "c2");
        let before: HashSet<String> = registry.group_members("g1").expect("group").into_iter().collect();

        registry.group_add("g1", "c3");
        registry.group_remove("g1", "c3");

        let after: HashSet<String> = registry.group_members("g1").expect("group").into_iter().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn group_remove_drops_first_occurrence_only() {
        let mut registry = Registry::new();
        registry.group_add("g1", "c1");
        registry.group_add("g1", "c2");
        registry.group_add("g1", "c1");

        registry.group_remove("g1", "c1");

        let members = registry.group_members("g1").expect("group");
        assert_eq!(members.len(), 2);
        assert_eq!(members.iter().filter(|id| *id == "c1").count(), 1);
        assert_eq!(members.iter().filter(|id| *id == "c2").count(), 1);
    }

    #[test]
    fn attach_replaces_previous_session_and_detach_is_guarded() {
        let mut registry = Registry::new();
        registry.ensure_agent("u1");

        let (first, _rx1) = session(1);
        registry.attach_session("u1", first);
        let (second, _rx2) = session(2);
        registry.attach_session("u1", second);

        // the replaced socket's disconnect must not clear the live session
        assert!(!registry.detach_session("u1", 1));
        assert_eq!(
            registry.agent("u1").and_then(|a| a.session.as_ref()).map(SessionHandle::id),
            Some(2)
        );

        assert!(registry.detach_session("u1", 2));
        assert!(registry.agent("u1").expect("agent kept").session.is_none());
    }

    #[test]
    fn bump_version_increments_and_reports_owner() {
        let mut registry = Registry::new();
        registry.register_channel("u1", "c1");

        assert_eq!(registry.bump_version("c1"), Some(("u1".to_string(), 1)));
        assert_eq!(registry.bump_version("c1"), Some(("u1".to_string(), 2)));
        assert_eq!(registry.bump_version("missing"), None);
    }

    #[test]
    fn persist_restore_is_a_fixpoint() {
        let mut registry = Registry::new();
        registry.register_channel("u1", "c1");
        registry.register_channel("u2", "c2");
        registry.bump_version("c2");
        registry.set_wakeup(
            "u1",
            Rendezvous {
                ip: "10.1.2.3".to_string(),
                port: 4500,
            },
        );
        registry.group_add("g1", "c1");
        registry.group_add("g1", "c2");
        let (handle, _rx) = session(7);
        registry.attach_session("u1", handle);

        let persisted = registry.persistable();
        let restored = Registry::from_persisted(persisted.clone());

        assert_eq!(restored.persistable(), persisted);
        assert!(owned_sets_agree(&restored));
        assert!(
            restored.agent("u1").expect("agent").session.is_none(),
            "sessions are not persisted"
        );
        assert_eq!(
            restored.agent("u1").expect("agent").wakeup,
            Some(Rendezvous {
                ip: "10.1.2.3".to_string(),
                port: 4500,
            })
        );
    }
}
