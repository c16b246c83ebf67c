//! Broker state engine
//!
//! Owns the three coordination maps (agents, message queues, context store)
//! and enforces every quota and invariant. All operations are synchronous and
//! atomic with respect to each other: a single coarse mutex guards the three
//! maps because several operations (register, deregister, broadcast, reap)
//! must touch more than one of them without interleaving. Snapshots handed to
//! callers are owned copies.

use crate::domain_types::{
    AgentId, AgentName, BROKER_DISPLAY_NAME, BROKER_SENDER, ContextKey, MAX_AGENTS,
    MAX_CONTEXT_KEYS, MAX_CONTEXT_VALUE_SIZE, MAX_MESSAGE_CONTENT_SIZE, MAX_MESSAGES_PER_AGENT,
    MessageId, MessageType,
};
use crate::error::BrokerError;
use crate::time_provider::SharedTimeProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A registered agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub name: AgentName,
    pub project: String,
    pub path: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A queued message
///
/// `from` is either a registered agent id or the reserved literal `broker`;
/// `from_name` is the sender's display name snapshotted at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub from: String,
    pub from_name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    /// Whether an autonomous worker with id `own_id` may reply to this
    /// message. Replies to the operator or to oneself would loop.
    pub fn repliable_by(&self, own_id: &AgentId) -> bool {
        self.from != BROKER_SENDER && self.from != own_id.as_str()
    }
}

/// Originator of a send or broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    /// The operator console; bypasses the sender-registration check.
    Broker,
    Agent(AgentId),
}

impl Sender {
    /// Parses a wire sender id. The reserved literal `broker` maps to
    /// [`Sender::Broker`]; anything else must be a non-empty agent id.
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        if raw.trim() == BROKER_SENDER {
            return Ok(Self::Broker);
        }
        AgentId::try_new(raw.to_string())
            .map(Self::Agent)
            .map_err(|_| BrokerError::invalid_argument("sender id must not be empty"))
    }

    pub fn id_str(&self) -> &str {
        match self {
            Self::Broker => BROKER_SENDER,
            Self::Agent(id) => id.as_str(),
        }
    }
}

/// One entry in the shared context store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub key: ContextKey,
    pub value: serde_json::Value,
    pub set_by: String,
    pub set_by_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Listing row for the context store (values omitted)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub key: ContextKey,
    pub set_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot returned by [`BrokerState::read`]
///
/// `total` counts the messages matching the filter; `has_more` is whether
/// that count exceeds the requested limit. Reading never flips `read` flags;
/// acknowledgement is a separate, explicit operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadBatch {
    pub messages: Vec<Message>,
    pub total: usize,
    pub has_more: bool,
}

/// Per-agent row in the status report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    #[serde(flatten)]
    pub agent: Agent,
    pub unread_messages: usize,
}

/// Aggregate broker status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub uptime: u64,
    pub agents: Vec<AgentStatus>,
    pub total_agents: usize,
    pub total_context_keys: usize,
}

#[derive(Debug, Default)]
struct Shared {
    agents: HashMap<AgentId, Agent>,
    queues: HashMap<AgentId, VecDeque<Message>>,
    contexts: HashMap<ContextKey, ContextEntry>,
}

/// The broker's entire in-memory state
#[derive(Debug)]
pub struct BrokerState {
    shared: Mutex<Shared>,
    clock: SharedTimeProvider,
    started_at: Instant,
}

impl BrokerState {
    pub fn new(clock: SharedTimeProvider) -> Self {
        Self {
            shared: Mutex::new(Shared::default()),
            clock,
            started_at: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("broker state lock poisoned")
    }

    /// Registers an agent or refreshes an existing registration.
    ///
    /// Re-registering an existing id overwrites its metadata and refreshes
    /// `last_seen` while preserving its queue, which makes this the recovery
    /// path after a broker restart. Returns the total agent count.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when the id is new and the agent cap is
    /// already reached.
    pub fn register(
        &self,
        id: AgentId,
        name: AgentName,
        project: String,
        path: String,
    ) -> Result<usize, BrokerError> {
        let now = self.clock.now();
        let mut shared = self.lock();

        if !shared.agents.contains_key(&id) && shared.agents.len() >= MAX_AGENTS {
            return Err(BrokerError::resource_exhausted(format!(
                "agent limit reached ({MAX_AGENTS})"
            )));
        }

        shared.agents.insert(
            id.clone(),
            Agent {
                id: id.clone(),
                name,
                project,
                path,
                registered_at: now,
                last_seen: now,
            },
        );
        shared.queues.entry(id.clone()).or_default();

        let total = shared.agents.len();
        debug!(agent = %id, total, "agent registered");
        Ok(total)
    }

    /// Refreshes an agent's liveness stamp.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids; workers treat that as the signal
    /// to re-register.
    pub fn heartbeat(&self, id: &AgentId) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut shared = self.lock();
        let agent = shared
            .agents
            .get_mut(id)
            .ok_or_else(|| BrokerError::not_found(format!("agent {id}")))?;
        agent.last_seen = now;
        Ok(())
    }

    /// Removes an agent and its queue. Idempotent.
    pub fn deregister(&self, id: &AgentId) {
        let mut shared = self.lock();
        let existed = shared.agents.remove(id).is_some();
        shared.queues.remove(id);
        if existed {
            info!(agent = %id, "agent deregistered");
        }
    }

    /// Enqueues a message for `to` and returns the generated id.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for empty content or an unregistered non-broker
    /// sender, `NotFound` for an unknown recipient, `PayloadTooLarge` past
    /// the content bound.
    pub fn send(
        &self,
        from: &Sender,
        to: &AgentId,
        content: String,
        kind: MessageType,
    ) -> Result<MessageId, BrokerError> {
        let now = self.clock.now();
        let mut shared = self.lock();

        validate_content(&content)?;
        let (from_id, from_name) = resolve_sender(&shared, from)?;

        let id = MessageId::generate(now);
        let message = Message {
            id: id.clone(),
            from: from_id,
            from_name,
            content,
            kind,
            timestamp: now,
            read: false,
        };
        let queue = shared
            .queues
            .get_mut(to)
            .ok_or_else(|| BrokerError::not_found(format!("agent {to}")))?;
        enqueue(queue, message);

        debug!(to = %to, message = %id, "message enqueued");
        Ok(id)
    }

    /// Enqueues one message per registered agent except the sender.
    ///
    /// Each recipient gets an independently generated id. Returns how many
    /// messages were enqueued.
    pub fn broadcast(
        &self,
        from: &Sender,
        content: String,
        kind: MessageType,
    ) -> Result<usize, BrokerError> {
        let now = self.clock.now();
        let mut shared = self.lock();

        validate_content(&content)?;
        let (from_id, from_name) = resolve_sender(&shared, from)?;

        let recipients: Vec<AgentId> = shared
            .agents
            .keys()
            .filter(|id| id.as_str() != from_id)
            .cloned()
            .collect();
        for recipient in &recipients {
            let message = Message {
                id: MessageId::generate(now),
                from: from_id.clone(),
                from_name: from_name.clone(),
                content: content.clone(),
                kind,
                timestamp: now,
                read: false,
            };
            if let Some(queue) = shared.queues.get_mut(recipient) {
                enqueue(queue, message);
            }
        }

        debug!(from = %from_id, sent_to = recipients.len(), "broadcast enqueued");
        Ok(recipients.len())
    }

    /// Returns a stable snapshot of an agent's queue.
    ///
    /// Does not mutate `read` flags; delivery and acknowledgement are
    /// deliberately separate.
    pub fn read(
        &self,
        id: &AgentId,
        unread_only: bool,
        limit: usize,
    ) -> Result<ReadBatch, BrokerError> {
        let shared = self.lock();
        let queue = shared
            .queues
            .get(id)
            .ok_or_else(|| BrokerError::not_found(format!("agent {id}")))?;

        let filtered: Vec<Message> = queue
            .iter()
            .filter(|m| !unread_only || !m.read)
            .cloned()
            .collect();
        let total = filtered.len();
        let has_more = total > limit;
        let messages = filtered.into_iter().take(limit).collect();

        Ok(ReadBatch {
            messages,
            total,
            has_more,
        })
    }

    /// Marks the given messages as read; returns how many actually flipped.
    ///
    /// Unknown ids are ignored; already-read messages do not count again, so
    /// acknowledgement is idempotent.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `message_ids` is empty, `NotFound` for an
    /// unknown agent.
    pub fn ack(&self, id: &AgentId, message_ids: &[MessageId]) -> Result<usize, BrokerError> {
        if message_ids.is_empty() {
            return Err(BrokerError::invalid_argument(
                "message ids must not be empty",
            ));
        }
        let mut shared = self.lock();
        let queue = shared
            .queues
            .get_mut(id)
            .ok_or_else(|| BrokerError::not_found(format!("agent {id}")))?;

        let wanted: HashSet<&MessageId> = message_ids.iter().collect();
        let mut acked = 0;
        for message in queue.iter_mut() {
            if !message.read && wanted.contains(&message.id) {
                message.read = true;
                acked += 1;
            }
        }
        Ok(acked)
    }

    /// Truncates an agent's queue, returning how many messages were dropped.
    pub fn clear_messages(&self, id: &AgentId) -> Result<usize, BrokerError> {
        let mut shared = self.lock();
        let queue = shared
            .queues
            .get_mut(id)
            .ok_or_else(|| BrokerError::not_found(format!("agent {id}")))?;
        let cleared = queue.len();
        queue.clear();
        Ok(cleared)
    }

    /// Writes a context entry; last writer wins.
    ///
    /// `set_by_name` snapshots the writer's display name at write time,
    /// falling back to the raw `set_by` string for unknown writers.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a null value, `PayloadTooLarge` past the value
    /// bound, `ResourceExhausted` when a new key would exceed the key cap.
    pub fn set_context(
        &self,
        key: ContextKey,
        value: serde_json::Value,
        set_by: &str,
    ) -> Result<(), BrokerError> {
        if value.is_null() {
            return Err(BrokerError::invalid_argument("value must not be null"));
        }
        let serialized = serde_json::to_string(&value)
            .map_err(|e| BrokerError::invalid_argument(format!("value not serializable: {e}")))?;
        if serialized.len() > MAX_CONTEXT_VALUE_SIZE {
            return Err(BrokerError::PayloadTooLarge {
                size: serialized.len(),
                max: MAX_CONTEXT_VALUE_SIZE,
            });
        }

        let now = self.clock.now();
        let mut shared = self.lock();

        if !shared.contexts.contains_key(&key) && shared.contexts.len() >= MAX_CONTEXT_KEYS {
            return Err(BrokerError::resource_exhausted(format!(
                "context key limit reached ({MAX_CONTEXT_KEYS})"
            )));
        }

        let set_by_name = shared
            .agents
            .iter()
            .find(|(id, _)| id.as_str() == set_by)
            .map_or_else(|| set_by.to_string(), |(_, agent)| agent.name.to_string());

        shared.contexts.insert(
            key.clone(),
            ContextEntry {
                key,
                value,
                set_by: set_by.to_string(),
                set_by_name,
                timestamp: now,
            },
        );
        Ok(())
    }

    pub fn get_context(&self, key: &ContextKey) -> Result<ContextEntry, BrokerError> {
        self.lock()
            .contexts
            .get(key)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(format!("context key {key}")))
    }

    pub fn list_contexts(&self) -> Vec<ContextSummary> {
        self.lock()
            .contexts
            .values()
            .map(|entry| ContextSummary {
                key: entry.key.clone(),
                set_by: entry.set_by.clone(),
                timestamp: entry.timestamp,
            })
            .collect()
    }

    /// Removes a context key. Idempotent.
    pub fn delete_context(&self, key: &ContextKey) {
        self.lock().contexts.remove(key);
    }

    /// Snapshot of all registered agents.
    pub fn agents_snapshot(&self) -> Vec<Agent> {
        self.lock().agents.values().cloned().collect()
    }

    /// Aggregate status with per-agent unread counts.
    pub fn status(&self) -> StatusReport {
        let shared = self.lock();
        let agents = shared
            .agents
            .values()
            .map(|agent| AgentStatus {
                agent: agent.clone(),
                unread_messages: shared
                    .queues
                    .get(&agent.id)
                    .map_or(0, |q| q.iter().filter(|m| !m.read).count()),
            })
            .collect();
        StatusReport {
            uptime: self.started_at.elapsed().as_secs(),
            agents,
            total_agents: shared.agents.len(),
            total_context_keys: shared.contexts.len(),
        }
    }

    /// Evicts every agent whose last heartbeat is older than `threshold`,
    /// destroying its queue. Returns the evicted ids.
    pub fn reap_stale(&self, threshold: Duration) -> Vec<AgentId> {
        let now = self.clock.now();
        let mut shared = self.lock();

        let stale: Vec<AgentId> = shared
            .agents
            .values()
            .filter(|agent| {
                (now - agent.last_seen).num_milliseconds() > threshold.as_millis() as i64
            })
            .map(|agent| agent.id.clone())
            .collect();
        for id in &stale {
            shared.agents.remove(id);
            shared.queues.remove(id);
            info!(agent = %id, "stale agent reaped");
        }
        stale
    }
}

fn validate_content(content: &str) -> Result<(), BrokerError> {
    if content.is_empty() {
        return Err(BrokerError::invalid_argument("content must not be empty"));
    }
    if content.len() > MAX_MESSAGE_CONTENT_SIZE {
        return Err(BrokerError::PayloadTooLarge {
            size: content.len(),
            max: MAX_MESSAGE_CONTENT_SIZE,
        });
    }
    Ok(())
}

/// Resolves the sender's wire id and display-name snapshot.
fn resolve_sender(shared: &Shared, from: &Sender) -> Result<(String, String), BrokerError> {
    match from {
        Sender::Broker => Ok((BROKER_SENDER.to_string(), BROKER_DISPLAY_NAME.to_string())),
        Sender::Agent(id) => shared
            .agents
            .get(id)
            .map(|agent| (id.to_string(), agent.name.to_string()))
            .ok_or_else(|| BrokerError::invalid_argument(format!("sender {id} is not registered"))),
    }
}

fn enqueue(queue: &mut VecDeque<Message>, message: Message) {
    queue.push_back(message);
    while queue.len() > MAX_MESSAGES_PER_AGENT {
        queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::{ManualTimeProvider, system_time_provider};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn state() -> BrokerState {
        BrokerState::new(system_time_provider())
    }

    fn state_with_manual_clock() -> (BrokerState, Arc<ManualTimeProvider>) {
        let clock = Arc::new(ManualTimeProvider::new());
        (BrokerState::new(clock.clone()), clock)
    }

    fn aid(s: &str) -> AgentId {
        AgentId::try_new(s.to_string()).unwrap()
    }

    fn register(state: &BrokerState, id: &str) -> usize {
        state
            .register(
                aid(id),
                AgentName::try_new(format!("SP-{id}")).unwrap(),
                "proj".into(),
                "/tmp".into(),
            )
            .unwrap()
    }

    fn send_text(state: &BrokerState, from: &str, to: &str, content: &str) -> MessageId {
        state
            .send(
                &Sender::Agent(aid(from)),
                &aid(to),
                content.into(),
                MessageType::Text,
            )
            .unwrap()
    }

    #[test]
    fn register_cap_frees_slots_on_deregister() {
        let state = state();
        for n in 1..=MAX_AGENTS {
            assert_eq!(register(&state, &format!("a{n:03}")), n);
        }

        let overflow = state.register(
            aid("a101"),
            AgentName::try_new("SP-a101".to_string()).unwrap(),
            "proj".into(),
            "/tmp".into(),
        );
        assert!(matches!(
            overflow,
            Err(BrokerError::ResourceExhausted { .. })
        ));

        state.deregister(&aid("a050"));
        assert_eq!(register(&state, "a101"), MAX_AGENTS);
    }

    #[test]
    fn reregistering_existing_id_at_cap_succeeds() {
        let state = state();
        for n in 1..=MAX_AGENTS {
            register(&state, &format!("a{n:03}"));
        }
        assert_eq!(register(&state, "a001"), MAX_AGENTS);
    }

    #[test]
    fn reregister_preserves_queue() {
        let state = state();
        register(&state, "a");
        register(&state, "b");
        send_text(&state, "a", "b", "hold this");

        register(&state, "b");
        let batch = state.read(&aid("b"), false, 50).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].content, "hold this");
    }

    #[test]
    fn queue_overflow_drops_oldest_in_order() {
        let state = state();
        register(&state, "s");
        register(&state, "r");
        for n in 0..205 {
            send_text(&state, "s", "r", &format!("m{n}"));
        }

        let batch = state.read(&aid("r"), false, 500).unwrap();
        assert_eq!(batch.messages.len(), MAX_MESSAGES_PER_AGENT);
        assert_eq!(batch.messages[0].content, "m5");
        assert_eq!(batch.messages[199].content, "m204");
        assert!(!batch.has_more);
    }

    #[test]
    fn read_does_not_ack_and_ack_is_explicit() {
        let state = state();
        register(&state, "a");
        register(&state, "b");
        let id = send_text(&state, "a", "b", "hello");

        let first = state.read(&aid("b"), true, 50).unwrap();
        assert_eq!(first.messages.len(), 1);
        assert!(!first.messages[0].read);

        // Read is not an acknowledgement; the message stays unread.
        let second = state.read(&aid("b"), true, 50).unwrap();
        assert_eq!(second.messages.len(), 1);

        assert_eq!(state.ack(&aid("b"), &[id]).unwrap(), 1);
        assert!(state.read(&aid("b"), true, 50).unwrap().messages.is_empty());
        assert_eq!(state.read(&aid("b"), false, 50).unwrap().messages.len(), 1);
    }

    #[test]
    fn ack_ignores_unknown_ids_and_is_idempotent() {
        let state = state();
        register(&state, "a");
        register(&state, "b");
        let id = send_text(&state, "a", "b", "hello");

        let bogus = MessageId::new("0-zzzzzz".to_string());
        assert_eq!(state.ack(&aid("b"), &[id.clone(), bogus]).unwrap(), 1);
        assert_eq!(state.ack(&aid("b"), &[id]).unwrap(), 0);

        assert!(matches!(
            state.ack(&aid("b"), &[]),
            Err(BrokerError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn read_limit_and_has_more() {
        let state = state();
        register(&state, "a");
        register(&state, "b");
        for n in 0..5 {
            send_text(&state, "a", "b", &format!("m{n}"));
        }

        let batch = state.read(&aid("b"), true, 3).unwrap();
        assert_eq!(batch.messages.len(), 3);
        assert_eq!(batch.total, 5);
        assert!(batch.has_more);
        assert_eq!(batch.messages[0].content, "m0");
    }

    #[test]
    fn read_returns_stable_snapshot() {
        let state = state();
        register(&state, "a");
        register(&state, "b");
        send_text(&state, "a", "b", "before");

        let snapshot = state.read(&aid("b"), false, 50).unwrap();
        send_text(&state, "a", "b", "after");
        assert_eq!(snapshot.messages.len(), 1);
    }

    #[test]
    fn send_validations() {
        let state = state();
        register(&state, "b");

        let unknown_sender = state.send(
            &Sender::Agent(aid("ghost")),
            &aid("b"),
            "hi".into(),
            MessageType::Text,
        );
        assert!(matches!(
            unknown_sender,
            Err(BrokerError::InvalidArgument { .. })
        ));

        let unknown_recipient = state.send(
            &Sender::Broker,
            &aid("ghost"),
            "hi".into(),
            MessageType::Text,
        );
        assert!(matches!(unknown_recipient, Err(BrokerError::NotFound { .. })));

        let empty = state.send(&Sender::Broker, &aid("b"), String::new(), MessageType::Text);
        assert!(matches!(empty, Err(BrokerError::InvalidArgument { .. })));

        let oversized = "x".repeat(MAX_MESSAGE_CONTENT_SIZE + 1);
        let too_large = state.send(&Sender::Broker, &aid("b"), oversized, MessageType::Text);
        assert!(matches!(too_large, Err(BrokerError::PayloadTooLarge { .. })));
    }

    #[test]
    fn broker_sender_bypasses_registration_and_names_operator() {
        let state = state();
        register(&state, "b");

        state
            .send(&Sender::Broker, &aid("b"), "oi".into(), MessageType::Text)
            .unwrap();
        let batch = state.read(&aid("b"), true, 50).unwrap();
        assert_eq!(batch.messages[0].from, BROKER_SENDER);
        assert_eq!(batch.messages[0].from_name, BROKER_DISPLAY_NAME);
    }

    #[test]
    fn broadcast_skips_sender_and_generates_distinct_ids() {
        let state = state();
        register(&state, "a");
        register(&state, "b");
        register(&state, "c");

        let sent = state
            .broadcast(&Sender::Agent(aid("a")), "fan out".into(), MessageType::Code)
            .unwrap();
        assert_eq!(sent, 2);
        assert!(state.read(&aid("a"), true, 50).unwrap().messages.is_empty());

        let b = state.read(&aid("b"), true, 50).unwrap();
        let c = state.read(&aid("c"), true, 50).unwrap();
        assert_eq!(b.messages[0].kind, MessageType::Code);
        assert_ne!(b.messages[0].id, c.messages[0].id);
    }

    #[test]
    fn clear_messages_truncates() {
        let state = state();
        register(&state, "a");
        register(&state, "b");
        send_text(&state, "a", "b", "one");
        send_text(&state, "a", "b", "two");

        assert_eq!(state.clear_messages(&aid("b")).unwrap(), 2);
        assert!(state.read(&aid("b"), false, 50).unwrap().messages.is_empty());
        assert!(matches!(
            state.clear_messages(&aid("ghost")),
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[test]
    fn context_last_writer_wins() {
        let state = state();
        let key = ContextKey::try_new("api-url".to_string()).unwrap();
        state
            .set_context(key.clone(), serde_json::json!("v1"), "anyone")
            .unwrap();
        state
            .set_context(key.clone(), serde_json::json!("v2"), "anyone")
            .unwrap();
        assert_eq!(
            state.get_context(&key).unwrap().value,
            serde_json::json!("v2")
        );
    }

    #[test]
    fn context_rejects_null_and_oversized_values() {
        let state = state();
        let key = ContextKey::try_new("k".to_string()).unwrap();

        assert!(matches!(
            state.set_context(key.clone(), serde_json::Value::Null, "x"),
            Err(BrokerError::InvalidArgument { .. })
        ));

        let big = serde_json::json!("y".repeat(MAX_CONTEXT_VALUE_SIZE + 1));
        assert!(matches!(
            state.set_context(key, big, "x"),
            Err(BrokerError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn context_key_cap_only_counts_new_keys() {
        let state = state();
        for n in 0..MAX_CONTEXT_KEYS {
            state
                .set_context(
                    ContextKey::try_new(format!("k{n}")).unwrap(),
                    serde_json::json!(n),
                    "x",
                )
                .unwrap();
        }

        let fresh = state.set_context(
            ContextKey::try_new("overflow".to_string()).unwrap(),
            serde_json::json!(1),
            "x",
        );
        assert!(matches!(fresh, Err(BrokerError::ResourceExhausted { .. })));

        // Updating an existing key is always allowed.
        state
            .set_context(
                ContextKey::try_new("k0".to_string()).unwrap(),
                serde_json::json!("updated"),
                "x",
            )
            .unwrap();
    }

    #[test]
    fn context_set_by_name_snapshots_writer() {
        let state = state();
        register(&state, "writer");
        let key = ContextKey::try_new("k".to_string()).unwrap();

        state
            .set_context(key.clone(), serde_json::json!(1), "writer")
            .unwrap();
        assert_eq!(state.get_context(&key).unwrap().set_by_name, "SP-writer");

        state
            .set_context(key.clone(), serde_json::json!(2), "stranger")
            .unwrap();
        assert_eq!(state.get_context(&key).unwrap().set_by_name, "stranger");
    }

    #[test]
    fn delete_context_is_idempotent() {
        let state = state();
        let key = ContextKey::try_new("k".to_string()).unwrap();
        state
            .set_context(key.clone(), serde_json::json!(1), "x")
            .unwrap();
        state.delete_context(&key);
        state.delete_context(&key);
        assert!(matches!(
            state.get_context(&key),
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[test]
    fn status_reports_unread_counts() {
        let state = state();
        register(&state, "a");
        register(&state, "b");
        let id = send_text(&state, "a", "b", "one");
        send_text(&state, "a", "b", "two");
        state.ack(&aid("b"), &[id]).unwrap();

        let report = state.status();
        assert_eq!(report.total_agents, 2);
        let b = report
            .agents
            .iter()
            .find(|s| s.agent.id == aid("b"))
            .unwrap();
        assert_eq!(b.unread_messages, 1);
    }

    #[test]
    fn reaper_evicts_only_past_threshold() {
        let (state, clock) = state_with_manual_clock();
        register(&state, "z");

        clock.advance(Duration::from_secs(89));
        assert!(state.reap_stale(Duration::from_secs(90)).is_empty());

        clock.advance(Duration::from_secs(2));
        let evicted = state.reap_stale(Duration::from_secs(90));
        assert_eq!(evicted, vec![aid("z")]);

        assert!(matches!(
            state.heartbeat(&aid("z")),
            Err(BrokerError::NotFound { .. })
        ));
        assert!(state.agents_snapshot().is_empty());
    }

    #[test]
    fn heartbeat_defers_reaping() {
        let (state, clock) = state_with_manual_clock();
        register(&state, "z");

        clock.advance(Duration::from_secs(60));
        state.heartbeat(&aid("z")).unwrap();
        clock.advance(Duration::from_secs(60));

        assert!(state.reap_stale(Duration::from_secs(90)).is_empty());
    }

    proptest! {
        #[test]
        fn queue_stays_bounded_with_unique_ids(count in 1usize..500) {
            let state = state();
            register(&state, "s");
            register(&state, "r");
            for n in 0..count {
                send_text(&state, "s", "r", &format!("m{n}"));
            }

            let batch = state.read(&aid("r"), false, 1000).unwrap();
            prop_assert_eq!(batch.messages.len(), count.min(MAX_MESSAGES_PER_AGENT));

            let ids: HashSet<&MessageId> = batch.messages.iter().map(|m| &m.id).collect();
            prop_assert_eq!(ids.len(), batch.messages.len());

            // Overflow keeps the newest messages in arrival order.
            let first = count.saturating_sub(MAX_MESSAGES_PER_AGENT);
            prop_assert_eq!(&batch.messages[0].content, &format!("m{first}"));
        }
    }
}
