//! Comm lifecycle management: logical bidirectional sub-channels multiplexed
//! over the single message channel.
//!
//! # Architecture
//!
//! ```text
//! CommManager
//!     │
//!     ├── targets: name ──► CommTarget (accepts remote-initiated opens)
//!     │
//!     └── agents: comm_id ──► CommAgent (handle to one open comm)
//!             └── messages(): full stream filtered to the comm id
//! ```
//!
//! Per comm id the lifecycle is `unopened → open → closed`, closed being
//! terminal: once removed from the active set an id is never rebound.
//! Either side may open or close. A remote open for an unregistered target
//! is answered with a `comm_close` carrying a human-readable reason and
//! never enters the active set.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use tsugite_protocol::{CommData, Content, Message};

use crate::channel::{ChannelError, MessageBus, MessageSender, MessageSubscription};

/// Errors from comm lifecycle operations.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("comm target '{0}' is already registered")]
    DuplicateTarget(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// A named local factory invoked when the remote side opens a comm against
/// this name. Lives for the connection's lifetime.
pub trait CommTarget: Send + Sync {
    /// The target name the remote side addresses.
    fn name(&self) -> &str;

    /// Called synchronously when the remote side opens a comm for this
    /// target, so the target can begin interacting immediately.
    fn on_comm_open(&self, agent: Arc<CommAgent>, data: &CommData);
}

/// Local handle to one open comm.
///
/// Sends are automatically tagged with the comm id; the message stream is
/// the full channel stream filtered to this id.
pub struct CommAgent {
    comm_id: String,
    sender: Arc<dyn MessageSender>,
    bus: MessageBus,
}

impl CommAgent {
    fn new(comm_id: String, sender: Arc<dyn MessageSender>, bus: MessageBus) -> Self {
        Self { comm_id, sender, bus }
    }

    /// The opaque comm id.
    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    /// Subscribe to this comm's traffic.
    ///
    /// The filter is applied per subscription, not cached: every caller gets
    /// an independent live view of the comm.
    pub fn messages(&self) -> CommSubscription {
        CommSubscription {
            comm_id: self.comm_id.clone(),
            inner: self.bus.subscribe(),
        }
    }

    /// Send a `comm_msg` tagged with this comm's id.
    pub async fn send_data(&self, data: CommData) -> Result<(), ChannelError> {
        self.sender
            .send(Message::new(Content::CommMsg { comm_id: self.comm_id.clone(), data }))
            .await
    }

    /// Send a `comm_close` tagged with this comm's id.
    pub async fn close(&self, data: CommData) -> Result<(), ChannelError> {
        self.sender
            .send(Message::new(Content::CommClose { comm_id: self.comm_id.clone(), data }))
            .await
    }
}

impl std::fmt::Debug for CommAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommAgent").field("comm_id", &self.comm_id).finish_non_exhaustive()
    }
}

/// A subscription filtered to one comm id.
pub struct CommSubscription {
    comm_id: String,
    inner: MessageSubscription,
}

impl CommSubscription {
    /// Receive the next message scoped to this comm, waiting if necessary.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        loop {
            let msg = self.inner.recv().await?;
            if msg.content.comm_id() == Some(self.comm_id.as_str()) {
                return Some(msg);
            }
        }
    }
}

/// Owns the set of open comms and the registered targets, and services
/// remote-initiated open/close traffic from a background task.
pub struct CommManager {
    targets: Arc<DashMap<String, Arc<dyn CommTarget>>>,
    agents: Arc<DashMap<String, Arc<CommAgent>>>,
    sender: Arc<dyn MessageSender>,
    bus: MessageBus,
    listener: JoinHandle<()>,
}

impl CommManager {
    /// Create a manager and spawn its inbound listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sender: Arc<dyn MessageSender>, bus: MessageBus) -> Self {
        let targets: Arc<DashMap<String, Arc<dyn CommTarget>>> = Arc::new(DashMap::new());
        let agents: Arc<DashMap<String, Arc<CommAgent>>> = Arc::new(DashMap::new());

        let listener = tokio::spawn(listen(
            bus.subscribe(),
            targets.clone(),
            agents.clone(),
            sender.clone(),
            bus.clone(),
        ));

        Self { targets, agents, sender, bus, listener }
    }

    /// Register a target that accepts remote-initiated comm opens.
    ///
    /// Registering a second target under the same name fails; the first
    /// registration remains active.
    pub fn register_target(&self, target: Arc<dyn CommTarget>) -> Result<(), CommError> {
        let name = target.name().to_string();
        match self.targets.entry(name.clone()) {
            dashmap::Entry::Occupied(_) => Err(CommError::DuplicateTarget(name)),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(target);
                Ok(())
            }
        }
    }

    /// Open a comm against a remote target.
    ///
    /// If `comm_id` names an already-active comm, the existing agent is
    /// reused and no duplicate entry is made. Otherwise an agent is created
    /// (with a generated id when none is supplied), registered, and a
    /// `comm_open` is sent. The open is fire-and-forget: the remote side's
    /// acceptance or rejection arrives asynchronously as comm traffic.
    pub async fn open_comm(
        &self,
        target_name: &str,
        comm_id: Option<String>,
        data: CommData,
    ) -> Result<Arc<CommAgent>, CommError> {
        let agent = match comm_id {
            Some(id) => match self.agents.entry(id.clone()) {
                dashmap::Entry::Occupied(existing) => existing.get().clone(),
                dashmap::Entry::Vacant(slot) => {
                    let agent = Arc::new(CommAgent::new(id, self.sender.clone(), self.bus.clone()));
                    slot.insert(agent.clone());
                    agent
                }
            },
            None => {
                let id = Uuid::new_v4().to_string();
                let agent = Arc::new(CommAgent::new(id.clone(), self.sender.clone(), self.bus.clone()));
                self.agents.insert(id, agent.clone());
                agent
            }
        };

        self.sender
            .send(Message::new(Content::CommOpen {
                comm_id: agent.comm_id().to_string(),
                target_name: target_name.to_string(),
                data,
            }))
            .await?;

        debug!(comm_id = %agent.comm_id(), target = target_name, "opened comm");
        Ok(agent)
    }

    /// Look up the agent for an active comm id.
    pub fn agent(&self, comm_id: &str) -> Option<Arc<CommAgent>> {
        self.agents.get(comm_id).map(|a| a.clone())
    }

    /// Number of comms in the active set.
    pub fn active_count(&self) -> usize {
        self.agents.len()
    }
}

impl Drop for CommManager {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for CommManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommManager")
            .field("targets", &self.targets.len())
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}

/// Inbound loop: services remote comm_open and comm_close traffic.
async fn listen(
    mut sub: MessageSubscription,
    targets: Arc<DashMap<String, Arc<dyn CommTarget>>>,
    agents: Arc<DashMap<String, Arc<CommAgent>>>,
    sender: Arc<dyn MessageSender>,
    bus: MessageBus,
) {
    while let Some(msg) = sub.recv().await {
        match &msg.content {
            Content::CommClose { comm_id, .. } => {
                // Unknown ids are a silent no-op.
                if agents.remove(comm_id).is_some() {
                    debug!(%comm_id, "comm closed by remote");
                }
            }
            Content::CommOpen { comm_id, target_name, data } => {
                handle_remote_open(&targets, &agents, &sender, &bus, comm_id, target_name, data)
                    .await;
            }
            _ => {}
        }
    }
}

async fn handle_remote_open(
    targets: &DashMap<String, Arc<dyn CommTarget>>,
    agents: &DashMap<String, Arc<CommAgent>>,
    sender: &Arc<dyn MessageSender>,
    bus: &MessageBus,
    comm_id: &str,
    target_name: &str,
    data: &CommData,
) {
    if target_name.is_empty() || comm_id.is_empty() {
        warn!(%comm_id, target = target_name, "rejecting comm open with missing fields");
        reject(sender, comm_id, "comm_open requires a target name and a comm id".to_string()).await;
        return;
    }

    let Some(target) = targets.get(target_name).map(|t| t.clone()) else {
        warn!(%comm_id, target = target_name, "rejecting comm open for unregistered target");
        reject(sender, comm_id, format!("Comm target '{target_name}' is not registered on the client")).await;
        return;
    };

    // Rebinding a live comm id would cross-wire two peers; refuse it.
    if agents.contains_key(comm_id) {
        warn!(%comm_id, target = target_name, "rejecting comm open for an id already in use");
        reject(sender, comm_id, format!("Comm id '{comm_id}' is already in use")).await;
        return;
    }

    let agent = Arc::new(CommAgent::new(comm_id.to_string(), sender.clone(), bus.clone()));
    agents.insert(comm_id.to_string(), agent.clone());
    debug!(%comm_id, target = target_name, "comm opened by remote");
    target.on_comm_open(agent, data);
}

async fn reject(sender: &Arc<dyn MessageSender>, comm_id: &str, reason: String) {
    let mut data = CommData::new();
    data.insert("reason".to_string(), serde_json::Value::String(reason));
    let close = Message::new(Content::CommClose { comm_id: comm_id.to_string(), data });
    if let Err(e) = sender.send(close).await {
        warn!(%comm_id, error = %e, "failed to send comm close rejection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tsugite_protocol::kinds;

    struct RecordingSender {
        sent: Mutex<Vec<Message>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()) })
        }

        async fn sent(&self) -> Vec<Message> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, message: Message) -> Result<(), ChannelError> {
            self.sent.lock().await.push(message);
            Ok(())
        }
    }

    struct NoopTarget(&'static str);

    impl CommTarget for NoopTarget {
        fn name(&self) -> &str {
            self.0
        }

        fn on_comm_open(&self, _agent: Arc<CommAgent>, _data: &CommData) {}
    }

    #[tokio::test]
    async fn duplicate_target_registration_fails_and_first_stays() {
        let sender = RecordingSender::new();
        let manager = CommManager::new(sender, MessageBus::new(16));

        manager.register_target(Arc::new(NoopTarget("viz"))).unwrap();
        let err = manager.register_target(Arc::new(NoopTarget("viz"))).unwrap_err();
        assert!(matches!(err, CommError::DuplicateTarget(name) if name == "viz"));
        assert!(manager.targets.contains_key("viz"));
    }

    #[tokio::test]
    async fn open_comm_generates_fresh_ids() {
        let sender = RecordingSender::new();
        let manager = CommManager::new(sender.clone(), MessageBus::new(16));

        let a = manager.open_comm("t", None, CommData::new()).await.unwrap();
        let b = manager.open_comm("t", None, CommData::new()).await.unwrap();
        assert_ne!(a.comm_id(), b.comm_id());
        assert_eq!(manager.active_count(), 2);

        let sent = sender.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.content.kind() == kinds::COMM_OPEN));
    }

    #[tokio::test]
    async fn open_comm_with_known_id_reuses_the_agent() {
        let sender = RecordingSender::new();
        let manager = CommManager::new(sender, MessageBus::new(16));

        let a = manager.open_comm("t", Some("fixed".into()), CommData::new()).await.unwrap();
        let b = manager.open_comm("t", Some("fixed".into()), CommData::new()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn agent_subscriptions_are_independent_live_filters() {
        let sender = RecordingSender::new();
        let bus = MessageBus::new(16);
        let manager = CommManager::new(sender, bus.clone());

        let agent = manager.open_comm("t", Some("c9".into()), CommData::new()).await.unwrap();
        let mut first = agent.messages();
        let mut second = agent.messages();

        bus.deliver(Message::new(Content::CommMsg { comm_id: "unrelated".into(), data: CommData::new() }));
        bus.deliver(Message::new(Content::CommMsg { comm_id: "c9".into(), data: CommData::new() }));

        assert_eq!(first.recv().await.unwrap().content.comm_id(), Some("c9"));
        assert_eq!(second.recv().await.unwrap().content.comm_id(), Some("c9"));
    }
}
