//! The command dispatch bridge: maps typed commands onto per-kind handlers
//! and publishes the resulting events on a shared outbound stream.
//!
//! # Architecture
//!
//! ```text
//! send_command(cmd) ──► handlers[kind] ──► handler.handle(cmd, ctx, cancel)
//!                                              │
//!                            sends requests ◄──┤──► ctx.publish(event)
//!                            over the channel  │         │
//!                                              ▼         ▼
//!                                     correlated    outbound broadcast
//!                                     reply waits   of CommandOrEvent
//! ```
//!
//! The bridge is deliberately one-directional: commands flow toward the
//! remote kernel, events flow back to subscribers. Forwarding an event *to*
//! the remote peer is unimplemented and returns
//! [`BridgeError::EventForwardingUnsupported`].
//!
//! Kernel-info events are special-cased: before one reaches any subscriber,
//! the bridge negotiates a value adapter for the announced language and, on
//! success, rewrites the event to declare the RequestValue and
//! RequestValueInfos commands.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tsugite_protocol::{
    CommandKind, CommandOrEvent, Content, KernelCommand, KernelEvent, KernelInfo, Message,
};

use crate::channel::{ChannelError, MessageBus, MessageSender};
use crate::comms::{CommError, CommManager};
use crate::config::BridgeConfig;
use crate::handlers::{
    RequestCompletionsHandler, RequestHoverTextHandler, RequestKernelInfoHandler, SubmitCodeHandler,
};
use crate::value_adapter::{Negotiation, ValueAdapterFactory, ValueCommandHandler};

/// Errors from the dispatch bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Events cannot be forwarded to the remote kernel in this design.
    #[error("forwarding events to the remote kernel is not implemented")]
    EventForwardingUnsupported,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Comm(#[from] CommError),
}

/// An asynchronous handler for one command kind.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: KernelCommand,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError>;
}

/// Bridge state shared with execution contexts. Instance-scoped: tied to one
/// connection, torn down with the bridge.
struct BridgeInner {
    handlers: DashMap<CommandKind, Arc<dyn CommandHandler>>,
    events_tx: broadcast::Sender<CommandOrEvent>,
    sender: Arc<dyn MessageSender>,
    comms: CommManager,
    adapters: ValueAdapterFactory,
}

impl BridgeInner {
    /// Publish an event to all subscribers, in publish order.
    ///
    /// Kernel-info events are rewritten (after adapter negotiation) before
    /// any subscriber can observe them.
    async fn publish(&self, event: KernelEvent) {
        let event = match event {
            KernelEvent::KernelInfoProduced { kernel_info } => {
                self.rewrite_kernel_info(kernel_info).await
            }
            other => other,
        };
        let _ = self.events_tx.send(CommandOrEvent::from_event(event));
    }

    async fn rewrite_kernel_info(&self, mut kernel_info: KernelInfo) -> KernelEvent {
        match self.adapters.negotiate(&self.comms, &kernel_info).await {
            Ok(Negotiation::Ready { adapter, fresh }) => {
                if fresh {
                    let handler: Arc<dyn CommandHandler> = Arc::new(ValueCommandHandler::new(adapter));
                    self.handlers.insert(CommandKind::RequestValue, handler.clone());
                    self.handlers.insert(CommandKind::RequestValueInfos, handler);
                }
                for kind in [CommandKind::RequestValue, CommandKind::RequestValueInfos] {
                    let name = kind.to_string();
                    if !kernel_info.supported_commands.contains(&name) {
                        kernel_info.supported_commands.push(name);
                    }
                }
            }
            Ok(Negotiation::Unsupported) => {
                debug!(language = %kernel_info.language_name, "no value adapter for language");
            }
            Err(e) => {
                warn!(language = %kernel_info.language_name, error = %e, "value adapter negotiation failed");
            }
        }
        KernelEvent::KernelInfoProduced { kernel_info }
    }
}

/// Bridges a command/event execution model onto the message channel.
pub struct CommandEventBridge {
    inner: Arc<BridgeInner>,
}

impl CommandEventBridge {
    /// Create a bridge with the built-in handlers (SubmitCode,
    /// RequestKernelInfo, RequestCompletions, RequestHoverText) registered.
    pub fn new(sender: Arc<dyn MessageSender>, bus: MessageBus, config: BridgeConfig) -> Self {
        let bridge = Self::without_default_handlers(sender.clone(), bus.clone(), config.clone());

        bridge.register_handler(
            CommandKind::SubmitCode,
            Arc::new(SubmitCodeHandler::new(sender.clone(), bus.clone(), &config)),
        );
        bridge.register_handler(
            CommandKind::RequestKernelInfo,
            Arc::new(RequestKernelInfoHandler::new(sender.clone(), bus.clone(), &config)),
        );
        bridge.register_handler(
            CommandKind::RequestCompletions,
            Arc::new(RequestCompletionsHandler::new(sender.clone(), bus.clone(), &config)),
        );
        bridge.register_handler(
            CommandKind::RequestHoverText,
            Arc::new(RequestHoverTextHandler::new(sender, bus, &config)),
        );

        bridge
    }

    /// Create a bridge with an empty dispatch table.
    ///
    /// Must be called from within a tokio runtime (the comm manager spawns
    /// its inbound listener).
    pub fn without_default_handlers(
        sender: Arc<dyn MessageSender>,
        bus: MessageBus,
        config: BridgeConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(config.channel_capacity);
        let comms = CommManager::new(sender.clone(), bus.clone());
        let adapters = ValueAdapterFactory::new(sender.clone(), bus, &config);

        Self {
            inner: Arc::new(BridgeInner {
                handlers: DashMap::new(),
                events_tx,
                sender,
                comms,
                adapters,
            }),
        }
    }

    /// Register a handler for a command kind. Last registration wins;
    /// replacement is silent.
    pub fn register_handler(&self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        self.inner.handlers.insert(kind, handler);
    }

    /// Dispatch a command to its registered handler.
    ///
    /// A command with no registered handler is dropped silently — this
    /// tolerates capability skew between bridge versions rather than
    /// aborting the session. If `cancel` is already set when the handler
    /// finishes, a best-effort out-of-band interrupt is sent to the remote
    /// kernel; its delivery is not guaranteed.
    pub async fn send_command(
        &self,
        command: KernelCommand,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let kind = command.kind();
        let handler = self.inner.handlers.get(&kind).map(|h| h.clone());

        match handler {
            Some(handler) => {
                debug!(%kind, "dispatching command");
                let ctx = ExecutionContext { inner: self.inner.clone() };
                handler.handle(command, &ctx, cancel.clone()).await?;
            }
            None => {
                debug!(%kind, "no handler registered, dropping command");
            }
        }

        if cancel.is_cancelled() {
            if let Err(e) = self.inner.sender.send(Message::new(Content::InterruptRequest {})).await {
                warn!(error = %e, "failed to send best-effort interrupt request");
            }
        }

        Ok(())
    }

    /// Forward an event to the remote kernel.
    ///
    /// Unimplemented in this deliberately one-directional bridge.
    pub async fn send_event(&self, _event: KernelEvent) -> Result<(), BridgeError> {
        Err(BridgeError::EventForwardingUnsupported)
    }

    /// Publish an event to all subscribers.
    pub async fn publish(&self, event: KernelEvent) {
        self.inner.publish(event).await;
    }

    /// Subscribe to the outbound CommandOrEvent stream.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription { rx: self.inner.events_tx.subscribe() }
    }

    /// The comm lifecycle manager for this connection.
    pub fn comms(&self) -> &CommManager {
        &self.inner.comms
    }

    /// The value-adapter factory for this connection.
    pub fn adapters(&self) -> &ValueAdapterFactory {
        &self.inner.adapters
    }

    /// An execution context detached from any particular dispatch; useful
    /// for hosts that publish events directly.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext { inner: self.inner.clone() }
    }
}

impl std::fmt::Debug for CommandEventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEventBridge")
            .field("handlers", &self.inner.handlers.len())
            .field("comms", &self.inner.comms)
            .finish_non_exhaustive()
    }
}

/// Shared execution context passed to handlers: publish events and register
/// further handlers mid-flight.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<BridgeInner>,
}

impl ExecutionContext {
    /// Publish an event on the bridge's outbound stream.
    pub async fn publish(&self, event: KernelEvent) {
        self.inner.publish(event).await;
    }

    /// Register a handler for a command kind. Last registration wins.
    pub fn register_handler(&self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        self.inner.handlers.insert(kind, handler);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

/// A subscription to the outbound CommandOrEvent stream.
pub struct EventSubscription {
    rx: broadcast::Receiver<CommandOrEvent>,
}

impl EventSubscription {
    /// Receive the next CommandOrEvent, waiting if necessary.
    ///
    /// Returns None when the bridge is dropped.
    pub async fn recv(&mut self) -> Option<CommandOrEvent> {
        loop {
            match self.rx.recv().await {
                Ok(coe) => return Some(coe),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event subscription lagged behind");
                }
            }
        }
    }

    /// Try to receive without waiting. Returns None if nothing is pending.
    pub fn try_recv(&mut self) -> Option<CommandOrEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(coe) => return Some(coe),
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(lagged = n, "event subscription lagged behind");
                }
            }
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription").finish_non_exhaustive()
    }
}
