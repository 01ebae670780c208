//! The message channel abstraction: an outbound send seam and an inbound
//! broadcast fan-out.
//!
//! The transport itself (HTTP, ZeroMQ, SSH tunnel, ...) lives outside this
//! crate. It implements [`MessageSender`] for the outbound direction and
//! pushes every received message into a [`MessageBus`], which fans them out
//! to any number of live subscriptions in delivery order.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use tsugite_protocol::Message;

/// Errors from the message channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel send failed: {0}")]
    Send(String),

    #[error("channel closed")]
    Closed,
}

/// Outbound half of the channel. Fire-and-forget: a returned `Ok` means the
/// transport accepted the message, not that the peer received it.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), ChannelError>;
}

/// Inbound broadcast fan-out.
///
/// Every subscriber receives every message delivered after its subscription,
/// in delivery order. A slow subscriber lags and skips rather than stalling
/// the bus.
#[derive(Clone, Debug)]
pub struct MessageBus {
    tx: broadcast::Sender<Arc<Message>>,
    capacity: usize,
}

impl MessageBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Get the per-subscriber buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver an inbound message to all subscribers.
    ///
    /// Returns the number of subscribers that received it.
    pub fn deliver(&self, message: Message) -> usize {
        self.tx.send(Arc::new(message)).unwrap_or(0)
    }

    /// Subscribe to all messages delivered from now on.
    pub fn subscribe(&self) -> MessageSubscription {
        MessageSubscription { rx: self.tx.subscribe() }
    }
}

/// A live subscription to the full inbound message stream.
pub struct MessageSubscription {
    rx: broadcast::Receiver<Arc<Message>>,
}

impl MessageSubscription {
    /// Receive the next message, waiting if necessary.
    ///
    /// Returns None when the bus is dropped.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "message subscription lagged behind");
                }
            }
        }
    }
}

impl std::fmt::Debug for MessageSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSubscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsugite_protocol::{Content, ExecuteStatus};

    fn reply_ok() -> Message {
        Message::new(Content::ExecuteReply { status: ExecuteStatus::Ok })
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message_in_order() {
        let bus = MessageBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let first = reply_ok();
        let second = reply_ok();
        let (first_id, second_id) = (first.msg_id.clone(), second.msg_id.clone());

        assert_eq!(bus.deliver(first), 2);
        assert_eq!(bus.deliver(second), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await.unwrap().msg_id, first_id);
            assert_eq!(sub.recv().await.unwrap().msg_id, second_id);
        }
    }

    #[tokio::test]
    async fn subscription_starts_at_subscribe_time() {
        let bus = MessageBus::new(16);
        bus.deliver(reply_ok());

        let mut late = bus.subscribe();
        let visible = reply_ok();
        let visible_id = visible.msg_id.clone();
        bus.deliver(visible);

        assert_eq!(late.recv().await.unwrap().msg_id, visible_id);
    }

    #[tokio::test]
    async fn recv_returns_none_after_bus_drop() {
        let bus = MessageBus::new(4);
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
