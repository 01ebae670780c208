//! Reply correlation over the inbound broadcast stream.
//!
//! Pure stream transformation: a caller subscribes, sends its request, then
//! waits for the first message matching its correlation criteria. Messages
//! that do not match are skipped by that caller only — other subscribers
//! still observe them on their own subscriptions.
//!
//! Every wait takes an explicit timeout. `None` means unbounded, which is
//! the reference behavior; callers that cannot tolerate a hang pass a bound.

use std::sync::Arc;
use std::time::Duration;

use tsugite_protocol::Message;

use crate::channel::MessageSubscription;

/// Wait for the first message satisfying `pred`, bounded by `timeout`.
///
/// Returns None on timeout or if the bus closes first.
pub async fn first_match<F>(
    sub: &mut MessageSubscription,
    timeout: Option<Duration>,
    pred: F,
) -> Option<Arc<Message>>
where
    F: Fn(&Message) -> bool,
{
    let wait = async {
        while let Some(msg) = sub.recv().await {
            if pred(&msg) {
                return Some(msg);
            }
        }
        None
    };

    match timeout {
        Some(bound) => tokio::time::timeout(bound, wait).await.ok().flatten(),
        None => wait.await,
    }
}

/// Wait for the first reply to `parent_id` whose content kind is one of
/// `kinds`. Replies belonging to other requests never match.
pub async fn await_reply(
    sub: &mut MessageSubscription,
    parent_id: &str,
    kinds: &[&str],
    timeout: Option<Duration>,
) -> Option<Arc<Message>> {
    first_match(sub, timeout, |msg| {
        msg.is_reply_to(parent_id) && kinds.contains(&msg.content.kind())
    })
    .await
}

/// Wait for the first message scoped to `comm_id` whose content kind is one
/// of `kinds`.
pub async fn await_comm_message(
    sub: &mut MessageSubscription,
    comm_id: &str,
    kinds: &[&str],
    timeout: Option<Duration>,
) -> Option<Arc<Message>> {
    first_match(sub, timeout, |msg| {
        msg.content.comm_id() == Some(comm_id) && kinds.contains(&msg.content.kind())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsugite_protocol::{kinds, CommData, Content, ExecuteStatus};

    use crate::channel::MessageBus;

    #[tokio::test]
    async fn reply_matches_only_its_own_request() {
        let bus = MessageBus::new(16);
        let mut sub = bus.subscribe();

        let mine = Message::new(Content::ExecuteRequest {
            code: "a".into(),
            silent: true,
            store_history: false,
        });
        let other = Message::new(Content::ExecuteRequest {
            code: "b".into(),
            silent: true,
            store_history: false,
        });

        // A concurrent request's reply arrives first and must be skipped.
        bus.deliver(Message::reply_to(&other, Content::ExecuteReply {
            status: ExecuteStatus::Error,
        }));
        let expected = Message::reply_to(&mine, Content::ExecuteReply { status: ExecuteStatus::Ok });
        let expected_id = expected.msg_id.clone();
        bus.deliver(expected);

        let got = await_reply(
            &mut sub,
            &mine.msg_id,
            &[kinds::EXECUTE_REPLY, kinds::ERROR],
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
        assert_eq!(got.msg_id, expected_id);
    }

    #[tokio::test]
    async fn non_terminal_kinds_are_skipped() {
        let bus = MessageBus::new(16);
        let mut sub = bus.subscribe();

        let request = Message::new(Content::KernelInfoRequest {});
        // A reply of the wrong kind, correlated to the same parent.
        bus.deliver(Message::reply_to(&request, Content::ExecuteReply {
            status: ExecuteStatus::Ok,
        }));
        bus.deliver(Message::reply_to(&request, Content::KernelInfoReply {
            language_name: "python".into(),
            supported_commands: vec![],
        }));

        let got = await_reply(
            &mut sub,
            &request.msg_id,
            &[kinds::KERNEL_INFO_REPLY],
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
        assert_eq!(got.content.kind(), kinds::KERNEL_INFO_REPLY);
    }

    #[tokio::test]
    async fn timeout_yields_none() {
        let bus = MessageBus::new(4);
        let mut sub = bus.subscribe();

        let got = await_reply(&mut sub, "nobody", &[kinds::EXECUTE_REPLY], Some(Duration::from_millis(20))).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn comm_wait_is_scoped_to_the_comm_id() {
        let bus = MessageBus::new(16);
        let mut sub = bus.subscribe();

        bus.deliver(Message::new(Content::CommMsg {
            comm_id: "other".into(),
            data: CommData::new(),
        }));
        bus.deliver(Message::new(Content::CommClose {
            comm_id: "mine".into(),
            data: CommData::new(),
        }));

        let got = await_comm_message(
            &mut sub,
            "mine",
            &[kinds::COMM_MSG, kinds::COMM_CLOSE],
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
        assert_eq!(got.content.kind(), kinds::COMM_CLOSE);
        assert_eq!(got.content.comm_id(), Some("mine"));
    }
}
