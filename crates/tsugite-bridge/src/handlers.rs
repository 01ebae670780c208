//! Built-in command handlers.
//!
//! Each handler sends one request message, waits for the correlated terminal
//! reply, and publishes the outcome as events. Waits are bounded by the
//! bridge's configured reply timeout; a missing reply degrades to a
//! CommandFailed event rather than an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tsugite_protocol::{kinds, CommData, Content, KernelCommand, KernelEvent, KernelInfo, Message};

use crate::bridge::{BridgeError, CommandHandler, ExecutionContext};
use crate::channel::{ChannelError, MessageBus, MessageSender};
use crate::config::BridgeConfig;
use crate::correlation::await_reply;

/// Shared request/reply plumbing for the built-in handlers.
struct KernelRequest {
    sender: Arc<dyn MessageSender>,
    bus: MessageBus,
    reply_timeout: Option<Duration>,
}

impl KernelRequest {
    fn new(sender: Arc<dyn MessageSender>, bus: MessageBus, config: &BridgeConfig) -> Self {
        Self { sender, bus, reply_timeout: config.reply_timeout }
    }

    /// Send `content` and wait for the first correlated reply whose kind is
    /// in `kinds`. None means no reply arrived within the bound.
    async fn round_trip(
        &self,
        content: Content,
        kinds: &[&str],
    ) -> Result<Option<Arc<Message>>, ChannelError> {
        let request = Message::new(content);
        // Subscribe before sending so the reply cannot slip past us.
        let mut sub = self.bus.subscribe();
        self.sender.send(request.clone()).await?;
        Ok(await_reply(&mut sub, &request.msg_id, kinds, self.reply_timeout).await)
    }
}

async fn publish_no_reply(ctx: &ExecutionContext, what: &str) {
    ctx.publish(KernelEvent::CommandFailed { message: format!("no reply to {what}") }).await;
}

/// Handles SubmitCode: execute_request → execute_reply, forwarding stdout
/// stream output produced along the way.
pub struct SubmitCodeHandler {
    channel: KernelRequest,
}

impl SubmitCodeHandler {
    pub fn new(sender: Arc<dyn MessageSender>, bus: MessageBus, config: &BridgeConfig) -> Self {
        Self { channel: KernelRequest::new(sender, bus, config) }
    }
}

#[async_trait]
impl CommandHandler for SubmitCodeHandler {
    async fn handle(
        &self,
        command: KernelCommand,
        ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let KernelCommand::SubmitCode { code } = command else {
            debug!("SubmitCodeHandler ignoring unrelated command");
            return Ok(());
        };

        let request = Message::new(Content::ExecuteRequest {
            code,
            silent: false,
            store_history: true,
        });
        // Subscribe before sending so no correlated message slips past.
        let mut sub = self.channel.bus.subscribe();
        self.channel.sender.send(request.clone()).await?;

        // Stream output arrives before the terminal reply and is forwarded
        // as it lands.
        let wait = async {
            while let Some(msg) = sub.recv().await {
                if !msg.is_reply_to(&request.msg_id) {
                    continue;
                }
                match &msg.content {
                    Content::Stream { name, text } if name == "stdout" => {
                        ctx.publish(KernelEvent::StandardOutputProduced { text: text.clone() })
                            .await;
                    }
                    Content::ExecuteReply { .. } | Content::Error { .. } => return Some(msg),
                    _ => {}
                }
            }
            None
        };
        let reply = match self.channel.reply_timeout {
            Some(bound) => tokio::time::timeout(bound, wait).await.ok().flatten(),
            None => wait.await,
        };

        match reply.as_deref().map(|m| &m.content) {
            Some(Content::ExecuteReply { status }) => match status {
                tsugite_protocol::ExecuteStatus::Ok => {
                    ctx.publish(KernelEvent::CommandSucceeded).await;
                }
                tsugite_protocol::ExecuteStatus::Error => {
                    ctx.publish(KernelEvent::CommandFailed {
                        message: "execution failed".to_string(),
                    })
                    .await;
                }
            },
            Some(Content::Error { ename, evalue }) => {
                ctx.publish(KernelEvent::CommandFailed { message: format!("{ename}: {evalue}") })
                    .await;
            }
            _ => publish_no_reply(ctx, "execute_request").await,
        }
        Ok(())
    }
}

/// Handles RequestKernelInfo: kernel_info_request → kernel_info_reply.
///
/// The KernelInfoProduced event it publishes is the one the bridge rewrites
/// after value-adapter negotiation.
pub struct RequestKernelInfoHandler {
    channel: KernelRequest,
}

impl RequestKernelInfoHandler {
    pub fn new(sender: Arc<dyn MessageSender>, bus: MessageBus, config: &BridgeConfig) -> Self {
        Self { channel: KernelRequest::new(sender, bus, config) }
    }
}

#[async_trait]
impl CommandHandler for RequestKernelInfoHandler {
    async fn handle(
        &self,
        command: KernelCommand,
        ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let KernelCommand::RequestKernelInfo = command else {
            debug!("RequestKernelInfoHandler ignoring unrelated command");
            return Ok(());
        };

        let reply = self
            .channel
            .round_trip(Content::KernelInfoRequest {}, &[kinds::KERNEL_INFO_REPLY])
            .await?;

        match reply.as_deref().map(|m| &m.content) {
            Some(Content::KernelInfoReply { language_name, supported_commands }) => {
                ctx.publish(KernelEvent::KernelInfoProduced {
                    kernel_info: KernelInfo {
                        language_name: language_name.clone(),
                        supported_commands: supported_commands.clone(),
                    },
                })
                .await;
            }
            _ => publish_no_reply(ctx, "kernel_info_request").await,
        }
        Ok(())
    }
}

/// Handles RequestCompletions: complete_request → complete_reply.
pub struct RequestCompletionsHandler {
    channel: KernelRequest,
}

impl RequestCompletionsHandler {
    pub fn new(sender: Arc<dyn MessageSender>, bus: MessageBus, config: &BridgeConfig) -> Self {
        Self { channel: KernelRequest::new(sender, bus, config) }
    }
}

#[async_trait]
impl CommandHandler for RequestCompletionsHandler {
    async fn handle(
        &self,
        command: KernelCommand,
        ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let KernelCommand::RequestCompletions { code, cursor_pos } = command else {
            debug!("RequestCompletionsHandler ignoring unrelated command");
            return Ok(());
        };

        let reply = self
            .channel
            .round_trip(Content::CompleteRequest { code, cursor_pos }, &[kinds::COMPLETE_REPLY])
            .await?;

        match reply.as_deref().map(|m| &m.content) {
            Some(Content::CompleteReply { matches, cursor_start, cursor_end }) => {
                ctx.publish(KernelEvent::CompletionsProduced {
                    matches: matches.clone(),
                    cursor_start: *cursor_start,
                    cursor_end: *cursor_end,
                })
                .await;
            }
            _ => publish_no_reply(ctx, "complete_request").await,
        }
        Ok(())
    }
}

/// Handles RequestHoverText: inspect_request → inspect_reply.
///
/// The reply payload is forwarded opaquely as mime-keyed data.
pub struct RequestHoverTextHandler {
    channel: KernelRequest,
}

impl RequestHoverTextHandler {
    pub fn new(sender: Arc<dyn MessageSender>, bus: MessageBus, config: &BridgeConfig) -> Self {
        Self { channel: KernelRequest::new(sender, bus, config) }
    }
}

#[async_trait]
impl CommandHandler for RequestHoverTextHandler {
    async fn handle(
        &self,
        command: KernelCommand,
        ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let KernelCommand::RequestHoverText { code, cursor_pos } = command else {
            debug!("RequestHoverTextHandler ignoring unrelated command");
            return Ok(());
        };

        let reply = self
            .channel
            .round_trip(
                Content::InspectRequest { code, cursor_pos, detail_level: 0 },
                &[kinds::INSPECT_REPLY],
            )
            .await?;

        match reply.as_deref().map(|m| &m.content) {
            Some(Content::InspectReply { found: true, data }) => {
                ctx.publish(KernelEvent::HoverTextProduced { content: data.clone() }).await;
            }
            Some(Content::InspectReply { found: false, .. }) => {
                ctx.publish(KernelEvent::HoverTextProduced { content: CommData::new() }).await;
            }
            _ => publish_no_reply(ctx, "inspect_request").await,
        }
        Ok(())
    }
}
