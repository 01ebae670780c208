//! Value-adapter negotiation: the dynamic capability discovery that decides,
//! at runtime, whether a connected kernel supports value sharing.
//!
//! # Handshake
//!
//! ```text
//! ValueAdapterFactory.negotiate(kernel_info)
//!     │
//!     ├── 1. look up a definition for the language (absent → Unsupported)
//!     ├── 2. run its bootstrap code via execute_request, await the
//!     │      correlated terminal reply (error → Unsupported, no comm)
//!     ├── 3. open a comm against "value_adapter_comm"
//!     ├── 4. await the first comm_msg/comm_close on that comm, bounded by
//!     │      the configured handshake timeout
//!     └── 5. KernelReady ack → CommValueAdapter bound to the agent;
//!            anything else → Unsupported
//! ```
//!
//! Negotiation failures degrade to "capability absent" — they are outcomes,
//! not errors. Only a channel fault surfaces as `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tsugite_protocol::{
    kinds, AdapterProtocolError, CommData, Content, ExecuteStatus, FormattedValue, KernelCommand,
    KernelEvent, KernelInfo, Message, ValueAdapterCommand, ValueAdapterEvent, ValueInfo,
};

use crate::bridge::{BridgeError, CommandHandler, ExecutionContext};
use crate::channel::{ChannelError, MessageBus, MessageSender};
use crate::comms::{CommAgent, CommError, CommManager};
use crate::config::BridgeConfig;
use crate::correlation::await_reply;

/// Well-known comm target name the in-kernel handler registers.
pub const VALUE_ADAPTER_TARGET: &str = "value_adapter_comm";

/// Errors talking to a negotiated adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] AdapterProtocolError),

    #[error("adapter comm closed by remote")]
    CommClosed,

    #[error("timed out waiting for adapter reply")]
    Timeout,
}

/// A per-language adapter definition: knows how to bootstrap the in-kernel
/// handler. The code itself is opaque to this layer.
pub trait ValueAdapterDefinition: Send + Sync {
    /// Language this definition targets, lowercase.
    fn language(&self) -> &str;

    /// Code that, when executed on the kernel, registers the comm target
    /// under `target_name` and acks with a KernelReady comm message.
    fn bootstrap_code(&self, target_name: &str) -> String;
}

/// Bootstrap for IPython kernels.
pub struct PythonValueAdapterDefinition;

const PYTHON_BOOTSTRAP: &str = r#"
def __tsugite_register_value_adapter():
    import json

    class __TsugiteValueAdapter:
        def __init__(self):
            self._comm = None

        def on_open(self, comm, msg):
            self._comm = comm
            comm.on_msg(self.on_msg)
            self._send({'eventType': 'KernelReady', 'event': None, 'command': None})

        def on_msg(self, msg):
            try:
                envelope = json.loads(msg['content']['data']['commandOrEvent'])
                command_type = envelope['commandType']
                if command_type == 'RequestValueInfos':
                    self._send(self._value_infos())
                elif command_type == 'RequestValue':
                    self._send(self._value(envelope['command']))
                elif command_type == 'SendValue':
                    self._send(self._set_value(envelope['command']))
                else:
                    self._fail('command "%s" not supported' % command_type)
            except Exception as e:
                self._fail('failed to process comm data. %s' % str(e))

        def _value_infos(self):
            infos = [{'name': k, 'nativeType': str(type(v))}
                     for k, v in globals().items()
                     if not k.startswith('_') and str(type(v)) != "<class 'module'>"]
            return {'eventType': 'ValueInfosProduced', 'event': {'valueInfos': infos}}

        def _value(self, command):
            name = command['name']
            if name not in globals():
                return {'eventType': 'CommandFailed',
                        'event': {'message': 'Variable "%s" not found.' % name}}
            return {'eventType': 'ValueProduced',
                    'event': {'name': name, 'value': globals()[name],
                              'formattedValue': {'mimeType': command.get('mimeType', 'application/json'),
                                                 'value': None}}}

        def _set_value(self, command):
            import json
            name = command['name']
            if not str.isidentifier(name):
                return {'eventType': 'CommandFailed',
                        'event': {'message': 'Invalid identifier "%s"' % name}}
            formatted = command['formattedValue']
            mime_type = formatted.get('mimeType', '')
            if mime_type != 'application/json':
                return {'eventType': 'CommandFailed',
                        'event': {'message': 'Failed to set value for "%s". "%s" mimetype not supported.'
                                             % (name, mime_type)}}
            globals()[name] = json.loads(formatted['value'])
            return {'eventType': 'CommandSucceeded', 'event': None}

        def _fail(self, message):
            self._send({'eventType': 'CommandFailed', 'event': {'message': message}})

        def _send(self, envelope):
            self._comm.send({'commandOrEvent': json.dumps(envelope, default=str)})

    get_ipython().kernel.comm_manager.register_target(
        '__TARGET_NAME__', __TsugiteValueAdapter().on_open)

__tsugite_register_value_adapter()
del __tsugite_register_value_adapter
"#;

impl ValueAdapterDefinition for PythonValueAdapterDefinition {
    fn language(&self) -> &str {
        "python"
    }

    fn bootstrap_code(&self, target_name: &str) -> String {
        PYTHON_BOOTSTRAP.replace("__TARGET_NAME__", target_name)
    }
}

/// Outcome of a negotiation attempt.
pub enum Negotiation {
    /// No adapter for this language; the optional capability is absent.
    Unsupported,
    /// An adapter is available. `fresh` is true the first time the language
    /// negotiates successfully, so handlers are registered exactly once.
    Ready {
        adapter: Arc<CommValueAdapter>,
        fresh: bool,
    },
}

/// Looks up, bootstraps, and caches per-language value adapters.
pub struct ValueAdapterFactory {
    definitions: DashMap<String, Arc<dyn ValueAdapterDefinition>>,
    /// Successful negotiations per language. The lock also serializes
    /// concurrent handshakes for the same connection.
    negotiated: Mutex<HashMap<String, Arc<CommValueAdapter>>>,
    sender: Arc<dyn MessageSender>,
    bus: MessageBus,
    reply_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
}

impl ValueAdapterFactory {
    /// Create a factory with the stock definitions (python) registered.
    pub fn new(sender: Arc<dyn MessageSender>, bus: MessageBus, config: &BridgeConfig) -> Self {
        let factory = Self {
            definitions: DashMap::new(),
            negotiated: Mutex::new(HashMap::new()),
            sender,
            bus,
            reply_timeout: config.reply_timeout,
            handshake_timeout: config.handshake_timeout,
        };
        factory.register_definition(Arc::new(PythonValueAdapterDefinition));
        factory
    }

    /// Register (or replace) an adapter definition for its language.
    pub fn register_definition(&self, definition: Arc<dyn ValueAdapterDefinition>) {
        self.definitions.insert(definition.language().to_lowercase(), definition);
    }

    /// Negotiate an adapter for the announced language.
    ///
    /// Idempotent per language: once an adapter is obtained it is reused for
    /// the remainder of the connection. Failed handshakes are not cached, so
    /// a later kernel-info event retries.
    pub async fn negotiate(
        &self,
        comms: &CommManager,
        kernel_info: &KernelInfo,
    ) -> Result<Negotiation, CommError> {
        let language = kernel_info.language_name.to_lowercase();
        let Some(definition) = self.definitions.get(&language).map(|d| d.clone()) else {
            return Ok(Negotiation::Unsupported);
        };

        let mut negotiated = self.negotiated.lock().await;
        if let Some(adapter) = negotiated.get(&language) {
            return Ok(Negotiation::Ready { adapter: adapter.clone(), fresh: false });
        }

        let bootstrapped = self
            .run_on_kernel(definition.bootstrap_code(VALUE_ADAPTER_TARGET))
            .await?;
        if !bootstrapped {
            info!(%language, "value adapter bootstrap failed, capability absent");
            return Ok(Negotiation::Unsupported);
        }

        // Subscribe before opening so the ack cannot slip past us.
        let mut sub = self.bus.subscribe();
        let agent = comms.open_comm(VALUE_ADAPTER_TARGET, None, CommData::new()).await?;

        let response = crate::correlation::await_comm_message(
            &mut sub,
            agent.comm_id(),
            &[kinds::COMM_MSG, kinds::COMM_CLOSE],
            self.handshake_timeout,
        )
        .await;

        let ready = match response.as_deref().map(|m| &m.content) {
            Some(Content::CommMsg { data, .. }) => {
                matches!(ValueAdapterEvent::from_comm_data(data), Ok(ValueAdapterEvent::KernelReady))
            }
            Some(_) | None => false,
        };

        if !ready {
            info!(%language, comm_id = %agent.comm_id(), "value adapter handshake failed, capability absent");
            return Ok(Negotiation::Unsupported);
        }

        info!(%language, comm_id = %agent.comm_id(), "value adapter negotiated");
        let adapter = Arc::new(CommValueAdapter::new(agent, self.reply_timeout));
        negotiated.insert(language, adapter.clone());
        Ok(Negotiation::Ready { adapter, fresh: true })
    }

    /// Execute bootstrap code on the kernel and wait for a definitive pass
    /// or fail.
    async fn run_on_kernel(&self, code: String) -> Result<bool, CommError> {
        let request = Message::new(Content::ExecuteRequest {
            code,
            silent: true,
            store_history: false,
        });

        let mut sub = self.bus.subscribe();
        self.sender.send(request.clone()).await.map_err(CommError::Channel)?;

        let reply = await_reply(
            &mut sub,
            &request.msg_id,
            &[kinds::EXECUTE_REPLY, kinds::ERROR],
            self.reply_timeout,
        )
        .await;

        Ok(matches!(
            reply.as_deref().map(|m| &m.content),
            Some(Content::ExecuteReply { status: ExecuteStatus::Ok })
        ))
    }
}

impl std::fmt::Debug for ValueAdapterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueAdapterFactory")
            .field("definitions", &self.definitions.len())
            .finish_non_exhaustive()
    }
}

/// A negotiated capability: requests variable values and metadata over the
/// adapter comm for the remainder of the connection.
pub struct CommValueAdapter {
    agent: Arc<CommAgent>,
    reply_timeout: Option<Duration>,
}

impl CommValueAdapter {
    fn new(agent: Arc<CommAgent>, reply_timeout: Option<Duration>) -> Self {
        Self { agent, reply_timeout }
    }

    /// The comm this adapter is bound to.
    pub fn comm_id(&self) -> &str {
        self.agent.comm_id()
    }

    /// Request a single variable's value.
    pub async fn request_value(
        &self,
        name: &str,
        mime_type: &str,
    ) -> Result<ValueAdapterEvent, AdapterError> {
        self.exchange(ValueAdapterCommand::RequestValue {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
        })
        .await
    }

    /// Request the kernel's variable listing.
    pub async fn request_value_infos(&self) -> Result<ValueAdapterEvent, AdapterError> {
        self.exchange(ValueAdapterCommand::RequestValueInfos).await
    }

    /// Assign a value to a variable in the kernel. The formatted value's
    /// payload is a JSON string the in-kernel handler decodes.
    pub async fn send_value(
        &self,
        name: &str,
        formatted_value: FormattedValue,
    ) -> Result<ValueAdapterEvent, AdapterError> {
        self.exchange(ValueAdapterCommand::SendValue {
            name: name.to_string(),
            formatted_value,
        })
        .await
    }

    async fn exchange(&self, command: ValueAdapterCommand) -> Result<ValueAdapterEvent, AdapterError> {
        let mut sub = self.agent.messages();
        self.agent.send_data(command.to_comm_data()?).await?;

        let wait = async {
            while let Some(msg) = sub.recv().await {
                match &msg.content {
                    Content::CommMsg { data, .. } => {
                        return ValueAdapterEvent::from_comm_data(data).map_err(AdapterError::from);
                    }
                    Content::CommClose { .. } => return Err(AdapterError::CommClosed),
                    _ => {}
                }
            }
            Err(AdapterError::CommClosed)
        };

        match self.reply_timeout {
            Some(bound) => tokio::time::timeout(bound, wait).await.map_err(|_| AdapterError::Timeout)?,
            None => wait.await,
        }
    }
}

impl std::fmt::Debug for CommValueAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommValueAdapter").field("comm_id", &self.comm_id()).finish_non_exhaustive()
    }
}

/// Dispatch-table handler bound to a negotiated adapter. Registered for
/// RequestValue and RequestValueInfos once negotiation succeeds.
pub(crate) struct ValueCommandHandler {
    adapter: Arc<CommValueAdapter>,
}

impl ValueCommandHandler {
    pub(crate) fn new(adapter: Arc<CommValueAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl CommandHandler for ValueCommandHandler {
    async fn handle(
        &self,
        command: KernelCommand,
        ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        match command {
            KernelCommand::RequestValue { name, mime_type } => {
                match self.adapter.request_value(&name, &mime_type).await {
                    Ok(ValueAdapterEvent::ValueProduced { name, value, formatted_value }) => {
                        ctx.publish(KernelEvent::ValueProduced {
                            name,
                            value,
                            mime_type: formatted_value.mime_type,
                        })
                        .await;
                    }
                    Ok(ValueAdapterEvent::CommandFailed { message }) => {
                        ctx.publish(KernelEvent::CommandFailed { message }).await;
                    }
                    Ok(other) => {
                        warn!(?other, "unexpected adapter reply to RequestValue");
                        ctx.publish(KernelEvent::CommandFailed {
                            message: "unexpected adapter reply".to_string(),
                        })
                        .await;
                    }
                    Err(e) => {
                        ctx.publish(KernelEvent::CommandFailed { message: e.to_string() }).await;
                    }
                }
            }
            KernelCommand::RequestValueInfos => {
                match self.adapter.request_value_infos().await {
                    Ok(ValueAdapterEvent::ValueInfosProduced { value_infos }) => {
                        let value_infos = value_infos
                            .into_iter()
                            .map(|i| ValueInfo { name: i.name, native_type: i.native_type })
                            .collect();
                        ctx.publish(KernelEvent::ValueInfosProduced { value_infos }).await;
                    }
                    Ok(ValueAdapterEvent::CommandFailed { message }) => {
                        ctx.publish(KernelEvent::CommandFailed { message }).await;
                    }
                    Ok(other) => {
                        warn!(?other, "unexpected adapter reply to RequestValueInfos");
                        ctx.publish(KernelEvent::CommandFailed {
                            message: "unexpected adapter reply".to_string(),
                        })
                        .await;
                    }
                    Err(e) => {
                        ctx.publish(KernelEvent::CommandFailed { message: e.to_string() }).await;
                    }
                }
            }
            other => {
                debug!(kind = %other.kind(), "value handler ignoring unrelated command");
            }
        }
        Ok(())
    }
}
