//! Tsugite bridge core: routes typed commands onto a Jupyter-style message
//! channel and turns correlated replies back into typed events.
//!
//! The transport is external: it implements [`MessageSender`] and feeds
//! inbound traffic into a [`MessageBus`]. Everything above that — dispatch,
//! correlation, comm lifecycle, value-adapter negotiation — lives here.
//!
//! ```ignore
//! let bus = MessageBus::new(1024);
//! let bridge = CommandEventBridge::new(transport, bus.clone(), BridgeConfig::default());
//!
//! let mut events = bridge.subscribe();
//! bridge.send_command(KernelCommand::RequestKernelInfo, CancellationToken::new()).await?;
//!
//! while let Some(coe) = events.recv().await {
//!     println!("observed: {coe:?}");
//! }
//! ```

pub mod bridge;
pub mod channel;
pub mod comms;
pub mod config;
pub mod correlation;
pub mod handlers;
pub mod value_adapter;

// Re-export primary types at crate root for convenience.
pub use bridge::{BridgeError, CommandEventBridge, CommandHandler, EventSubscription, ExecutionContext};
pub use channel::{ChannelError, MessageBus, MessageSender, MessageSubscription};
pub use comms::{CommAgent, CommError, CommManager, CommSubscription, CommTarget};
pub use config::BridgeConfig;
pub use value_adapter::{
    AdapterError, CommValueAdapter, Negotiation, PythonValueAdapterDefinition,
    ValueAdapterDefinition, ValueAdapterFactory, VALUE_ADAPTER_TARGET,
};
