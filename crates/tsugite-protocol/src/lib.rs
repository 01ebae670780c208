//! Protocol types for Tsugite.
//!
//! This crate is the wire-facing foundation: the message envelope exchanged
//! with a Jupyter-style kernel, the command/event model the bridge dispatches
//! on, and the value-sharing protocol spoken over the adapter comm. It has
//! **no internal tsugite dependencies** — a pure leaf crate.
//!
//! # Key Types
//!
//! | Type               | Purpose                                     |
//! |--------------------|---------------------------------------------|
//! | [`Message`]        | Wire envelope (id + parent id + content)    |
//! | [`Content`]        | Closed registry of known payload kinds      |
//! | [`KernelCommand`]  | Typed request entering the bridge           |
//! | [`KernelEvent`]    | Typed notification leaving the bridge       |
//! | [`CommandOrEvent`] | Tagged union on the outbound stream         |
//! | [`KernelInfo`]     | Remote kernel metadata (language, commands) |

pub mod command;
pub mod message;
pub mod valueshare;

// Re-export primary types at crate root for convenience.
pub use command::{CommandKind, CommandOrEvent, KernelCommand, KernelEvent, KernelInfo, ValueInfo};
pub use message::{kinds, CommData, Content, ExecuteStatus, Message};
pub use valueshare::{
    AdapterProtocolError, FormattedValue, KernelValueInfo, ValueAdapterCommand, ValueAdapterEvent,
};
