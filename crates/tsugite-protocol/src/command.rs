//! The command/event model the bridge dispatches on.
//!
//! Commands are typed requests entering the bridge; events are typed
//! notifications leaving it. Both are plain data records — the bridge never
//! validates their fields beyond dispatching by [`CommandKind`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::EnumDiscriminants;
use uuid::Uuid;

use crate::message::CommData;

/// Metadata describing a connected kernel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    /// The kernel's implementation language (e.g. "python").
    pub language_name: String,
    /// Names of the commands the kernel declares support for.
    pub supported_commands: Vec<String>,
}

/// Name and native type of a variable held by the remote kernel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub native_type: Option<String>,
}

/// A typed request to perform an action on the remote kernel.
///
/// The [`CommandKind`] discriminant is the dispatch table key: a closed tag,
/// no runtime type lookup.
#[derive(Clone, Debug, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(CommandKind), derive(Hash, strum::Display))]
pub enum KernelCommand {
    /// Submit code for execution.
    SubmitCode { code: String },
    /// Ask the kernel to describe itself.
    RequestKernelInfo,
    /// Request completions at a cursor position.
    RequestCompletions { code: String, cursor_pos: usize },
    /// Request hover text at a cursor position.
    RequestHoverText { code: String, cursor_pos: usize },
    /// Request a variable's value (available once a value adapter is negotiated).
    RequestValue { name: String, mime_type: String },
    /// Request the list of variables (available once a value adapter is negotiated).
    RequestValueInfos,
}

impl KernelCommand {
    /// The dispatch tag for this command.
    pub fn kind(&self) -> CommandKind {
        CommandKind::from(self)
    }
}

/// A typed notification of progress or result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KernelEvent {
    /// The remote kernel announced its metadata.
    KernelInfoProduced { kernel_info: KernelInfo },
    /// A command finished successfully.
    CommandSucceeded,
    /// A command failed.
    CommandFailed { message: String },
    /// Completions arrived for a RequestCompletions command.
    CompletionsProduced {
        matches: Vec<String>,
        cursor_start: usize,
        cursor_end: usize,
    },
    /// Hover text arrived for a RequestHoverText command. The payload is
    /// forwarded opaquely as mime-keyed data.
    HoverTextProduced { content: CommData },
    /// A variable's value arrived from the negotiated adapter.
    ValueProduced {
        name: String,
        value: Value,
        mime_type: String,
    },
    /// The variable listing arrived from the negotiated adapter.
    ValueInfosProduced { value_infos: Vec<ValueInfo> },
    /// Text the executing code wrote to stdout.
    StandardOutputProduced { text: String },
}

/// Exactly one command or one event, sharing the bridge's outbound stream.
///
/// Commands carry an opaque correlation token assigned when sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CommandOrEvent {
    Command {
        command: KernelCommand,
        token: String,
    },
    Event(KernelEvent),
}

impl CommandOrEvent {
    /// Wrap a command, assigning a fresh correlation token.
    pub fn from_command(command: KernelCommand) -> Self {
        Self::Command {
            command,
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Wrap an event.
    pub fn from_event(event: KernelEvent) -> Self {
        Self::Event(event)
    }

    /// The wrapped event, if this is one.
    pub fn event(&self) -> Option<&KernelEvent> {
        match self {
            Self::Event(e) => Some(e),
            Self::Command { .. } => None,
        }
    }

    /// The wrapped command, if this is one.
    pub fn command(&self) -> Option<&KernelCommand> {
        match self {
            Self::Command { command, .. } => Some(command),
            Self::Event(_) => None,
        }
    }
}
