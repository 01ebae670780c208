//! The wire envelope and the closed registry of content payload kinds.
//!
//! A [`Message`] is created by the sender and immutable once sent. Replies
//! reference the message that caused them through `parent_id`, which is what
//! the correlation layer keys on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque key/value payload carried by comm traffic.
pub type CommData = serde_json::Map<String, Value>;

/// Wire names for the known content kinds.
///
/// Kept as constants so correlation waits can name their terminal kinds
/// without constructing a content value.
pub mod kinds {
    pub const COMM_OPEN: &str = "comm_open";
    pub const COMM_MSG: &str = "comm_msg";
    pub const COMM_CLOSE: &str = "comm_close";
    pub const EXECUTE_REQUEST: &str = "execute_request";
    pub const EXECUTE_REPLY: &str = "execute_reply";
    pub const KERNEL_INFO_REQUEST: &str = "kernel_info_request";
    pub const KERNEL_INFO_REPLY: &str = "kernel_info_reply";
    pub const INTERRUPT_REQUEST: &str = "interrupt_request";
    pub const COMPLETE_REQUEST: &str = "complete_request";
    pub const COMPLETE_REPLY: &str = "complete_reply";
    pub const INSPECT_REQUEST: &str = "inspect_request";
    pub const INSPECT_REPLY: &str = "inspect_reply";
    pub const STREAM: &str = "stream";
    pub const ERROR: &str = "error";
}

/// Status of an `execute_reply`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    Ok,
    Error,
}

/// Closed set of known content payloads.
///
/// Unrecognized kinds never enter this type; transports drop or reject them
/// before delivery. The serde tag matches the Jupyter wire name.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    CommOpen {
        comm_id: String,
        target_name: String,
        #[serde(default)]
        data: CommData,
    },
    CommMsg {
        comm_id: String,
        #[serde(default)]
        data: CommData,
    },
    CommClose {
        comm_id: String,
        #[serde(default)]
        data: CommData,
    },
    ExecuteRequest {
        code: String,
        silent: bool,
        store_history: bool,
    },
    ExecuteReply {
        status: ExecuteStatus,
    },
    KernelInfoRequest {},
    KernelInfoReply {
        language_name: String,
        #[serde(default)]
        supported_commands: Vec<String>,
    },
    InterruptRequest {},
    CompleteRequest {
        code: String,
        cursor_pos: usize,
    },
    CompleteReply {
        matches: Vec<String>,
        cursor_start: usize,
        cursor_end: usize,
    },
    InspectRequest {
        code: String,
        cursor_pos: usize,
        detail_level: u8,
    },
    InspectReply {
        found: bool,
        #[serde(default)]
        data: CommData,
    },
    Stream {
        name: String,
        text: String,
    },
    Error {
        ename: String,
        evalue: String,
    },
}

impl Content {
    /// The wire kind tag for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CommOpen { .. } => kinds::COMM_OPEN,
            Self::CommMsg { .. } => kinds::COMM_MSG,
            Self::CommClose { .. } => kinds::COMM_CLOSE,
            Self::ExecuteRequest { .. } => kinds::EXECUTE_REQUEST,
            Self::ExecuteReply { .. } => kinds::EXECUTE_REPLY,
            Self::KernelInfoRequest {} => kinds::KERNEL_INFO_REQUEST,
            Self::KernelInfoReply { .. } => kinds::KERNEL_INFO_REPLY,
            Self::InterruptRequest {} => kinds::INTERRUPT_REQUEST,
            Self::CompleteRequest { .. } => kinds::COMPLETE_REQUEST,
            Self::CompleteReply { .. } => kinds::COMPLETE_REPLY,
            Self::InspectRequest { .. } => kinds::INSPECT_REQUEST,
            Self::InspectReply { .. } => kinds::INSPECT_REPLY,
            Self::Stream { .. } => kinds::STREAM,
            Self::Error { .. } => kinds::ERROR,
        }
    }

    /// The comm id for comm-scoped payloads, if any.
    pub fn comm_id(&self) -> Option<&str> {
        match self {
            Self::CommOpen { comm_id, .. }
            | Self::CommMsg { comm_id, .. }
            | Self::CommClose { comm_id, .. } => Some(comm_id),
            _ => None,
        }
    }
}

/// The wire-level envelope exchanged over the message channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier assigned at creation.
    pub msg_id: String,
    /// Identifier of the message this one replies to, if any.
    pub parent_id: Option<String>,
    /// Typed content payload.
    pub content: Content,
}

impl Message {
    /// Create a fresh message with a generated id and no parent.
    pub fn new(content: Content) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            parent_id: None,
            content,
        }
    }

    /// Create a reply correlated to `parent`.
    pub fn reply_to(parent: &Message, content: Content) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            parent_id: Some(parent.msg_id.clone()),
            content,
        }
    }

    /// The wire kind tag of this message's content.
    pub fn msg_type(&self) -> &'static str {
        self.content.kind()
    }

    /// Whether this message is a reply to the given message id.
    pub fn is_reply_to(&self, parent_id: &str) -> bool {
        self.parent_id.as_deref() == Some(parent_id)
    }
}
