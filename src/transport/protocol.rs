//! Wire types exchanged between the host meta-service and the guest agent.
//!
//! Control messages are JSON. Stream chunks and artifacts travel as raw
//! bodies with their offset and EOF mark carried in headers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the offset of the first byte in a chunk body.
pub const STREAM_OFFSET_HEADER: &str = "x-stream-offset";

/// Header set to `true` when the chunk ends at the stream's EOF mark.
pub const STREAM_EOF_HEADER: &str = "x-stream-eof";

/// Identifier of an action. Shell sessions share the id of their action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(Uuid);

impl ActionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ActionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A unit of work dispatched from host to guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    /// Upload the file at `path`.
    GetArtifact { id: ActionId, path: String },
    /// Reply with every file below `path`.
    ListFolder { id: ActionId, path: String },
    /// Start `command` (or the default shell) and stream its I/O.
    ExecShell {
        id: ActionId,
        #[serde(default)]
        command: Option<Vec<String>>,
        #[serde(default)]
        tty: bool,
    },
}

impl Action {
    pub const fn id(&self) -> ActionId {
        match self {
            Self::GetArtifact { id, .. } | Self::ListFolder { id, .. } | Self::ExecShell { id, .. } => {
                *id
            }
        }
    }

    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::GetArtifact { .. } => ActionKind::GetArtifact,
            Self::ListFolder { .. } => ActionKind::ListFolder,
            Self::ExecShell { .. } => ActionKind::ExecShell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    GetArtifact,
    ListFolder,
    ExecShell,
}

/// Lifecycle of an action. Ordered: an action only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionState {
    Pending,
    Claimed,
    Streaming,
    Completed,
}

/// How the guest resolved a `get-artifact` or `list-folder` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyStatus {
    Ok,
    NotFound,
    Error,
}

/// Body of a successful `list-folder` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderListing {
    pub files: Vec<String>,
}

/// The three byte streams of a shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous run of stream bytes starting at `offset`.
///
/// An empty `data` with `eof == false` is a long-poll timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
    pub eof: bool,
}

/// Host acknowledgement of a pushed chunk.
///
/// `accepted == false` means the stream buffer was full for the whole
/// long-poll window; the pusher resends the same chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub accepted: bool,
    pub end: u64,
}

/// Final outcome of a shell session.
///
/// `success == false` with no error means the command ran and failed;
/// a populated `error` means it never started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShellResult {
    pub const fn exited(success: bool) -> Self {
        Self { success, error: None }
    }

    pub fn spawn_failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Body of the caller-facing `POST /shell`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellRequest {
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub tty: bool,
}

/// Response of the caller-facing `POST /shell`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShellCreated {
    pub id: ActionId,
}

/// The task the guest runs on startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}
