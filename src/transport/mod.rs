//! Guest-side channel to the host meta-service.
//!
//! [`Transport`] is the set of calls the agent makes against the host.
//! [`HttpTransport`] speaks the `/engine/v1` HTTP protocol; [`LocalTransport`]
//! calls an in-process [`MetaService`](crate::metaservice::MetaService)
//! directly and is what the agent's own tests run against.

pub mod http;
pub mod local;
pub mod protocol;

pub use http::HttpTransport;
pub use local::LocalTransport;
pub use protocol::{Action, ActionId, Chunk, PushAck, ReplyStatus, ShellResult, StreamKind, TaskSpec};

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::BridgeError;

/// Body uploaded to the host: artifact content or task log.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Calls the guest agent makes against the host.
///
/// Long-polling calls return empty results on timeout rather than errors.
/// Every call is safe to repeat after a [`BridgeError::Transport`] failure
/// except the two uploads, whose bodies are consumed by the first attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Succeeds once the host is reachable.
    async fn ping(&self) -> Result<(), BridgeError>;

    /// Long-poll for the next action. `None` on timeout.
    async fn poll_action(&self) -> Result<Option<Action>, BridgeError>;

    /// Answer a `get-artifact` or `list-folder` action.
    async fn reply(&self, id: ActionId, status: ReplyStatus, body: ByteStream) -> Result<(), BridgeError>;

    /// Long-poll the session's stdin at `offset`.
    async fn pull_stdin(&self, id: ActionId, offset: u64) -> Result<Chunk, BridgeError>;

    /// Push a stdout or stderr chunk starting at `offset`.
    async fn push_output(
        &self,
        id: ActionId,
        kind: StreamKind,
        offset: u64,
        data: Bytes,
        eof: bool,
    ) -> Result<PushAck, BridgeError>;

    /// Post the session's final result.
    async fn post_result(&self, id: ActionId, result: &ShellResult) -> Result<(), BridgeError>;

    /// The task this guest was started to run.
    async fn fetch_task(&self) -> Result<TaskSpec, BridgeError>;

    /// Stream the task's output to the host log.
    async fn send_log(&self, body: ByteStream) -> Result<(), BridgeError>;

    /// Report the task outcome.
    async fn report_task(&self, success: bool) -> Result<(), BridgeError>;
}
