//! In-process transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ByteStream, Transport};
use crate::error::BridgeError;
use crate::metaservice::MetaService;
use crate::transport::protocol::{Action, ActionId, Chunk, PushAck, ReplyStatus, ShellResult, StreamKind, TaskSpec};

/// Transport calling a [`MetaService`] in the same process.
pub struct LocalTransport {
    service: Arc<MetaService>,
}

impl LocalTransport {
    pub const fn new(service: Arc<MetaService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn ping(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn poll_action(&self) -> Result<Option<Action>, BridgeError> {
        let timeout = self.service.config().poll_timeout();
        self.service.poll_next_action(timeout).await
    }

    async fn reply(&self, id: ActionId, status: ReplyStatus, body: ByteStream) -> Result<(), BridgeError> {
        self.service.reply(id, status, body).await
    }

    async fn pull_stdin(&self, id: ActionId, offset: u64) -> Result<Chunk, BridgeError> {
        self.service.pull_stdin(id, offset).await
    }

    async fn push_output(
        &self,
        id: ActionId,
        kind: StreamKind,
        offset: u64,
        data: Bytes,
        eof: bool,
    ) -> Result<PushAck, BridgeError> {
        self.service.push_output(id, kind, offset, &data, eof).await
    }

    async fn post_result(&self, id: ActionId, result: &ShellResult) -> Result<(), BridgeError> {
        self.service.post_result(id, result.clone()).await
    }

    async fn fetch_task(&self) -> Result<TaskSpec, BridgeError> {
        Ok(self.service.task().clone())
    }

    async fn send_log(&self, body: ByteStream) -> Result<(), BridgeError> {
        self.service.append_log(body).await
    }

    async fn report_task(&self, success: bool) -> Result<(), BridgeError> {
        self.service.report_task(success)
    }
}

/// Wraps [`LocalTransport`], applying the first push and result post but
/// reporting them as channel failures, as when a response is lost.
#[cfg(test)]
pub(crate) struct LossyTransport {
    inner: LocalTransport,
    lose_push: std::sync::atomic::AtomicBool,
    lose_result: std::sync::atomic::AtomicBool,
    pub(crate) pushes: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl LossyTransport {
    pub(crate) fn new(service: Arc<MetaService>) -> Self {
        Self {
            inner: LocalTransport::new(service),
            lose_push: true.into(),
            lose_result: true.into(),
            pushes: 0.into(),
        }
    }

    /// A real `reqwest::Error`, built without touching the network.
    async fn lost() -> BridgeError {
        match reqwest::Client::new().get("not a url").send().await {
            Err(e) => BridgeError::Transport(e),
            Ok(_) => BridgeError::Cancelled,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for LossyTransport {
    async fn ping(&self) -> Result<(), BridgeError> {
        self.inner.ping().await
    }

    async fn poll_action(&self) -> Result<Option<Action>, BridgeError> {
        self.inner.poll_action().await
    }

    async fn reply(&self, id: ActionId, status: ReplyStatus, body: ByteStream) -> Result<(), BridgeError> {
        self.inner.reply(id, status, body).await
    }

    async fn pull_stdin(&self, id: ActionId, offset: u64) -> Result<Chunk, BridgeError> {
        self.inner.pull_stdin(id, offset).await
    }

    async fn push_output(
        &self,
        id: ActionId,
        kind: StreamKind,
        offset: u64,
        data: Bytes,
        eof: bool,
    ) -> Result<PushAck, BridgeError> {
        use std::sync::atomic::Ordering;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let ack = self.inner.push_output(id, kind, offset, data, eof).await?;
        if self.lose_push.swap(false, Ordering::SeqCst) {
            return Err(Self::lost().await);
        }
        Ok(ack)
    }

    async fn post_result(&self, id: ActionId, result: &ShellResult) -> Result<(), BridgeError> {
        self.inner.post_result(id, result).await?;
        if self.lose_result.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(Self::lost().await);
        }
        Ok(())
    }

    async fn fetch_task(&self) -> Result<TaskSpec, BridgeError> {
        self.inner.fetch_task().await
    }

    async fn send_log(&self, body: ByteStream) -> Result<(), BridgeError> {
        self.inner.send_log(body).await
    }

    async fn report_task(&self, success: bool) -> Result<(), BridgeError> {
        self.inner.report_task(success).await
    }
}
