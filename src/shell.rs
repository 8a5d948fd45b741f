//! Host-side handle to a shell running in the guest.
//!
//! The pipes present the session's byte logs as ordinary
//! [`AsyncWrite`]/[`AsyncRead`] halves. Nothing here talks to the guest
//! directly; the guest agent pulls stdin and pushes output through the
//! meta-service while these adapters read and write the same logs.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::session::Session;
use crate::transport::protocol::{ActionId, Chunk, StreamKind};

/// Handle returned by [`MetaService::exec_shell`](crate::metaservice::MetaService::exec_shell).
///
/// Stdout and stderr must be drained concurrently with [`wait`](Self::wait):
/// the guest stops pushing output once the host buffer is full, and a shell
/// blocked on output never exits.
pub struct ShellHandle {
    session: Arc<Session>,
    cancel: CancellationToken,
    chunk_size: usize,
}

impl ShellHandle {
    pub(crate) const fn new(session: Arc<Session>, cancel: CancellationToken, chunk_size: usize) -> Self {
        Self {
            session,
            cancel,
            chunk_size,
        }
    }

    pub fn id(&self) -> ActionId {
        self.session.id
    }

    /// Writer feeding the shell's stdin. Shutting it down marks stdin EOF.
    pub fn stdin_pipe(&self) -> StdinPipe {
        StdinPipe {
            session: Arc::clone(&self.session),
            cancel: self.cancel.clone(),
            chunk_size: self.chunk_size,
            pending: None,
            closed: false,
        }
    }

    /// Reader over the shell's stdout. Every reader consumes from the same
    /// position, so bytes read through one are not seen by another.
    pub fn stdout_pipe(&self) -> OutputPipe {
        self.output_pipe(StreamKind::Stdout)
    }

    /// Reader over the shell's stderr.
    pub fn stderr_pipe(&self) -> OutputPipe {
        self.output_pipe(StreamKind::Stderr)
    }

    /// Wait for the shell to finish.
    ///
    /// `Ok(true)` if it exited with status zero, `Ok(false)` if it ran and
    /// failed, [`BridgeError::Spawn`] if the guest could not start it.
    /// Does not wait for output to be drained.
    pub async fn wait(&self) -> Result<bool, BridgeError> {
        let result = self.session.result.wait(&self.cancel).await?;
        match result.error {
            Some(error) => Err(BridgeError::Spawn(error)),
            None => Ok(result.success),
        }
    }

    fn output_pipe(&self, kind: StreamKind) -> OutputPipe {
        OutputPipe {
            session: Arc::clone(&self.session),
            kind,
            cancel: self.cancel.clone(),
            chunk_size: self.chunk_size,
            pending: None,
            leftover: Bytes::new(),
        }
    }
}

fn into_io(err: BridgeError) -> io::Error {
    match err {
        BridgeError::Io(e) => e,
        BridgeError::StreamClosed => io::Error::new(io::ErrorKind::BrokenPipe, err),
        BridgeError::Cancelled => io::Error::new(io::ErrorKind::ConnectionAborted, err),
        other => io::Error::other(other),
    }
}

/// Writable end of a shell's stdin.
pub struct StdinPipe {
    session: Arc<Session>,
    cancel: CancellationToken,
    chunk_size: usize,
    pending: Option<BoxFuture<'static, Result<usize, BridgeError>>>,
    closed: bool,
}

impl AsyncWrite for StdinPipe {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(into_io(BridgeError::StreamClosed)));
        }
        let this = &mut *self;
        let mut write: BoxFuture<'static, Result<usize, BridgeError>> = match this.pending.take() {
            Some(write) => write,
            None => {
                // one chunk per write keeps the stdin buffer near its bound
                let data = Bytes::copy_from_slice(&buf[..buf.len().min(this.chunk_size)]);
                let session = Arc::clone(&this.session);
                let cancel = this.cancel.clone();
                Box::pin(async move {
                    session.stdin.append(&data, &cancel).await?;
                    Ok(data.len())
                })
            }
        };
        match write.as_mut().poll(cx) {
            Poll::Pending => {
                this.pending = Some(write);
                Poll::Pending
            }
            Poll::Ready(written) => Poll::Ready(written.map_err(into_io)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(pending) = self.pending.as_mut() {
            let written = ready!(pending.as_mut().poll(cx));
            self.pending = None;
            written.map_err(into_io)?;
        }
        self.closed = true;
        self.session.stdin.close();
        Poll::Ready(Ok(()))
    }
}

/// Readable end of a shell's stdout or stderr.
pub struct OutputPipe {
    session: Arc<Session>,
    kind: StreamKind,
    cancel: CancellationToken,
    chunk_size: usize,
    pending: Option<BoxFuture<'static, Result<Chunk, BridgeError>>>,
    leftover: Bytes,
}

impl AsyncRead for OutputPipe {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let this = &mut *self;
        if this.leftover.is_empty() {
            let mut read: BoxFuture<'static, Result<Chunk, BridgeError>> = match this.pending.take() {
                Some(read) => read,
                None => {
                    let want = buf.remaining().min(this.chunk_size);
                    let session = Arc::clone(&this.session);
                    let cancel = this.cancel.clone();
                    let kind = this.kind;
                    Box::pin(async move { session.stream(kind).read_next(want, &cancel).await })
                }
            };
            let chunk = match read.as_mut().poll(cx) {
                Poll::Pending => {
                    this.pending = Some(read);
                    return Poll::Pending;
                }
                Poll::Ready(chunk) => chunk,
            };
            // an empty chunk is end of stream: return without filling buf
            this.leftover = chunk.map_err(into_io)?.data;
        }
        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover[..n]);
        this.leftover.advance(n);
        Poll::Ready(Ok(()))
    }
}
