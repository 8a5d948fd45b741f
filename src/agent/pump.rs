//! Stream pumps between a local child process and the host.
//!
//! Each pump owns one direction of one session. Output pumps read at most
//! one ceiling's worth of bytes, push it, and do not read again until the
//! host has accepted it, so a slow host stalls the child rather than this
//! process's memory.

use std::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::BridgeError;
use crate::transport::protocol::{ActionId, StreamKind};
use crate::transport::Transport;

/// Run `op`, retrying transport failures with linear backoff.
pub(crate) async fn with_retry<T, F, Fut>(config: &Config, what: &str, mut op: F) -> Result<T, BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < config.retry_attempts => {
                attempt += 1;
                warn!(error = %e, attempt, "{what} failed, retrying");
                tokio::time::sleep(config.retry_backoff() * attempt).await;
            }
            result => return result,
        }
    }
}

/// Copy the session's stdin from the host into `stdin` until EOF.
///
/// Returns the number of bytes delivered.
pub(crate) async fn pump_stdin<W>(
    transport: &dyn Transport,
    config: &Config,
    id: ActionId,
    mut stdin: W,
) -> Result<u64, BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let mut offset = 0u64;
    loop {
        let chunk = with_retry(config, "stdin pull", move || transport.pull_stdin(id, offset)).await?;
        if chunk.offset != offset {
            return Err(BridgeError::Malformed(format!(
                "stdin chunk at {} while reading {offset}",
                chunk.offset
            )));
        }
        if !chunk.data.is_empty() {
            stdin.write_all(&chunk.data).await?;
            stdin.flush().await?;
            offset += chunk.data.len() as u64;
        }
        if chunk.eof {
            stdin.shutdown().await?;
            debug!(session = %id, bytes = offset, "stdin closed");
            return Ok(offset);
        }
    }
}

/// Copy `output` to the host's `kind` stream until the child closes it.
///
/// Reads at most `ceiling` bytes at a time and forwards each read as soon
/// as it returns. Returns the number of bytes delivered.
pub(crate) async fn pump_output<R>(
    transport: &dyn Transport,
    config: &Config,
    id: ActionId,
    kind: StreamKind,
    output: &mut R,
    ceiling: usize,
) -> Result<u64, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; ceiling.max(1)];
    let mut offset = 0u64;
    loop {
        let n = output.read(&mut buf).await?;
        let eof = n == 0;
        push(transport, config, id, kind, offset, Bytes::copy_from_slice(&buf[..n]), eof).await?;
        offset += n as u64;
        if eof {
            debug!(session = %id, stream = %kind, bytes = offset, "Output stream finished");
            return Ok(offset);
        }
    }
}

/// Like [`pump_output`], but once the host stops accepting output the rest
/// is read and discarded so the child never blocks on a full pipe.
pub(crate) async fn forward_output<R>(
    transport: &dyn Transport,
    config: &Config,
    id: ActionId,
    kind: StreamKind,
    mut output: R,
    ceiling: usize,
) where
    R: AsyncRead + Unpin,
{
    if let Err(e) = pump_output(transport, config, id, kind, &mut output, ceiling).await {
        warn!(session = %id, stream = %kind, error = %e, "Output pump failed, discarding the rest");
        if let Err(e) = tokio::io::copy(&mut output, &mut tokio::io::sink()).await {
            debug!(session = %id, stream = %kind, error = %e, "Discarding output failed");
        }
    }
}

/// Push one chunk, resending while the host buffer is full.
async fn push(
    transport: &dyn Transport,
    config: &Config,
    id: ActionId,
    kind: StreamKind,
    offset: u64,
    data: Bytes,
    eof: bool,
) -> Result<(), BridgeError> {
    let data = &data;
    loop {
        let ack = with_retry(config, "output push", move || {
            transport.push_output(id, kind, offset, data.clone(), eof)
        })
        .await?;
        if ack.accepted {
            return Ok(());
        }
        debug!(session = %id, stream = %kind, offset, "Host buffer full, resending");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::metaservice::MetaService;
    use crate::transport::protocol::TaskSpec;
    use crate::transport::local::LossyTransport;
    use crate::transport::LocalTransport;

    fn setup() -> (Arc<MetaService>, LocalTransport) {
        let config = Config::from_json(
            r#"{"poll_timeout_seconds": 1, "request_timeout_seconds": 5, "max_buffered_bytes": 16}"#,
        )
        .unwrap();
        let meta = Arc::new(MetaService::new(config, TaskSpec::default(), Box::new(tokio::io::sink())));
        let transport = LocalTransport::new(Arc::clone(&meta));
        (meta, transport)
    }

    #[tokio::test]
    async fn retry_gives_up_on_protocol_errors() {
        let config = Config::from_json(r#"{"retry_backoff_ms": 1}"#).unwrap();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&config, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BridgeError::StreamClosed) }
        })
        .await;
        assert!(matches!(result, Err(BridgeError::StreamClosed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retried_push_is_applied_once() {
        let (meta, _) = setup();
        let transport = LossyTransport::new(Arc::clone(&meta));
        let config = Config::from_json(r#"{"retry_backoff_ms": 1}"#).unwrap();
        let shell = meta.exec_shell(None, false).await.unwrap();

        let mut source = &b"abcdefgh"[..];
        let pumped = pump_output(&transport, &config, shell.id(), StreamKind::Stdout, &mut source, 4)
            .await
            .unwrap();
        assert_eq!(pumped, 8);
        // two data chunks and the EOF, plus the resend of the first chunk
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 4);

        let mut out = Vec::new();
        shell.stdout_pipe().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn output_pump_delivers_everything_in_order() {
        let (meta, transport) = setup();
        let shell = meta.exec_shell(None, false).await.unwrap();
        let config = meta.config().clone();

        // 100 bytes through a 16-byte host buffer: the pump has to wait for
        // the reader to acknowledge as it goes
        let data: Vec<u8> = (0..100u8).collect();
        let mut source = &data[..];
        let pump = pump_output(&transport, &config, shell.id(), StreamKind::Stdout, &mut source, 7);

        let mut out = Vec::new();
        let mut pipe = shell.stdout_pipe();
        let read = pipe.read_to_end(&mut out);
        let (pumped, read) = tokio::join!(pump, read);
        assert_eq!(pumped.unwrap(), 100);
        read.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn stdin_pump_stops_at_eof() {
        let (meta, transport) = setup();
        let shell = meta.exec_shell(None, false).await.unwrap();
        let config = meta.config().clone();

        meta.write_stdin(shell.id(), 0, b"echo HELLO\n", true).await.unwrap();
        let mut sink = Vec::new();
        let delivered = tokio::time::timeout(
            Duration::from_secs(5),
            pump_stdin(&transport, &config, shell.id(), &mut sink),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(delivered, 11);
        assert_eq!(sink, b"echo HELLO\n");
    }

    #[tokio::test]
    async fn failed_pump_keeps_draining_the_child() {
        let (_meta, transport) = setup();
        let config = Config::default();
        let data = vec![7u8; 4096];
        let mut source = &data[..];
        // no such session: the first push fails, the rest is discarded
        forward_output(&transport, &config, ActionId::new(), StreamKind::Stderr, &mut source, 64).await;
        assert!(source.is_empty());
    }
}
