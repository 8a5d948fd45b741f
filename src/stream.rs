//! Offset-indexed, append-only byte streams.
//!
//! A [`ByteLog`] is one direction of a shell session's I/O. Writers place
//! bytes at explicit offsets so a retried push is recognised as a duplicate;
//! readers ask for the bytes at an offset, which also acknowledges (and
//! frees) everything before it. Buffered bytes are bounded: once the
//! unacknowledged window reaches capacity, writers wait.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::transport::protocol::{Chunk, PushAck};

/// One byte stream with an optional EOF mark.
pub struct ByteLog {
    state: Mutex<LogState>,
    changed: watch::Sender<()>,
    capacity: usize,
}

#[derive(Default)]
struct LogState {
    /// Offset of `buf[0]`; everything below has been acknowledged.
    start: u64,
    buf: BytesMut,
    /// Once set, never unset.
    eof: bool,
}

impl LogState {
    fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index(&self, offset: u64) -> usize {
        // callers check start <= offset <= end, so this fits in the buffer length
        (offset - self.start) as usize
    }

    fn out_of_range(&self, offset: u64) -> BridgeError {
        BridgeError::OffsetOutOfRange {
            offset,
            start: self.start,
            end: self.end(),
        }
    }

    fn check_window(&self, offset: u64) -> Result<(), BridgeError> {
        if offset < self.start || offset > self.end() {
            return Err(self.out_of_range(offset));
        }
        Ok(())
    }
}

impl ByteLog {
    /// Create an empty stream buffering at most roughly `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            state: Mutex::new(LogState::default()),
            changed,
            capacity: capacity.max(1),
        }
    }

    /// Offset one past the last byte written.
    pub fn end(&self) -> u64 {
        self.lock().end()
    }

    /// Whether the EOF mark has been set.
    pub fn is_eof(&self) -> bool {
        self.lock().eof
    }

    /// Number of written but unacknowledged bytes.
    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }

    /// Apply a chunk written at `offset`.
    ///
    /// Bytes that are already present are ignored, so resending a chunk is
    /// harmless. An offset past the current end is a gap and is rejected.
    /// If the buffer stays full for `timeout`, the chunk is not applied and
    /// the returned ack has `accepted == false`.
    pub async fn push(
        &self,
        offset: u64,
        data: &[u8],
        eof: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PushAck, BridgeError> {
        let capacity = self.capacity;
        let deadline = Instant::now() + timeout;
        let applied = self
            .wait_until(Some(deadline), cancel, |st| {
                let end = st.end();
                if offset > end {
                    return Err(st.out_of_range(offset));
                }
                let new_end = offset + data.len() as u64;
                if new_end <= end {
                    if eof && !st.eof {
                        if new_end < end {
                            return Err(BridgeError::Malformed(format!(
                                "EOF at {new_end} but stream already extends to {end}"
                            )));
                        }
                        st.eof = true;
                    }
                    return Ok(Some(PushAck { accepted: true, end }));
                }
                if st.eof {
                    return Err(BridgeError::StreamClosed);
                }
                if st.buf.len() >= capacity {
                    return Ok(None);
                }
                let skip = usize::try_from(end - offset).unwrap_or(data.len());
                st.buf.extend_from_slice(&data[skip..]);
                st.eof = eof;
                Ok(Some(PushAck {
                    accepted: true,
                    end: st.end(),
                }))
            })
            .await?;

        match applied {
            Some(ack) => {
                self.notify();
                Ok(ack)
            }
            None => Ok(PushAck {
                accepted: false,
                end: self.end(),
            }),
        }
    }

    /// Append `data` at the current end, waiting for buffer space.
    pub async fn append(&self, data: &[u8], cancel: &CancellationToken) -> Result<(), BridgeError> {
        let capacity = self.capacity;
        self.wait_until(None, cancel, |st| {
            if st.eof {
                return Err(BridgeError::StreamClosed);
            }
            if st.buf.len() >= capacity {
                return Ok(None);
            }
            st.buf.extend_from_slice(data);
            Ok(Some(()))
        })
        .await?;
        self.notify();
        Ok(())
    }

    /// Set the EOF mark. Idempotent.
    pub fn close(&self) {
        let mut st = self.lock();
        if !st.eof {
            st.eof = true;
            drop(st);
            self.notify();
        }
    }

    /// Read up to `max` bytes starting at `offset`, acknowledging everything
    /// before it.
    ///
    /// Waits up to `timeout` for bytes to arrive. Returns an empty chunk when
    /// nothing new turned up, and an empty chunk with `eof` set once the
    /// reader has caught up with a closed stream.
    pub async fn read_at(
        &self,
        offset: u64,
        max: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Chunk, BridgeError> {
        self.acknowledge(offset)?;

        let deadline = Instant::now() + timeout;
        let chunk = self
            .wait_until(Some(deadline), cancel, |st| {
                st.check_window(offset)?;
                let end = st.end();
                if end > offset {
                    let from = st.index(offset);
                    let to = from + (st.buf.len() - from).min(max);
                    let data = Bytes::copy_from_slice(&st.buf[from..to]);
                    let eof = st.eof && offset + data.len() as u64 == end;
                    return Ok(Some(Chunk { offset, data, eof }));
                }
                Ok(st.eof.then(|| Chunk {
                    offset,
                    data: Bytes::new(),
                    eof: true,
                }))
            })
            .await?;

        Ok(chunk.unwrap_or(Chunk {
            offset,
            data: Bytes::new(),
            eof: false,
        }))
    }

    /// Take up to `max` bytes from the front of the stream, waiting until
    /// bytes arrive or the stream is closed.
    ///
    /// Used by in-process readers that consume the stream directly; an empty
    /// chunk means end of stream.
    pub async fn read_next(&self, max: usize, cancel: &CancellationToken) -> Result<Chunk, BridgeError> {
        let chunk = self
            .wait_until(None, cancel, |st| {
                let offset = st.start;
                if !st.buf.is_empty() {
                    let n = st.buf.len().min(max);
                    let data = st.buf.split_to(n).freeze();
                    st.start += n as u64;
                    let eof = st.eof && st.buf.is_empty();
                    return Ok(Some(Chunk { offset, data, eof }));
                }
                Ok(st.eof.then(|| Chunk {
                    offset,
                    data: Bytes::new(),
                    eof: true,
                }))
            })
            .await?;
        self.notify();
        // no deadline, so wait_until never reports a timeout here
        chunk.ok_or(BridgeError::Cancelled)
    }

    fn acknowledge(&self, offset: u64) -> Result<(), BridgeError> {
        let mut st = self.lock();
        st.check_window(offset)?;
        if offset > st.start {
            let n = st.index(offset);
            st.buf.advance(n);
            st.start = offset;
            drop(st);
            self.notify();
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_replace(());
    }

    /// Re-run `check` against the state every time the stream changes,
    /// until it yields a value, `deadline` passes (`Ok(None)`) or `cancel`
    /// fires.
    async fn wait_until<T>(
        &self,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
        mut check: impl FnMut(&mut LogState) -> Result<Option<T>, BridgeError>,
    ) -> Result<Option<T>, BridgeError> {
        loop {
            // subscribe before checking so a change between the two is not missed
            let mut changed = self.changed.subscribe();
            let found = {
                let mut st = self.lock();
                check(&mut st)?
            };
            if let Some(value) = found {
                return Ok(Some(value));
            }
            let expired = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = changed.changed() => {}
                () = expired => return Ok(None),
                () = cancel.cancelled() => return Err(BridgeError::Cancelled),
            }
        }
    }
}
