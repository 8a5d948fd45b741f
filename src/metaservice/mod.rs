//! Host-side meta-service.
//!
//! The single authority over actions and shell sessions. Host callers ask
//! for artifacts, folder listings and shells; the guest agent long-polls for
//! the resulting actions, carries them out and reports back through the
//! guest-facing operations here. [`http::router`] exposes both sides over
//! HTTP.

pub mod http;

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::BridgeError;
use crate::session::{ResultSlot, Session, SessionRegistry};
use crate::shell::ShellHandle;
use crate::transport::protocol::{
    Action, ActionId, ActionKind, ActionState, Chunk, FolderListing, PushAck, ReplyStatus, ShellResult,
    StreamKind, TaskSpec,
};

/// Upper bound on a collected reply body (folder listings, error messages).
const MAX_REPLY_SIZE: usize = 64 * 1024 * 1024;

/// Artifact chunks buffered between the guest upload and the host reader.
const ARTIFACT_CHANNEL_DEPTH: usize = 8;

/// How the guest answered a `get-artifact` or `list-folder` action.
enum Reply {
    Artifact(mpsc::Receiver<io::Result<Bytes>>),
    Listing(Vec<String>),
    NotFound,
    Failed(String),
}

struct ActionEntry {
    kind: ActionKind,
    state: ActionState,
    reply: Option<oneshot::Sender<Reply>>,
    updated: Instant,
}

/// A file streamed from the guest.
pub struct Artifact {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Artifact {
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
        ReceiverStream::new(self.rx)
    }

    pub fn into_reader(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.into_stream())
    }

    /// Read the whole artifact into memory.
    pub async fn read_to_end(self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut stream = self.into_stream();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }
}

/// Sink receiving the task log.
pub type LogSink = Box<dyn AsyncWrite + Send + Unpin>;

/// The meta-service.
pub struct MetaService {
    config: Config,
    task: TaskSpec,
    task_log: Mutex<LogSink>,
    task_result: ResultSlot,
    queue: std::sync::Mutex<VecDeque<Action>>,
    queue_changed: watch::Sender<()>,
    actions: Mutex<HashMap<ActionId, ActionEntry>>,
    sessions: SessionRegistry,
    shutdown: CancellationToken,
}

impl MetaService {
    /// Create a meta-service for one task. The guest's task output is
    /// written to `log`.
    pub fn new(config: Config, task: TaskSpec, log: LogSink) -> Self {
        let (queue_changed, _) = watch::channel(());
        let sessions = SessionRegistry::new(config.session_retention());
        Self {
            config,
            task,
            task_log: Mutex::new(log),
            task_result: ResultSlot::default(),
            queue: std::sync::Mutex::new(VecDeque::new()),
            queue_changed,
            actions: Mutex::new(HashMap::new()),
            sessions,
            shutdown: CancellationToken::new(),
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    // ---- host-facing ------------------------------------------------------

    /// Fetch a file from the guest.
    ///
    /// Fails with [`BridgeError::ResourceNotFound`] if the guest has no file
    /// at `path`.
    pub async fn get_artifact(&self, path: impl Into<String>) -> Result<Artifact, BridgeError> {
        let id = ActionId::new();
        let reply = self
            .dispatch(Action::GetArtifact { id, path: path.into() })
            .await?;
        match reply {
            Reply::Artifact(rx) => Ok(Artifact { rx }),
            Reply::NotFound => Err(BridgeError::ResourceNotFound),
            Reply::Failed(message) => Err(BridgeError::Remote(message)),
            Reply::Listing(_) => Err(BridgeError::Malformed("listing reply to get-artifact".into())),
        }
    }

    /// List every file below `path` in the guest.
    ///
    /// An empty folder yields an empty list; a missing one is
    /// [`BridgeError::ResourceNotFound`].
    pub async fn list_folder(&self, path: impl Into<String>) -> Result<Vec<String>, BridgeError> {
        let id = ActionId::new();
        let reply = self.dispatch(Action::ListFolder { id, path: path.into() }).await?;
        match reply {
            Reply::Listing(files) => Ok(files),
            Reply::NotFound => Err(BridgeError::ResourceNotFound),
            Reply::Failed(message) => Err(BridgeError::Remote(message)),
            Reply::Artifact(_) => Err(BridgeError::Malformed("artifact reply to list-folder".into())),
        }
    }

    /// Start an interactive shell in the guest.
    ///
    /// `command` of `None` runs the guest's default shell. The returned
    /// handle's output pipes must be drained while the shell runs.
    pub async fn exec_shell(&self, command: Option<Vec<String>>, tty: bool) -> Result<ShellHandle, BridgeError> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let id = ActionId::new();
        let session = Arc::new(Session::new(id, command.clone(), tty, self.config.max_buffered_bytes));
        self.sessions.insert(Arc::clone(&session)).await;
        self.enqueue(Action::ExecShell { id, command, tty }, None).await?;
        info!(session = %id, tty, "Created shell session");
        Ok(ShellHandle::new(session, self.shutdown.clone(), self.config.chunk_size))
    }

    /// Write to a session's stdin at an explicit offset.
    pub async fn write_stdin(
        &self,
        id: ActionId,
        offset: u64,
        data: &[u8],
        eof: bool,
    ) -> Result<PushAck, BridgeError> {
        let session = self.sessions.get(id).await?;
        session
            .stdin
            .push(offset, data, eof, self.config.poll_timeout(), &self.shutdown)
            .await
    }

    /// Long-poll a session's stdout or stderr at `offset`.
    pub async fn read_output(&self, id: ActionId, kind: StreamKind, offset: u64) -> Result<Chunk, BridgeError> {
        if kind == StreamKind::Stdin {
            return Err(BridgeError::Malformed("stdin is not readable by callers".into()));
        }
        let session = self.sessions.get(id).await?;
        session
            .stream(kind)
            .read_at(offset, self.config.chunk_size, self.config.poll_timeout(), &self.shutdown)
            .await
    }

    /// Long-poll a session's result. `None` means it is not final yet.
    pub async fn shell_result(&self, id: ActionId) -> Result<Option<ShellResult>, BridgeError> {
        let session = self.sessions.get(id).await?;
        session
            .result
            .wait_timeout(self.config.poll_timeout(), &self.shutdown)
            .await
    }

    /// Wait for the guest to report the task outcome.
    pub async fn task_result(&self) -> Result<bool, BridgeError> {
        Ok(self.task_result.wait(&self.shutdown).await?.success)
    }

    // ---- guest-facing -----------------------------------------------------

    /// Claim the next pending action, waiting up to `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time and the guest should poll
    /// again. After [`stop_pollers`](Self::stop_pollers) this fails with
    /// [`BridgeError::Cancelled`].
    pub async fn poll_next_action(&self, timeout: Duration) -> Result<Option<Action>, BridgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut changed = self.queue_changed.subscribe();
            let next = self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop_front();
            if let Some(action) = next {
                self.advance(action.id(), ActionState::Claimed).await?;
                debug!(action = %action.id(), kind = ?action.kind(), "Action claimed");
                return Ok(Some(action));
            }
            tokio::select! {
                _ = changed.changed() => {}
                () = tokio::time::sleep_until(deadline) => return Ok(None),
                () = self.shutdown.cancelled() => return Err(BridgeError::Cancelled),
            }
        }
    }

    /// Deliver the guest's answer to a `get-artifact` or `list-folder`
    /// action.
    ///
    /// For a found artifact, `body` is the file content and this call
    /// returns once it has been handed to the host reader. Otherwise `body`
    /// is a JSON [`FolderListing`] or, for [`ReplyStatus::Error`], an error
    /// message.
    pub async fn reply<S, E>(&self, id: ActionId, status: ReplyStatus, body: S) -> Result<(), BridgeError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display,
    {
        let (kind, sender) = {
            let mut actions = self.actions.lock().await;
            let entry = actions
                .get_mut(&id)
                .ok_or_else(|| BridgeError::UnknownAction(id.to_string()))?;
            if entry.state == ActionState::Completed {
                return Err(BridgeError::Conflict(format!("action {id} already completed")));
            }
            if entry.kind == ActionKind::ExecShell {
                return Err(BridgeError::Malformed("exec-shell actions report a result, not a reply".into()));
            }
            entry.state = ActionState::Completed;
            entry.updated = Instant::now();
            (entry.kind, entry.reply.take())
        };
        let Some(sender) = sender else {
            return Err(BridgeError::Conflict(format!("action {id} already answered")));
        };

        let mut body = std::pin::pin!(body);
        let reply = match status {
            ReplyStatus::NotFound => Reply::NotFound,
            ReplyStatus::Error => Reply::Failed(String::from_utf8_lossy(&collect(&mut body).await?).into_owned()),
            ReplyStatus::Ok if kind == ActionKind::ListFolder => {
                let raw = collect(&mut body).await?;
                let listing: FolderListing = serde_json::from_slice(&raw)
                    .map_err(|e| BridgeError::Malformed(format!("invalid folder listing: {e}")))?;
                Reply::Listing(listing.files)
            }
            ReplyStatus::Ok => {
                let (tx, rx) = mpsc::channel(ARTIFACT_CHANNEL_DEPTH);
                if sender.send(Reply::Artifact(rx)).is_err() {
                    debug!(action = %id, "Artifact requester went away");
                    return Ok(());
                }
                let forward = async {
                    while let Some(frame) = body.next().await {
                        let item = frame.map_err(|e| io::Error::other(e.to_string()));
                        let failed = item.is_err();
                        if tx.send(item).await.is_err() {
                            debug!(action = %id, "Artifact reader dropped");
                            break;
                        }
                        if failed {
                            break;
                        }
                    }
                };
                tokio::select! {
                    () = forward => {}
                    () = self.shutdown.cancelled() => return Err(BridgeError::Cancelled),
                }
                debug!(action = %id, "Artifact delivered");
                return Ok(());
            }
        };

        if sender.send(reply).is_err() {
            debug!(action = %id, "Requester went away before the reply");
        }
        Ok(())
    }

    /// Long-poll a session's stdin at `offset`, acknowledging earlier bytes.
    pub async fn pull_stdin(&self, id: ActionId, offset: u64) -> Result<Chunk, BridgeError> {
        let session = self.sessions.get(id).await?;
        self.advance(id, ActionState::Streaming).await?;
        session
            .stdin
            .read_at(offset, self.config.chunk_size, self.config.poll_timeout(), &self.shutdown)
            .await
    }

    /// Apply a stdout or stderr chunk pushed by the guest.
    pub async fn push_output(
        &self,
        id: ActionId,
        kind: StreamKind,
        offset: u64,
        data: &[u8],
        eof: bool,
    ) -> Result<PushAck, BridgeError> {
        if kind == StreamKind::Stdin {
            return Err(BridgeError::Malformed("stdin is written by the host".into()));
        }
        let session = self.sessions.get(id).await?;
        self.advance(id, ActionState::Streaming).await?;
        session
            .stream(kind)
            .push(offset, data, eof, self.config.poll_timeout(), &self.shutdown)
            .await
    }

    /// Record the final result of a shell session. A second result is a
    /// conflict.
    ///
    /// Output streams are EOF-marked here too: a command that never started,
    /// or whose pumps gave up, still lets readers reach end of stream.
    pub async fn post_result(&self, id: ActionId, result: ShellResult) -> Result<(), BridgeError> {
        let session = self.sessions.get(id).await?;
        session.complete(result.clone()).await?;
        session.stdout.close();
        session.stderr.close();
        self.advance(id, ActionState::Completed).await?;
        info!(session = %id, success = result.success, error = ?result.error, "Shell session finished");
        Ok(())
    }

    /// The task the guest should run.
    pub const fn task(&self) -> &TaskSpec {
        &self.task
    }

    /// Append guest task output to the log sink.
    pub async fn append_log<S, E>(&self, body: S) -> Result<(), BridgeError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display,
    {
        let mut body = std::pin::pin!(body);
        while let Some(frame) = body.next().await {
            let data = frame.map_err(|e| BridgeError::Malformed(format!("log upload failed: {e}")))?;
            let mut sink = self.task_log.lock().await;
            sink.write_all(&data).await?;
            sink.flush().await?;
        }
        Ok(())
    }

    /// Record the task outcome. Only the first report counts.
    pub fn report_task(&self, success: bool) -> Result<(), BridgeError> {
        self.task_result.set(ShellResult::exited(success))?;
        info!(success, "Task finished");
        Ok(())
    }

    // ---- lifecycle --------------------------------------------------------

    /// Terminate every outstanding long-poll and refuse new ones.
    ///
    /// Safe to call concurrently with in-flight polls and more than once.
    pub fn stop_pollers(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping pollers");
        }
        self.shutdown.cancel();
    }

    /// Whether [`stop_pollers`](Self::stop_pollers) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start the background reaper for completed sessions and actions.
    ///
    /// The task ends when pollers are stopped.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let interval = service.config.reaper_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = service.shutdown.cancelled() => break,
                }
                debug!("Reaper sweep");
                service.cleanup_expired().await;
            }
        })
    }

    /// Drop sessions and action records that completed longer ago than the
    /// retention period.
    pub async fn cleanup_expired(&self) {
        self.sessions.cleanup_expired().await;
        let retention = self.config.session_retention();
        let mut actions = self.actions.lock().await;
        actions.retain(|_, entry| entry.state != ActionState::Completed || entry.updated.elapsed() <= retention);
    }

    /// Session by id, for inspection.
    pub async fn session(&self, id: ActionId) -> Result<Arc<Session>, BridgeError> {
        self.sessions.get(id).await
    }

    /// Lifecycle state of an action.
    pub async fn action_state(&self, id: ActionId) -> Option<ActionState> {
        self.actions.lock().await.get(&id).map(|entry| entry.state)
    }

    async fn dispatch(&self, action: Action) -> Result<Reply, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(action, Some(tx)).await?;
        tokio::select! {
            reply = rx => reply.map_err(|_| BridgeError::Cancelled),
            () = self.shutdown.cancelled() => Err(BridgeError::Cancelled),
        }
    }

    async fn enqueue(&self, action: Action, reply: Option<oneshot::Sender<Reply>>) -> Result<(), BridgeError> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let id = action.id();
        self.actions.lock().await.insert(
            id,
            ActionEntry {
                kind: action.kind(),
                state: ActionState::Pending,
                reply,
                updated: Instant::now(),
            },
        );
        debug!(action = %id, kind = ?action.kind(), "Action queued");
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(action);
        self.queue_changed.send_replace(());
        Ok(())
    }

    /// Move an action forward in its lifecycle. Completed actions never
    /// move again.
    async fn advance(&self, id: ActionId, to: ActionState) -> Result<(), BridgeError> {
        let mut actions = self.actions.lock().await;
        let entry = actions
            .get_mut(&id)
            .ok_or_else(|| BridgeError::UnknownAction(id.to_string()))?;
        if entry.state == ActionState::Completed {
            warn!(action = %id, to = ?to, "Update for completed action rejected");
            return Err(BridgeError::Conflict(format!("action {id} already completed")));
        }
        if to > entry.state {
            debug!(action = %id, from = ?entry.state, to = ?to, "Action state changed");
            entry.state = to;
            entry.updated = Instant::now();
        }
        Ok(())
    }
}

/// Collect a reply body, refusing anything over [`MAX_REPLY_SIZE`].
async fn collect<S, E>(body: &mut std::pin::Pin<&mut S>) -> Result<Bytes, BridgeError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut buf = BytesMut::new();
    while let Some(frame) = body.next().await {
        let data = frame.map_err(|e| BridgeError::Malformed(format!("reply upload failed: {e}")))?;
        if buf.len() + data.len() > MAX_REPLY_SIZE {
            return Err(BridgeError::Malformed(format!(
                "reply exceeds max size of {MAX_REPLY_SIZE} bytes"
            )));
        }
        buf.extend_from_slice(&data);
    }
    Ok(buf.freeze())
}
