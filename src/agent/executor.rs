//! Carries out a single action in the guest.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use super::pump::{forward_output, pump_stdin, with_retry};
use crate::config::Config;
use crate::error::BridgeError;
use crate::resolver;
use crate::transport::protocol::{Action, ActionId, FolderListing, ReplyStatus, ShellResult, StreamKind};
use crate::transport::{ByteStream, Transport};

/// Program run when an `exec-shell` action carries no command.
pub const DEFAULT_SHELL: &str = "sh";

/// Output read ceiling for sessions that asked for a terminal, so
/// interactive output reaches the host a line or two at a time.
const TTY_READ_CEILING: usize = 1024;

/// Execute `action` and report its outcome to the host.
///
/// Errors returned here are failures to talk to the host. Whatever
/// happens to the action itself (a missing file, a command that fails or
/// cannot start) is reported through the transport.
#[instrument(skip_all, fields(action = %action.id(), kind = ?action.kind()))]
pub async fn execute(transport: Arc<dyn Transport>, config: Config, action: Action) -> Result<(), BridgeError> {
    match action {
        Action::GetArtifact { id, path } => send_artifact(&*transport, id, &path, config.chunk_size).await,
        Action::ListFolder { id, path } => send_listing(&*transport, id, &path).await,
        Action::ExecShell { id, command, tty } => exec_shell(transport, config, id, command, tty).await,
    }
}

async fn send_artifact(transport: &dyn Transport, id: ActionId, path: &str, chunk_size: usize) -> Result<(), BridgeError> {
    match resolver::open_artifact(path).await {
        Ok(file) => {
            debug!(path, "Uploading artifact");
            let body = ReaderStream::with_capacity(file, chunk_size).boxed();
            transport.reply(id, ReplyStatus::Ok, body).await
        }
        Err(BridgeError::ResourceNotFound) => {
            debug!(path, "Artifact not found");
            transport.reply(id, ReplyStatus::NotFound, empty()).await
        }
        Err(e) => {
            warn!(path, error = %e, "Failed to open artifact");
            transport.reply(id, ReplyStatus::Error, message(&e)).await
        }
    }
}

async fn send_listing(transport: &dyn Transport, id: ActionId, path: &str) -> Result<(), BridgeError> {
    match resolver::list_folder(path).await {
        Ok(files) => {
            debug!(path, files = files.len(), "Sending folder listing");
            let json = serde_json::to_vec(&FolderListing { files })
                .map_err(|e| BridgeError::Malformed(format!("failed to encode listing: {e}")))?;
            transport.reply(id, ReplyStatus::Ok, once(Bytes::from(json))).await
        }
        Err(BridgeError::ResourceNotFound) => transport.reply(id, ReplyStatus::NotFound, empty()).await,
        Err(e) => {
            warn!(path, error = %e, "Failed to list folder");
            transport.reply(id, ReplyStatus::Error, message(&e)).await
        }
    }
}

async fn exec_shell(
    transport: Arc<dyn Transport>,
    config: Config,
    id: ActionId,
    command: Option<Vec<String>>,
    tty: bool,
) -> Result<(), BridgeError> {
    let argv = command
        .filter(|argv| !argv.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_SHELL.to_string()]);

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if tty {
        cmd.env("TERM", "xterm");
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %argv[0], error = %e, "Failed to spawn shell command");
            let result = ShellResult::spawn_failed(format!("{}: {e}", argv[0]));
            return post_result(&*transport, &config, id, &result).await;
        }
    };
    info!(program = %argv[0], pid = child.id(), tty, "Shell started");

    let ceiling = if tty { TTY_READ_CEILING } else { config.chunk_size };
    let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(BridgeError::Malformed("child stdio was not captured".into()));
    };

    let stdin_pump = {
        let transport = Arc::clone(&transport);
        let config = config.clone();
        tokio::spawn(async move {
            match pump_stdin(&*transport, &config, id, stdin).await {
                Ok(_) => {}
                // the child exiting first closes its stdin under us
                Err(BridgeError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => warn!(session = %id, error = %e, "stdin pump failed"),
            }
        })
    };
    let outputs = tokio::join!(
        forward_output(&*transport, &config, id, StreamKind::Stdout, stdout, ceiling),
        forward_output(&*transport, &config, id, StreamKind::Stderr, stderr, ceiling),
        child.wait(),
    );

    // stdin is still long-polling the host if the caller never closed it
    stdin_pump.abort();

    let result = match outputs.2 {
        Ok(status) => {
            info!(code = ?status.code(), success = status.success(), "Shell exited");
            ShellResult::exited(status.success())
        }
        Err(e) => {
            warn!(error = %e, "Failed to wait for shell");
            ShellResult::exited(false)
        }
    };
    post_result(&*transport, &config, id, &result).await
}

async fn post_result(
    transport: &dyn Transport,
    config: &Config,
    id: ActionId,
    result: &ShellResult,
) -> Result<(), BridgeError> {
    let attempts = AtomicU32::new(0);
    let counter = &attempts;
    let posted = with_retry(config, "result post", move || {
        counter.fetch_add(1, Ordering::Relaxed);
        transport.post_result(id, result)
    })
    .await;
    match posted {
        // an earlier attempt landed but its response was lost
        Err(BridgeError::Conflict(_)) if attempts.load(Ordering::Relaxed) > 1 => {
            debug!(session = %id, "Result already recorded");
            Ok(())
        }
        posted => posted,
    }
}

fn empty() -> ByteStream {
    futures::stream::empty().boxed()
}

fn once(data: Bytes) -> ByteStream {
    futures::stream::once(async move { Ok::<_, std::io::Error>(data) }).boxed()
}

fn message(err: &BridgeError) -> ByteStream {
    once(Bytes::from(err.to_string()))
}
