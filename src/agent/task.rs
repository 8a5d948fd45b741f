//! The guest's main task.

use std::process::Stdio;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::transport::Transport;

/// Fetch the task from the host, run it with its output streamed to the
/// host log, and report whether it succeeded.
///
/// A task that cannot be started is reported as failed. Errors returned
/// here mean the host could not be reached.
pub async fn run_task(transport: &dyn Transport) -> Result<bool> {
    let task = transport.fetch_task().await.context("Failed to fetch task")?;
    let Some((program, args)) = task.command.split_first() else {
        warn!("Host sent an empty task");
        transport.report_task(false).await.context("Failed to report task outcome")?;
        return Ok(false);
    };

    let spawned = Command::new(program)
        .args(args)
        .envs(&task.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %program, error = %e, "Failed to start task");
            transport.report_task(false).await.context("Failed to report task outcome")?;
            return Ok(false);
        }
    };
    info!(program = %program, pid = child.id(), "Task started");

    let stdout = child.stdout.take().context("Task stdout was not captured")?;
    let stderr = child.stderr.take().context("Task stderr was not captured")?;
    // interleaving between the two is whatever order the reads complete in
    let log = futures::stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr)).boxed();

    let (uploaded, status) = tokio::join!(transport.send_log(log), child.wait());
    if let Err(e) = uploaded {
        warn!(error = %e, "Task log upload failed");
    }
    let success = status.context("Failed to wait for task")?.success();
    info!(success, "Task finished");

    transport
        .report_task(success)
        .await
        .context("Failed to report task outcome")?;
    Ok(success)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use crate::config::Config;
    use crate::metaservice::MetaService;
    use crate::transport::protocol::TaskSpec;
    use crate::transport::LocalTransport;

    #[tokio::test]
    async fn task_output_and_outcome_reach_the_host() {
        let (log_writer, mut log_reader) = tokio::io::duplex(64 * 1024);
        let task = TaskSpec {
            command: vec!["sh".into(), "-c".into(), "echo \"$GREETING\"; exit 1".into()],
            env: HashMap::from([("GREETING".to_string(), "hi there".to_string())]),
        };
        let meta = Arc::new(MetaService::new(Config::default(), task, Box::new(log_writer)));
        let transport = LocalTransport::new(Arc::clone(&meta));

        assert!(!run_task(&transport).await.unwrap());
        assert!(!meta.task_result().await.unwrap());

        drop(meta);
        drop(transport);
        let mut log = String::new();
        log_reader.read_to_string(&mut log).await.unwrap();
        assert_eq!(log, "hi there\n");
    }

    #[tokio::test]
    async fn unstartable_task_is_reported_failed() {
        let task = TaskSpec {
            command: vec!["/no/such/task".into()],
            ..TaskSpec::default()
        };
        let meta = Arc::new(MetaService::new(Config::default(), task, Box::new(tokio::io::sink())));
        let transport = LocalTransport::new(Arc::clone(&meta));
        assert!(!run_task(&transport).await.unwrap());
        assert!(matches!(meta.report_task(true), Err(crate::error::BridgeError::Conflict(_))));
    }
}
