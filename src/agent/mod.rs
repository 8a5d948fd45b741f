//! Guest agent.
//!
//! [`ActionProcessor`] long-polls the host for actions and runs each one on
//! its own task, so a long-lived shell session never holds up an artifact
//! request queued behind it. [`run_task`] runs the guest's main task and
//! reports its outcome.

pub mod executor;
mod pump;
mod task;

pub use task::run_task;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::BridgeError;
use crate::transport::Transport;

/// Cap on the backoff multiplier after consecutive poll failures.
const MAX_BACKOFF_STEPS: u32 = 10;

/// Where the poll loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Polling,
    /// Stop was requested or the host stopped serving; waiting for
    /// in-flight actions to finish.
    Draining,
    Stopped,
}

/// The guest's action poll loop.
pub struct ActionProcessor {
    transport: Arc<dyn Transport>,
    config: Config,
    stop: CancellationToken,
    state: watch::Sender<ProcessorState>,
    running: Mutex<JoinSet<()>>,
}

impl ActionProcessor {
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        let (state, _) = watch::channel(ProcessorState::Idle);
        Self {
            transport,
            config,
            stop: CancellationToken::new(),
            state,
            running: Mutex::new(JoinSet::new()),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    /// Number of actions currently executing.
    pub async fn active_actions(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Poll for actions and execute them until stopped.
    ///
    /// Returns once [`stop_processing_actions`](Self::stop_processing_actions)
    /// has been called or the host has stopped its pollers, and every action
    /// already started has finished.
    pub async fn process_actions(&self) {
        info!("Processing actions");
        let mut failures = 0u32;

        while !self.stop.is_cancelled() {
            self.state.send_replace(ProcessorState::Polling);
            let polled = tokio::select! {
                polled = self.transport.poll_action() => polled,
                () = self.stop.cancelled() => break,
            };
            self.reap_finished().await;

            match polled {
                Ok(Some(action)) => {
                    failures = 0;
                    let transport = Arc::clone(&self.transport);
                    let config = self.config.clone();
                    let id = action.id();
                    self.running.lock().await.spawn(async move {
                        if let Err(e) = executor::execute(transport, config, action).await {
                            warn!(action = %id, error = %e, "Action failed");
                        }
                    });
                }
                Ok(None) => {
                    failures = 0;
                    debug!("Poll timed out");
                }
                Err(BridgeError::Cancelled) => {
                    info!("Host stopped serving actions");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.config.retry_backoff() * failures.min(MAX_BACKOFF_STEPS);
                    warn!(error = %e, failures, delay = ?delay, "Poll failed");
                    self.state.send_replace(ProcessorState::Idle);
                    self.pause(delay).await;
                }
            }
        }

        self.state.send_replace(ProcessorState::Draining);
        let mut running = self.running.lock().await;
        while running.join_next().await.is_some() {}
        drop(running);
        self.state.send_replace(ProcessorState::Stopped);
        info!("Stopped processing actions");
    }

    /// Ask the poll loop to stop. Takes effect at the next loop boundary;
    /// actions already executing are allowed to finish.
    pub fn stop_processing_actions(&self) {
        self.stop.cancel();
    }

    /// Wait until the host answers a ping, retrying every `interval`.
    pub async fn wait_for_host(&self, interval: Duration) -> Result<(), BridgeError> {
        loop {
            match self.transport.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => debug!(error = %e, "Host not reachable yet"),
                Err(e) => return Err(e),
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.stop.cancelled() => return Err(BridgeError::Cancelled),
            }
        }
    }

    async fn reap_finished(&self) {
        let mut running = self.running.lock().await;
        while let Some(joined) = running.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "Action task panicked");
            }
        }
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = self.stop.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metaservice::MetaService;
    use crate::transport::protocol::TaskSpec;
    use crate::transport::LocalTransport;

    fn setup() -> (Arc<MetaService>, Arc<ActionProcessor>) {
        let config = Config::from_json(r#"{"poll_timeout_seconds": 1, "request_timeout_seconds": 5}"#).unwrap();
        let meta = Arc::new(MetaService::new(config.clone(), TaskSpec::default(), Box::new(tokio::io::sink())));
        let transport = Arc::new(LocalTransport::new(Arc::clone(&meta)));
        (meta, Arc::new(ActionProcessor::new(transport, config)))
    }

    #[tokio::test]
    async fn listing_is_served_by_the_loop() {
        let (meta, processor) = setup();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let loop_task = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.process_actions().await })
        };
        let files = meta.list_folder(dir.path().to_string_lossy()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.txt"));

        processor.stop_processing_actions();
        loop_task.await.unwrap();
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[tokio::test]
    async fn host_stop_ends_the_loop() {
        let (meta, processor) = setup();
        let loop_task = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.process_actions().await })
        };
        tokio::task::yield_now().await;
        meta.stop_pollers();
        tokio::time::timeout(Duration::from_secs(5), loop_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(processor.active_actions().await, 0);
    }
}
