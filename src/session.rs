//! Streaming state of shell sessions.
//!
//! A session is the host-side half of one `exec-shell` action: three
//! [`ByteLog`]s and a single-assignment result slot. Sessions stay in the
//! registry after their result lands so late readers can still drain
//! output; the reaper removes them once they have been complete for the
//! configured retention period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::stream::ByteLog;
use crate::transport::protocol::{ActionId, ShellResult, StreamKind};

/// Write-once slot holding a session's final result.
pub struct ResultSlot {
    tx: watch::Sender<Option<ShellResult>>,
}

impl Default for ResultSlot {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }
}

impl ResultSlot {
    /// Store the result. A second assignment is a conflict and leaves the
    /// first value in place.
    pub fn set(&self, result: ShellResult) -> Result<(), BridgeError> {
        let mut result = Some(result);
        let stored = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        });
        if stored {
            Ok(())
        } else {
            Err(BridgeError::Conflict("result already posted".into()))
        }
    }

    /// The result, if already posted.
    pub fn get(&self) -> Option<ShellResult> {
        self.tx.borrow().clone()
    }

    /// Wait until the result is posted.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<ShellResult, BridgeError> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            slot = rx.wait_for(Option::is_some) => {
                // the sender lives in self, so the channel cannot close here
                let slot = slot.map_err(|_| BridgeError::Cancelled)?;
                (*slot).clone().ok_or(BridgeError::Cancelled)
            }
            () = cancel.cancelled() => Err(BridgeError::Cancelled),
        }
    }

    /// Wait up to `timeout` for the result.
    pub async fn wait_timeout(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<ShellResult>, BridgeError> {
        match tokio::time::timeout(timeout, self.wait(cancel)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// One shell session.
pub struct Session {
    pub id: ActionId,

    /// Command the guest was asked to run; `None` is the default shell.
    pub command: Option<Vec<String>>,

    pub tty: bool,

    pub stdin: ByteLog,
    pub stdout: ByteLog,
    pub stderr: ByteLog,
    pub result: ResultSlot,

    pub created_at: Instant,

    /// Set when the result is posted; drives retention.
    completed_at: Mutex<Option<Instant>>,
}

impl Session {
    pub fn new(id: ActionId, command: Option<Vec<String>>, tty: bool, max_buffered: usize) -> Self {
        Self {
            id,
            command,
            tty,
            stdin: ByteLog::new(max_buffered),
            stdout: ByteLog::new(max_buffered),
            stderr: ByteLog::new(max_buffered),
            result: ResultSlot::default(),
            created_at: Instant::now(),
            completed_at: Mutex::new(None),
        }
    }

    pub const fn stream(&self, kind: StreamKind) -> &ByteLog {
        match kind {
            StreamKind::Stdin => &self.stdin,
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// Record the final result.
    pub async fn complete(&self, result: ShellResult) -> Result<(), BridgeError> {
        self.result.set(result)?;
        *self.completed_at.lock().await = Some(Instant::now());
        Ok(())
    }

    /// Whether the session has been complete for longer than `retention`.
    async fn is_expired(&self, retention: Duration) -> bool {
        self.completed_at
            .lock()
            .await
            .is_some_and(|at| at.elapsed() > retention)
    }
}

/// Registry of live and recently completed sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ActionId, Arc<Session>>>,
    retention: Duration,
}

impl SessionRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub async fn insert(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id, session);
    }

    pub async fn get(&self, id: ActionId) -> Result<Arc<Session>, BridgeError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownSession(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove sessions that completed more than `retention` ago.
    ///
    /// Returns the ids that were removed.
    pub async fn cleanup_expired(&self) -> Vec<ActionId> {
        let expired: Vec<ActionId> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for (id, session) in sessions.iter() {
                if session.is_expired(self.retention).await {
                    debug!(session = %id, "Session retention elapsed");
                    expired.push(*id);
                }
            }
            expired
        };

        if !expired.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &expired {
                if sessions.remove(id).is_some() {
                    info!(session = %id, "Removed completed session");
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_slot_is_single_assignment() {
        let slot = ResultSlot::default();
        assert!(slot.get().is_none());

        slot.set(ShellResult::exited(true)).unwrap();
        let err = slot.set(ShellResult::exited(false)).unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));

        // first value wins
        assert_eq!(slot.get(), Some(ShellResult::exited(true)));
    }

    #[tokio::test]
    async fn result_slot_wait_unblocks_on_set() {
        let slot = Arc::new(ResultSlot::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let slot = Arc::clone(&slot);
            let cancel = cancel.clone();
            tokio::spawn(async move { slot.wait(&cancel).await })
        };
        tokio::task::yield_now().await;
        slot.set(ShellResult::spawn_failed("no such file")).unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.error.as_deref(), Some("no such file"));
        // readable any number of times
        assert_eq!(slot.wait(&cancel).await.unwrap(), result);
    }

    #[tokio::test]
    async fn result_slot_wait_timeout_is_empty() {
        let slot = ResultSlot::default();
        let cancel = CancellationToken::new();
        let result = slot.wait_timeout(Duration::from_millis(20), &cancel).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn registry_unknown_session() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let err = registry.get(ActionId::new()).await.err().unwrap();
        assert!(matches!(err, BridgeError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn reaper_only_removes_completed_sessions() {
        let registry = SessionRegistry::new(Duration::ZERO);
        let running = Arc::new(Session::new(ActionId::new(), None, false, 1024));
        let done = Arc::new(Session::new(ActionId::new(), None, false, 1024));
        registry.insert(Arc::clone(&running)).await;
        registry.insert(Arc::clone(&done)).await;

        done.complete(ShellResult::exited(true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let removed = registry.cleanup_expired().await;
        assert_eq!(removed, vec![done.id]);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(running.id).await.is_ok());
    }
}
