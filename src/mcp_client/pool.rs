//! Transport pool.
//!
//! Holds at most one live [`Transport`] per server id and hands it out to
//! concurrent callers. Connects for the same id are serialized so a burst of
//! callers spawns a single process; a transport that is no longer `Ready` is
//! discarded and replaced on the next request. A failed connect is reported
//! to that request only; the next request tries again from scratch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use super::errors::McpError;
use super::transport::{Transport, TransportSettings};
use super::types::{ServerDefinition, TransportStatus};

/// Most recent connect failure for a server.
#[derive(Debug, Clone)]
pub struct ConnectFailure {
    pub error: McpError,
    pub at: DateTime<Utc>,
}

/// Pool of live transports keyed by server id.
pub struct TransportPool {
    settings: TransportSettings,
    transports: AsyncMutex<HashMap<String, Arc<Transport>>>,
    connect_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    last_failures: Mutex<HashMap<String, ConnectFailure>>,
    shutting_down: AtomicBool,
}

impl TransportPool {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            transports: AsyncMutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            last_failures: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Return a `Ready` transport for `definition`, connecting if needed.
    ///
    /// Concurrent callers for the same id share one connect attempt. Errors
    /// are wrapped as `Unavailable` with the connect error as the source.
    pub async fn get_transport(
        &self,
        definition: &ServerDefinition,
    ) -> Result<Arc<Transport>, McpError> {
        let server_id = definition.id.as_str();
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(McpError::unavailable(
                server_id,
                McpError::NotReady {
                    server: server_id.to_string(),
                    state: "pool shutting down".into(),
                },
            ));
        }

        if let Some(ready) = self.ready_transport(server_id).await {
            return Ok(ready);
        }

        let connect_lock = self.connect_lock(server_id);
        let _connecting = connect_lock.lock().await;

        // Another caller may have connected while we waited
        if let Some(ready) = self.ready_transport(server_id).await {
            return Ok(ready);
        }

        let stale = self.transports.lock().await.remove(server_id);
        if let Some(stale) = stale {
            tracing::info!(
                server = server_id,
                instance = %stale.instance_id(),
                state = %stale.state(),
                "replacing transport that is no longer ready"
            );
            stale.close().await;
        }

        let transport = Arc::new(Transport::new(definition.clone(), self.settings));
        if let Err(e) = transport.connect().await {
            tracing::warn!(server = server_id, error = %e, "failed to connect to server");
            transport.close().await;
            let err = McpError::unavailable(server_id, e);
            self.last_failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    server_id.to_string(),
                    ConnectFailure {
                        error: err.clone(),
                        at: Utc::now(),
                    },
                );
            return Err(err);
        }

        self.last_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);

        if self.shutting_down.load(Ordering::SeqCst) {
            transport.close().await;
            return Err(McpError::unavailable(
                server_id,
                McpError::NotReady {
                    server: server_id.to_string(),
                    state: "pool shutting down".into(),
                },
            ));
        }

        self.transports
            .lock()
            .await
            .insert(server_id.to_string(), Arc::clone(&transport));
        Ok(transport)
    }

    async fn ready_transport(&self, server_id: &str) -> Option<Arc<Transport>> {
        self.transports
            .lock()
            .await
            .get(server_id)
            .filter(|t| t.is_ready())
            .cloned()
    }

    fn connect_lock(&self, server_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .connect_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(server_id.to_string()).or_default())
    }

    /// Snapshot of the pooled transport for `server_id`, if any.
    pub async fn status(&self, server_id: &str) -> Option<TransportStatus> {
        self.transports
            .lock()
            .await
            .get(server_id)
            .map(|t| t.status())
    }

    /// Snapshots of every pooled transport, sorted by server id.
    pub async fn statuses(&self) -> Vec<TransportStatus> {
        let mut all: Vec<TransportStatus> = self
            .transports
            .lock()
            .await
            .values()
            .map(|t| t.status())
            .collect();
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        all
    }

    /// Most recent connect failure for `server_id`, cleared on success.
    pub fn last_failure(&self, server_id: &str) -> Option<ConnectFailure> {
        self.last_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned()
    }

    /// Remove and close the transport for `server_id`. Returns whether one
    /// was pooled.
    ///
    /// Waits for any connect in progress for the same id, so a transport
    /// launched from a superseded definition is never left in the pool.
    pub async fn discard(&self, server_id: &str) -> bool {
        let connect_lock = self.connect_lock(server_id);
        let _connecting = connect_lock.lock().await;
        let removed = self.transports.lock().await.remove(server_id);
        match removed {
            Some(transport) => {
                transport.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every pooled transport within the configured shutdown timeout.
    ///
    /// Transports still closing at the deadline are dropped, which kills
    /// their processes. New requests are refused once this starts.
    pub async fn close_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<Transport>> = self
            .transports
            .lock()
            .await
            .drain()
            .map(|(_, t)| t)
            .collect();
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        let closing = futures::future::join_all(drained.iter().map(|t| t.close()));
        match tokio::time::timeout(self.settings.shutdown_timeout, closing).await {
            Ok(_) => tracing::info!(count, "closed all transports"),
            Err(_) => {
                tracing::warn!(
                    count,
                    timeout_ms = u64::try_from(self.settings.shutdown_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "shutdown timed out; force-killing remaining server processes"
                );
            }
        }
        // Dropping the last references kills any process still running
        drop(drained);
    }

    /// Whether `close_all` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPool")
            .field("settings", &self.settings)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::super::errors::ErrorKind;
    use super::super::types::TransportState;
    use super::*;

    fn pool() -> TransportPool {
        TransportPool::new(TransportSettings {
            handshake_timeout: Duration::from_millis(300),
            call_timeout: Duration::from_secs(1),
            terminate_grace: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn test_launch_failure_is_unavailable_and_recorded() {
        let pool = pool();
        let def = ServerDefinition::new("ghost", "/nonexistent/definitely-not-here", &[]);

        let err = pool.get_transport(&def).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        match &err {
            McpError::Unavailable { source, .. } => assert_eq!(source.kind(), ErrorKind::LaunchError),
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert!(pool.status("ghost").await.is_none());
        assert!(pool.last_failure("ghost").is_some());
    }

    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        let pool = pool();
        // `cat` never answers with a JSON-RPC response
        let def = ServerDefinition::new("mute", "sh", &["-c", "cat > /dev/null"]);

        let started = std::time::Instant::now();
        let err = pool.get_transport(&def).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        match &err {
            McpError::Unavailable { source, .. } => {
                assert_eq!(source.kind(), ErrorKind::HandshakeTimeout);
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discard_and_close_all_on_empty_pool() {
        let pool = pool();
        assert!(!pool.discard("nothing").await);
        pool.close_all().await;
        assert!(pool.is_shutting_down());

        let def = ServerDefinition::new("late", "cat", &[]);
        let err = pool.get_transport(&def).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(pool.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_discard_waits_for_connect_in_progress() {
        let pool = Arc::new(TransportPool::new(TransportSettings {
            handshake_timeout: Duration::from_secs(5),
            ..pool().settings
        }));
        // Answers `initialize` after a delay, so the connect is still running
        // when `discard` is called
        let reply = r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#;
        let script = format!("sleep 0.3; echo '{reply}'; cat > /dev/null");
        let def = ServerDefinition::new("slow", "sh", &["-c", script.as_str()]);

        let connecting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_transport(&def).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(pool.discard("slow").await);
        let transport = connecting.await.unwrap().unwrap();
        assert_ne!(transport.state(), TransportState::Ready);
        assert!(pool.status("slow").await.is_none());

        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_failed_transport_is_not_pooled() {
        let pool = pool();
        let def = ServerDefinition::new("exits", "true", &[]);
        let err = pool.get_transport(&def).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(pool
            .statuses()
            .await
            .iter()
            .all(|s| s.state == TransportState::Ready));
    }
}
