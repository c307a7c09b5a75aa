use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::error::{DispatchError, Result};
use crate::model::{JobRequest, Provider};
use crate::store::{ChangeEvent, JobStore};

/// Message types for the synchronizer event loop
#[derive(Debug)]
pub enum SyncMessage {
    /// A provider opens a job feed session
    Subscribe {
        provider_id: Uuid,
        response_tx: oneshot::Sender<Result<Subscription>>,
    },
    /// A provider's feed session ended
    Disconnect { provider_id: Uuid },
    /// Number of live feed sessions
    SessionCount { response_tx: oneshot::Sender<usize> },
}

/// Everything a feed session needs to build its local pool: the provider
/// row, a snapshot of claimable jobs, and the change stream from the
/// point the session was registered. The stream is registered before the
/// snapshot is taken, so an event may duplicate a snapshot row but can
/// never be missed; version de-duplication in the pool absorbs the
/// overlap.
#[derive(Debug)]
pub struct Subscription {
    pub provider: Provider,
    pub snapshot: Vec<JobRequest>,
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// Cloneable handle for talking to a running [`PoolSynchronizer`].
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncMessage>,
}

impl SyncHandle {
    pub async fn subscribe(&self, provider_id: Uuid) -> Result<Subscription> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SyncMessage::Subscribe {
                provider_id,
                response_tx,
            })
            .await
            .map_err(|_| {
                DispatchError::StoreUnavailable("pool synchronizer is not running".to_string())
            })?;
        response_rx.await.map_err(|_| {
            DispatchError::StoreUnavailable("pool synchronizer dropped the request".to_string())
        })?
    }

    pub async fn disconnect(&self, provider_id: Uuid) {
        let _ = self.tx.send(SyncMessage::Disconnect { provider_id }).await;
    }

    pub async fn session_count(&self) -> Result<usize> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SyncMessage::SessionCount { response_tx })
            .await
            .map_err(|_| {
                DispatchError::StoreUnavailable("pool synchronizer is not running".to_string())
            })?;
        response_rx.await.map_err(|_| {
            DispatchError::StoreUnavailable("pool synchronizer dropped the request".to_string())
        })
    }
}

/// Fans the store change feed out to per-provider feed sessions.
///
/// Each session gets its own bounded channel. A session that cannot keep
/// up is disconnected rather than allowed to stall the others; the
/// client resubscribes and reseeds from a fresh snapshot. One session
/// per provider: a second subscribe replaces the first.
pub struct PoolSynchronizer {
    store: Arc<dyn JobStore>,
    config: MatchingConfig,
    message_tx: mpsc::Sender<SyncMessage>,
    sessions: HashMap<Uuid, mpsc::Sender<ChangeEvent>>,
}

impl PoolSynchronizer {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: MatchingConfig,
    ) -> (Self, mpsc::Receiver<SyncMessage>) {
        let (message_tx, message_rx) = mpsc::channel(100);

        let sync = Self {
            store,
            config,
            message_tx,
            sessions: HashMap::new(),
        };

        (sync, message_rx)
    }

    /// Get a handle for external communication
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            tx: self.message_tx.clone(),
        }
    }

    /// Run the synchronizer main loop
    pub async fn run(
        mut self,
        mut message_rx: mpsc::Receiver<SyncMessage>,
        shutdown: CancellationToken,
    ) {
        let mut feed = self.store.subscribe();

        loop {
            tokio::select! {
                // Handle incoming messages
                msg = message_rx.recv() => {
                    match msg {
                        Some(SyncMessage::Subscribe { provider_id, response_tx }) => {
                            let result = self.handle_subscribe(provider_id).await;
                            let _ = response_tx.send(result);
                        }
                        Some(SyncMessage::Disconnect { provider_id }) => {
                            if self.sessions.remove(&provider_id).is_some() {
                                tracing::debug!(provider_id = %provider_id, "Feed session closed");
                            }
                        }
                        Some(SyncMessage::SessionCount { response_tx }) => {
                            let _ = response_tx.send(self.sessions.len());
                        }
                        None => break,
                    }
                }

                // Forward job changes to every live session
                event = feed.recv() => {
                    match event {
                        Ok(event) => self.fan_out(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed events mean a removal may have been
                            // missed too; every session must reseed.
                            tracing::warn!(
                                skipped,
                                sessions = self.sessions.len(),
                                "Change feed lagged, dropping all sessions for resync"
                            );
                            self.sessions.clear();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::warn!("Change feed closed, stopping synchronizer");
                            break;
                        }
                    }
                }

                _ = shutdown.cancelled() => {
                    tracing::info!(sessions = self.sessions.len(), "Synchronizer shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_subscribe(&mut self, provider_id: Uuid) -> Result<Subscription> {
        let provider = self.store.provider(provider_id).await?;

        // Feeds exist to offer claimable work. A provider already holding
        // a job, or one that has not heartbeated itself online, gets no
        // session until that changes.
        if let Some(current_job) = provider.current_job {
            return Err(DispatchError::WorkerBusy {
                provider_id,
                current_job,
            });
        }
        if !provider.online {
            return Err(DispatchError::InvalidRequest(format!(
                "provider {} is offline, heartbeat before subscribing",
                provider_id
            )));
        }

        // Register the event channel before reading the snapshot so the
        // session sees every change past the snapshot, at worst twice.
        let (event_tx, event_rx) = mpsc::channel(self.config.session_buffer);
        if self.sessions.insert(provider_id, event_tx).is_some() {
            tracing::debug!(provider_id = %provider_id, "Replacing existing feed session");
        }

        let snapshot = self.store.pending_jobs().await?;

        tracing::info!(
            provider_id = %provider_id,
            snapshot_len = snapshot.len(),
            sessions = self.sessions.len(),
            "Feed session opened"
        );

        Ok(Subscription {
            provider,
            snapshot,
            events: event_rx,
        })
    }

    fn fan_out(&mut self, event: ChangeEvent) {
        let mut dropped: Vec<Uuid> = Vec::new();

        for (provider_id, session_tx) in &self.sessions {
            match session_tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        provider_id = %provider_id,
                        seq = event.seq,
                        "Feed session lagging, dropping it"
                    );
                    dropped.push(*provider_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*provider_id);
                }
            }
        }

        for provider_id in dropped {
            self.sessions.remove(&provider_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::geo::Coordinate;
    use crate::model::{JobRequest, ServiceKind};
    use crate::store::MemoryStore;
    use tokio::time::{sleep, timeout, Duration};

    fn online_provider() -> Provider {
        let mut provider = Provider::auto_registered(Uuid::new_v4());
        provider.online = true;
        provider
    }

    fn test_job() -> JobRequest {
        JobRequest::new(
            Uuid::new_v4(),
            ServiceKind::Ride,
            Some(Coordinate {
                lat: 40.0,
                lng: -74.0,
            }),
            Some(Coordinate {
                lat: 40.1,
                lng: -74.1,
            }),
            10_000,
        )
    }

    async fn start(
        store: Arc<MemoryStore>,
        config: MatchingConfig,
    ) -> (SyncHandle, CancellationToken) {
        let (sync, rx) = PoolSynchronizer::new(store as Arc<dyn JobStore>, config);
        let handle = sync.handle();
        let shutdown = CancellationToken::new();
        tokio::spawn(sync.run(rx, shutdown.clone()));
        (handle, shutdown)
    }

    #[tokio::test]
    async fn subscribe_returns_pending_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let provider = online_provider();
        store.upsert_provider(provider.clone()).await.unwrap();
        store.insert_job(test_job(), Vec::new()).await.unwrap();
        store.insert_job(test_job(), Vec::new()).await.unwrap();

        let (handle, shutdown) = start(store, MatchingConfig::default()).await;
        let sub = handle.subscribe(provider.id).await.unwrap();
        assert_eq!(sub.provider.id, provider.id);
        assert_eq!(sub.snapshot.len(), 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn subscribe_unknown_provider_fails() {
        let store = Arc::new(MemoryStore::new());
        let (handle, shutdown) = start(store, MatchingConfig::default()).await;

        let err = handle.subscribe(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DispatchError::ProviderNotFound(_)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn subscribe_busy_provider_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let mut provider = online_provider();
        let held = Uuid::new_v4();
        provider.current_job = Some(held);
        store.upsert_provider(provider.clone()).await.unwrap();

        let (handle, shutdown) = start(store, MatchingConfig::default()).await;
        let err = handle.subscribe(provider.id).await.unwrap_err();
        assert!(
            matches!(err, DispatchError::WorkerBusy { current_job, .. } if current_job == held)
        );
        assert_eq!(handle.session_count().await.unwrap(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn subscribe_offline_provider_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let provider = Provider::auto_registered(Uuid::new_v4());
        store.upsert_provider(provider.clone()).await.unwrap();

        let (handle, shutdown) = start(store, MatchingConfig::default()).await;
        let err = handle.subscribe(provider.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
        assert_eq!(handle.session_count().await.unwrap(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn events_flow_after_subscribe() {
        let store = Arc::new(MemoryStore::new());
        let provider = online_provider();
        store.upsert_provider(provider.clone()).await.unwrap();

        let (handle, shutdown) = start(store.clone(), MatchingConfig::default()).await;
        let mut sub = handle.subscribe(provider.id).await.unwrap();
        assert!(sub.snapshot.is_empty());

        let job = store.insert_job(test_job(), Vec::new()).await.unwrap();

        let event = timeout(Duration::from_secs(1), sub.events.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        assert_eq!(event.job.id, job.id);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn disconnect_removes_session() {
        let store = Arc::new(MemoryStore::new());
        let provider = online_provider();
        store.upsert_provider(provider.clone()).await.unwrap();

        let (handle, shutdown) = start(store, MatchingConfig::default()).await;
        let _sub = handle.subscribe(provider.id).await.unwrap();
        assert_eq!(handle.session_count().await.unwrap(), 1);

        handle.disconnect(provider.id).await;
        assert_eq!(handle.session_count().await.unwrap(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn lagging_session_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let provider = online_provider();
        store.upsert_provider(provider.clone()).await.unwrap();

        let config = MatchingConfig {
            session_buffer: 2,
            ..Default::default()
        };
        let (handle, shutdown) = start(store.clone(), config).await;

        // Subscribe but never drain the event channel.
        let sub = handle.subscribe(provider.id).await.unwrap();
        for _ in 0..8 {
            store.insert_job(test_job(), Vec::new()).await.unwrap();
        }

        let mut sessions = usize::MAX;
        for _ in 0..50 {
            sessions = handle.session_count().await.unwrap();
            if sessions == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sessions, 0, "overflowing session should be dropped");

        drop(sub);
        shutdown.cancel();
    }
}
