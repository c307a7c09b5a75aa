use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::claim::ClaimCoordinator;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::matching::sync::{PoolSynchronizer, SyncHandle, SyncMessage};
use crate::notify::{LogNotifier, Notifier};
use crate::settlement::SettlementEngine;
use crate::store::{JobStore, MemoryStore};

/// Main node that wires the store, the matching synchronizer, the claim
/// and lifecycle engines, and the HTTP API together.
pub struct Node {
    pub config: NodeConfig,
    pub state: ApiState,
    synchronizer: PoolSynchronizer,
    sync_rx: mpsc::Receiver<SyncMessage>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let store = Arc::new(MemoryStore::with_feed_capacity(
            config.matching.feed_capacity,
        ));
        Self::with_store(config, store)
    }

    /// Wire a node around an existing store. Tests use this to share the
    /// store with the harness.
    pub fn with_store(config: NodeConfig, store: Arc<dyn JobStore>) -> Self {
        let settlement = Arc::new(SettlementEngine::new(
            store.clone(),
            config.commissions.clone(),
            config.tip_window_mins,
        ));
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            settlement.clone(),
            notifier,
            config.cancellation.clone(),
        ));
        let claims = Arc::new(ClaimCoordinator::new(store.clone(), config.claim_timeout_ms));

        let (synchronizer, sync_rx) = PoolSynchronizer::new(store.clone(), config.matching.clone());
        let (priority_tx, _priority_rx) = watch::channel(config.priority.clone());

        let state = ApiState {
            store,
            claims,
            lifecycle,
            settlement,
            sync: synchronizer.handle(),
            priority: Arc::new(priority_tx),
            matching: config.matching.clone(),
            draining: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        };

        Self {
            config,
            state,
            synchronizer,
            sync_rx,
        }
    }

    pub fn api_state(&self) -> ApiState {
        self.state.clone()
    }

    /// Run the node with all components.
    ///
    /// Spawns the pool synchronizer and the provider liveness sweeper,
    /// then serves the HTTP API until the shutdown token fires. Once it
    /// does, the node flips into drain mode: new jobs and claims are
    /// refused while in-flight requests finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let Node {
            config,
            state,
            synchronizer,
            sync_rx,
        } = self;

        tokio::spawn(synchronizer.run(sync_rx, shutdown.clone()));

        let sweeper_store = state.store.clone();
        let sweeper_sync = state.sync.clone();
        let sweeper_shutdown = shutdown.clone();
        let provider_timeout_ms = config.provider_timeout_ms;
        let sweep_interval_ms = config.sweep_interval_ms;
        tokio::spawn(async move {
            Self::sweeper_loop(
                sweeper_store,
                sweeper_sync,
                provider_timeout_ms,
                sweep_interval_ms,
                sweeper_shutdown,
            )
            .await;
        });

        let drain_flag = state.draining.clone();
        let drain_token = shutdown.clone();
        tokio::spawn(async move {
            drain_token.cancelled().await;
            drain_flag.store(true, Ordering::SeqCst);
            tracing::info!("Draining: refusing new jobs and claims");
        });

        run_api(config.listen_addr, state, shutdown).await;
        Ok(())
    }

    /// Marks providers offline once their last heartbeat is older than the
    /// configured timeout, and closes any feed session they still hold so
    /// the stream tells the client to resubscribe.
    async fn sweeper_loop(
        store: Arc<dyn JobStore>,
        sync: SyncHandle,
        provider_timeout_ms: u64,
        sweep_interval_ms: u64,
        shutdown: CancellationToken,
    ) {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_millis(sweep_interval_ms));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cutoff = Utc::now() - chrono::Duration::milliseconds(provider_timeout_ms as i64);
                    match store.sweep_stale_providers(cutoff).await {
                        Ok(swept) if !swept.is_empty() => {
                            tracing::info!(count = swept.len(), "Marked stale providers offline");
                            for provider_id in swept {
                                sync.disconnect(provider_id).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Liveness sweep failed");
                        }
                    }
                }

                _ = shutdown.cancelled() => break,
            }
        }
    }
}
