//! Gateway session manager.
//!
//! Owns the shard fleet: resolves bootstrap metadata (cache first, then the
//! external API, with backoff between whole-sequence retries), starts one
//! shard per index, and supervises every shard's reconnect loop. All retry
//! policy lives here; shards never self-schedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_core::{
    ApiError, BackoffPolicy, ConnectionMetadata, EventPipeline, EventRegistry, GatewayConnector,
    MetadataApi, SessionCache, SessionState, ShardId,
};

use crate::protocol::IdentifyCredentials;
use crate::shard::{SessionEnd, Shard};

/// Fatal connect failures. Everything else is retried internally.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// Bootstrap metadata could not be fetched and the policy forbids
    /// retrying.
    #[error("failed to fetch connection metadata: {0}")]
    Api(#[from] ApiError),

    /// A shard ran out of reconnect attempts.
    #[error("shard {shard} exhausted its reconnect budget: {last}")]
    RetriesExhausted {
        /// The shard that gave up.
        shard: ShardId,
        /// The last failure it observed.
        last: String,
    },

    /// The manager was shut down before the fleet became ready.
    #[error("session manager is shut down")]
    Shutdown,
}

/// Session manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Fixed shard count. `None` follows the service's recommendation.
    pub shard_count: Option<u32>,
    /// Backoff between whole connect-sequence retries when the metadata
    /// fetch fails.
    pub bootstrap_backoff: BackoffPolicy,
    /// Backoff between a shard's reconnect attempts.
    pub reconnect_backoff: BackoffPolicy,
    /// TTL applied when caching freshly fetched metadata.
    pub metadata_ttl: Duration,
    /// Gap between identify waves (shards sharing an identify bucket).
    pub identify_wave_interval: Duration,
    /// Per-shard event channel capacity. Bounded so a slow pipeline
    /// backpressures the shard's read loop instead of buffering unboundedly.
    pub event_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shard_count: None,
            bootstrap_backoff: BackoffPolicy::default(),
            reconnect_backoff: BackoffPolicy::default(),
            metadata_ttl: Duration::from_secs(300),
            identify_wave_interval: Duration::from_secs(5),
            event_buffer: 256,
        }
    }
}

/// A scheduled reconnect for one shard.
///
/// Exactly one exists per shard in `Reconnecting`; all are cancelled on
/// shutdown, so no timer outlives the manager and nothing reconnects after
/// it stops.
#[derive(Debug)]
pub struct PendingRetry {
    /// Attempt number the retry will make.
    pub attempt: u32,
    cancel: CancellationToken,
}

/// Orchestrates the shard fleet.
pub struct GatewaySessionManager {
    config: ManagerConfig,
    connector: Arc<dyn GatewayConnector>,
    api: Arc<dyn MetadataApi>,
    cache: Arc<dyn SessionCache>,
    registry: Arc<EventRegistry>,
    cancel: CancellationToken,
    pending_retries: Arc<Mutex<HashMap<u32, PendingRetry>>>,
    shard_states: Mutex<Vec<watch::Receiver<SessionState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    fatal_tx: mpsc::Sender<ConnectError>,
    fatal_rx: tokio::sync::Mutex<mpsc::Receiver<ConnectError>>,
}

impl GatewaySessionManager {
    /// Creates a manager over injected collaborators.
    pub fn new(
        connector: Arc<dyn GatewayConnector>,
        api: Arc<dyn MetadataApi>,
        cache: Arc<dyn SessionCache>,
        registry: Arc<EventRegistry>,
        config: ManagerConfig,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::channel(16);
        Self {
            config,
            connector,
            api,
            cache,
            registry,
            cancel: CancellationToken::new(),
            pending_retries: Arc::new(Mutex::new(HashMap::new())),
            shard_states: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
        }
    }

    /// The handler registry events are dispatched through.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Number of shards in the fleet.
    pub fn shard_count(&self) -> usize {
        self.shard_states.lock().len()
    }

    /// Snapshot of every shard's session state.
    pub fn shard_states(&self) -> Vec<SessionState> {
        self.shard_states
            .lock()
            .iter()
            .map(|rx| *rx.borrow())
            .collect()
    }

    /// A live view of one shard's session state.
    pub fn watch_shard(&self, index: usize) -> Option<watch::Receiver<SessionState>> {
        self.shard_states.lock().get(index).cloned()
    }

    /// Number of reconnects currently scheduled.
    pub fn pending_retry_count(&self) -> usize {
        self.pending_retries.lock().len()
    }

    /// Waits for a fatal condition reported after the fleet became ready.
    pub async fn next_fatal(&self) -> Option<ConnectError> {
        self.fatal_rx.lock().await.recv().await
    }

    /// Connects the fleet.
    ///
    /// Resolves metadata (cache first, API fallback, backoff-driven retries
    /// of the whole sequence), starts one shard per index, and returns once
    /// every shard has reached `Ready` for the first time. Fails only on a
    /// fatal, non-retryable condition.
    pub async fn connect(&self, credentials: IdentifyCredentials) -> Result<(), ConnectError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectError::Shutdown);
        }

        let metadata = self.resolve_metadata().await?;
        let credentials = Arc::new(credentials);

        let total = self
            .config
            .shard_count
            .unwrap_or(metadata.recommended_shard_count)
            .max(1);
        let max_concurrency = metadata.max_concurrency();

        info!(
            shards = total,
            max_concurrency,
            url = %metadata.url,
            "Starting shard fleet"
        );

        let mut ready_waits = Vec::with_capacity(total as usize);
        {
            let mut tasks = self.tasks.lock();
            let mut states = self.shard_states.lock();
            for index in 0..total {
                let id = ShardId::new(index, total);
                let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);
                let (shard, state_rx) = Shard::new(id, Arc::clone(&credentials), events_tx);

                // One pipeline task per shard keeps per-shard dispatch order.
                let pipeline = EventPipeline::new(Arc::clone(&self.registry));
                tasks.push(tokio::spawn(pipeline.run(events_rx)));

                let supervisor = ShardSupervisor {
                    connector: Arc::clone(&self.connector),
                    url: metadata.url.clone(),
                    backoff: self.config.reconnect_backoff.clone(),
                    cancel: self.cancel.child_token(),
                    pending: Arc::clone(&self.pending_retries),
                    fatal: self.fatal_tx.clone(),
                    start_delay: self.config.identify_wave_interval
                        * id.identify_bucket(max_concurrency),
                };
                tasks.push(tokio::spawn(supervisor.run(shard)));

                states.push(state_rx.clone());
                ready_waits.push(state_rx);
            }
        }

        let mut fatal_rx = self.fatal_rx.lock().await;
        tokio::select! {
            _ = wait_all_ready(ready_waits) => Ok(()),
            fatal = fatal_rx.recv() => Err(fatal.unwrap_or(ConnectError::Shutdown)),
            _ = self.cancel.cancelled() => Err(ConnectError::Shutdown),
        }
    }

    /// Resolves connection metadata: cache, then API, retrying the whole
    /// sequence per the bootstrap backoff policy.
    async fn resolve_metadata(&self) -> Result<ConnectionMetadata, ConnectError> {
        let mut attempt = 0u32;
        loop {
            match self.cache.get().await {
                Ok(Some(metadata)) => {
                    debug!(url = %metadata.url, "Using cached connection metadata");
                    return Ok(metadata);
                }
                Ok(None) => debug!("No cached connection metadata"),
                // A cache error is logged but treated exactly like a miss.
                Err(e) => warn!(error = %e, "Session cache error, falling through to API"),
            }

            match self.api.fetch_connection_metadata().await {
                Ok(metadata) => {
                    if let Err(e) = self
                        .cache
                        .set(metadata.clone(), self.config.metadata_ttl)
                        .await
                    {
                        warn!(error = %e, "Failed to cache connection metadata");
                    }
                    return Ok(metadata);
                }
                Err(e) => {
                    let decision = self.config.bootstrap_backoff.next(attempt);
                    if !decision.should_retry {
                        error!(
                            error = %e,
                            attempt,
                            "Failed to fetch connection metadata and retrying is not enabled"
                        );
                        return Err(ConnectError::Api(e));
                    }
                    warn!(
                        error = %e,
                        attempt,
                        delay = ?decision.delay,
                        "Metadata fetch failed, retrying connect sequence"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ConnectError::Shutdown),
                        _ = sleep(decision.delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Shuts the fleet down.
    ///
    /// Cancels every scheduled retry, then every shard (which stops its
    /// timers and handshake waits, closes its transport, and reports
    /// `Closed`), and joins all supervision and pipeline tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down session manager");

        // Scheduled retries go first so no shard re-enters Connecting while
        // the fleet is stopping.
        let pending: Vec<PendingRetry> = {
            let mut guard = self.pending_retries.lock();
            guard.drain().map(|(_, retry)| retry).collect()
        };
        for retry in &pending {
            retry.cancel.cancel();
        }
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock();
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        info!("Session manager stopped");
    }
}

async fn wait_all_ready(mut states: Vec<watch::Receiver<SessionState>>) {
    for rx in &mut states {
        if rx.wait_for(|s| *s == SessionState::Ready).await.is_err() {
            // The shard's supervisor ended without reaching Ready; the fatal
            // channel carries the real error, so this branch never resolves.
            std::future::pending::<()>().await;
        }
    }
}

/// Drives one shard's session/reconnect loop.
struct ShardSupervisor {
    connector: Arc<dyn GatewayConnector>,
    url: String,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
    pending: Arc<Mutex<HashMap<u32, PendingRetry>>>,
    fatal: mpsc::Sender<ConnectError>,
    start_delay: Duration,
}

impl ShardSupervisor {
    async fn run(self, mut shard: Shard) {
        // Identify pacing: later waves wait their turn.
        if !self.start_delay.is_zero() {
            debug!(shard = %shard.id(), delay = ?self.start_delay, "Waiting for identify wave");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    shard.finalize();
                    return;
                }
                _ = sleep(self.start_delay) => {}
            }
        }

        let mut attempts = 0u32;
        loop {
            let end = shard
                .run_session(self.connector.as_ref(), &self.url, &self.cancel)
                .await;

            let failure = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Closed { reason, after_ready } => {
                    if after_ready {
                        attempts = 0;
                    }
                    reason.to_string()
                }
                SessionEnd::ConnectFailed(e) => e.to_string(),
                SessionEnd::HandshakeFailed(e) => e.to_string(),
            };

            let decision = self.backoff.next(attempts);
            if !decision.should_retry {
                error!(
                    shard = %shard.id(),
                    url = %self.url,
                    last_error = %failure,
                    "Reconnect budget exhausted"
                );
                if self
                    .fatal
                    .try_send(ConnectError::RetriesExhausted {
                        shard: shard.id(),
                        last: failure,
                    })
                    .is_err()
                {
                    debug!(shard = %shard.id(), "Fatal channel full or closed");
                }
                break;
            }

            warn!(
                shard = %shard.id(),
                attempt = attempts,
                delay = ?decision.delay,
                error = %failure,
                "Scheduling reconnect"
            );

            let retry_cancel = self.cancel.child_token();
            self.pending.lock().insert(
                shard.id().index,
                PendingRetry {
                    attempt: attempts,
                    cancel: retry_cancel.clone(),
                },
            );
            let cancelled = tokio::select! {
                _ = retry_cancel.cancelled() => true,
                _ = sleep(decision.delay) => false,
            };
            self.pending.lock().remove(&shard.id().index);
            if cancelled {
                break;
            }
            attempts += 1;
        }

        shard.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FailingCache, MockApi, MockGateway};
    use tether_core::{CloseReason, MemorySessionCache, SessionStartLimit};
    use tokio::time::Instant;

    fn metadata(shards: u32, max_concurrency: u32) -> ConnectionMetadata {
        ConnectionMetadata {
            url: "wss://gateway.test".to_string(),
            recommended_shard_count: shards,
            session_start_limit: SessionStartLimit {
                max_concurrency,
                ..SessionStartLimit::default()
            },
        }
    }

    fn manager(
        gateway: Arc<MockGateway>,
        api: MockApi,
        cache: Arc<dyn SessionCache>,
        config: ManagerConfig,
    ) -> GatewaySessionManager {
        GatewaySessionManager::new(
            gateway,
            Arc::new(api),
            cache,
            Arc::new(EventRegistry::new()),
            config,
        )
    }

    fn credentials() -> IdentifyCredentials {
        IdentifyCredentials::new("token", 0)
    }

    #[tokio::test(start_paused = true)]
    async fn cache_miss_and_api_success_brings_recommended_fleet_ready() {
        let gateway = Arc::new(MockGateway::new());
        let api = MockApi::always(metadata(3, 3));
        let cache = Arc::new(MemorySessionCache::new());
        let mgr = manager(
            Arc::clone(&gateway),
            api,
            Arc::clone(&cache) as Arc<dyn SessionCache>,
            ManagerConfig::default(),
        );

        mgr.connect(credentials()).await.unwrap();

        assert_eq!(mgr.shard_count(), 3);
        assert!(
            mgr.shard_states()
                .iter()
                .all(|s| *s == SessionState::Ready)
        );
        assert_eq!(gateway.open_count(), 3);
        // The fetched metadata is now cached for the next connect.
        assert!(cache.get().await.unwrap().is_some());

        mgr.shutdown().await;
        assert!(
            mgr.shard_states()
                .iter()
                .all(|s| *s == SessionState::Closed)
        );
        assert_eq!(mgr.pending_retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_fetch_retries_with_exponential_backoff() {
        let gateway = Arc::new(MockGateway::new());
        let api = Arc::new(MockApi::sequence(vec![
            Err(ApiError::Request("connection refused".into())),
            Err(ApiError::Request("connection refused".into())),
            Ok(metadata(1, 1)),
        ]));
        let config = ManagerConfig {
            bootstrap_backoff: BackoffPolicy::exponential(Duration::from_millis(1000))
                .with_max_attempts(3),
            ..ManagerConfig::default()
        };
        let mgr = GatewaySessionManager::new(
            Arc::clone(&gateway) as Arc<dyn GatewayConnector>,
            Arc::clone(&api) as Arc<dyn MetadataApi>,
            Arc::new(MemorySessionCache::new()),
            Arc::new(EventRegistry::new()),
            config,
        );

        let start = Instant::now();
        mgr.connect(credentials()).await.unwrap();

        // Two failures cost 1000ms + 2000ms; the third attempt succeeds.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "connected too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "connected too late: {elapsed:?}");
        assert_eq!(api.call_count(), 3);
        assert_eq!(mgr.shard_count(), 1);

        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_failure_with_retry_disabled_is_fatal() {
        let gateway = Arc::new(MockGateway::new());
        let config = ManagerConfig {
            bootstrap_backoff: BackoffPolicy::no_retry(),
            ..ManagerConfig::default()
        };
        let mgr = manager(
            Arc::clone(&gateway),
            MockApi::failing(),
            Arc::new(MemorySessionCache::new()),
            config,
        );

        let err = mgr.connect(credentials()).await.unwrap_err();
        assert!(matches!(err, ConnectError::Api(_)));
        assert_eq!(mgr.shard_count(), 0, "no shards may be created on fatal bootstrap");
        assert_eq!(gateway.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_skips_the_api_entirely() {
        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemorySessionCache::new());
        cache
            .set(metadata(1, 1), Duration::from_secs(300))
            .await
            .unwrap();
        let api = Arc::new(MockApi::failing());
        let mgr = GatewaySessionManager::new(
            Arc::clone(&gateway) as Arc<dyn GatewayConnector>,
            Arc::clone(&api) as Arc<dyn MetadataApi>,
            cache,
            Arc::new(EventRegistry::new()),
            ManagerConfig::default(),
        );

        mgr.connect(credentials()).await.unwrap();
        assert_eq!(mgr.shard_count(), 1);
        assert_eq!(api.call_count(), 0, "a cache hit must not touch the API");

        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cache_error_falls_through_to_api() {
        let gateway = Arc::new(MockGateway::new());
        let api = Arc::new(MockApi::always(metadata(1, 1)));
        let mgr = GatewaySessionManager::new(
            Arc::clone(&gateway) as Arc<dyn GatewayConnector>,
            Arc::clone(&api) as Arc<dyn MetadataApi>,
            Arc::new(FailingCache),
            Arc::new(EventRegistry::new()),
            ManagerConfig::default(),
        );

        mgr.connect(credentials()).await.unwrap();
        assert_eq!(mgr.shard_count(), 1);
        assert_eq!(api.call_count(), 1, "a cache error must be treated as a miss");

        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn non_resumable_close_reconnects_with_identify() {
        let gateway = Arc::new(MockGateway::new());
        let api = MockApi::always(metadata(1, 1));
        let config = ManagerConfig {
            reconnect_backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
            ..ManagerConfig::default()
        };
        let mgr = manager(
            Arc::clone(&gateway),
            api,
            Arc::new(MemorySessionCache::new()),
            config,
        );

        mgr.connect(credentials()).await.unwrap();
        let mut state = mgr.watch_shard(0).unwrap();

        gateway
            .handle(0)
            .close(CloseReason::from_code(4014, "disallowed intents"));

        state
            .wait_for(|s| *s == SessionState::Reconnecting)
            .await
            .unwrap();
        state
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();

        let ops = gateway.handle(1).sent_ops();
        assert_eq!(ops[0], 2, "reconnect after a non-resumable close must identify");
        assert!(!ops.contains(&6), "no resume may reference the discarded token");

        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_retry_is_tracked_and_cancelled_on_shutdown() {
        let gateway = Arc::new(MockGateway::new());
        let api = MockApi::always(metadata(1, 1));
        let config = ManagerConfig {
            // A long delay keeps the retry window open for inspection.
            reconnect_backoff: BackoffPolicy::fixed(Duration::from_secs(600)),
            ..ManagerConfig::default()
        };
        let mgr = manager(
            Arc::clone(&gateway),
            api,
            Arc::new(MemorySessionCache::new()),
            config,
        );

        mgr.connect(credentials()).await.unwrap();
        assert_eq!(mgr.pending_retry_count(), 0);

        let mut state = mgr.watch_shard(0).unwrap();
        gateway.handle(0).close(CloseReason::from_code(4000, ""));
        state
            .wait_for(|s| *s == SessionState::Reconnecting)
            .await
            .unwrap();
        // Let the supervisor reach its retry sleep.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            mgr.pending_retry_count(),
            1,
            "one shard in Reconnecting must mean one pending retry"
        );

        mgr.shutdown().await;
        assert_eq!(mgr.pending_retry_count(), 0);
        assert_eq!(*state.borrow(), SessionState::Closed);
        // The cancelled retry never reconnected.
        assert_eq!(gateway.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_budget_is_fatal() {
        let gateway = Arc::new(MockGateway::new());
        let api = MockApi::always(metadata(1, 1));
        let config = ManagerConfig {
            reconnect_backoff: BackoffPolicy::fixed(Duration::from_millis(100))
                .with_max_attempts(2),
            ..ManagerConfig::default()
        };
        let mgr = manager(
            Arc::clone(&gateway),
            api,
            Arc::new(MemorySessionCache::new()),
            config,
        );

        mgr.connect(credentials()).await.unwrap();

        // Every further open fails, so the budget of 2 attempts drains.
        gateway.fail_next_opens(usize::MAX);
        gateway.handle(0).close(CloseReason::from_code(4000, ""));

        let fatal = mgr.next_fatal().await.unwrap();
        assert!(matches!(fatal, ConnectError::RetriesExhausted { .. }));

        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn identify_waves_are_staggered_by_concurrency_bucket() {
        let gateway = Arc::new(MockGateway::new());
        // Two shards, one identify per wave: the second waits 5s.
        let api = MockApi::always(metadata(2, 1));
        let mgr = manager(
            Arc::clone(&gateway),
            api,
            Arc::new(MemorySessionCache::new()),
            ManagerConfig::default(),
        );

        let start = Instant::now();
        mgr.connect(credentials()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(mgr.shard_count(), 2);

        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_shutdown_is_rejected() {
        let gateway = Arc::new(MockGateway::new());
        let api = MockApi::always(metadata(1, 1));
        let mgr = manager(
            Arc::clone(&gateway),
            api,
            Arc::new(MemorySessionCache::new()),
            ManagerConfig::default(),
        );

        mgr.shutdown().await;
        let err = mgr.connect(credentials()).await.unwrap_err();
        assert!(matches!(err, ConnectError::Shutdown));
        assert_eq!(gateway.attempt_count(), 0);
    }
}
