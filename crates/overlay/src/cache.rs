//! Background-refreshed snapshot of selectable nodes

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use satnet_overlay_db::{EligibleNodes, NodeId, NodeStore, SelectedNode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{NodeSelectionConfig, SelectionCacheConfig, parse_minimum_version};
use crate::criteria::{FindStorageNodesRequest, default_criteria, resolve};
use crate::error::{OverlayError, OverlayResult, cancellable};
use crate::placement::{PlacementRules, filter_for};
use crate::selection::{Exclusions, select_nodes};

/// How long shutdown waits for the refresh task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type RefreshFuture = Shared<BoxFuture<'static, OverlayResult<Arc<SelectionSnapshot>>>>;

/// Immutable set of selectable nodes, replaced wholesale on refresh.
#[derive(Debug)]
pub struct SelectionSnapshot {
    nodes: EligibleNodes,
    networks: HashMap<NodeId, String>,
    created_at: DateTime<Utc>,
    built: Instant,
}

impl SelectionSnapshot {
    fn new(nodes: EligibleNodes) -> Self {
        let networks = nodes
            .reputable
            .iter()
            .chain(&nodes.new)
            .map(|node| (node.id, node.last_net.clone()))
            .collect();

        Self {
            nodes,
            networks,
            created_at: Utc::now(),
            built: Instant::now(),
        }
    }

    /// Vetted nodes.
    #[must_use]
    pub fn reputable(&self) -> &[SelectedNode] {
        &self.nodes.reputable
    }

    /// Nodes still in vetting.
    #[must_use]
    pub fn new_nodes(&self) -> &[SelectedNode] {
        &self.nodes.new
    }

    /// Total nodes in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Wall-clock time the snapshot was taken.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since the snapshot was taken.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.built.elapsed()
    }

    /// Whether `id` is in the snapshot.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.networks.contains_key(id)
    }

    /// Splits `ids` into the networks known to the snapshot and the IDs it
    /// does not hold.
    fn known_networks(&self, ids: &HashSet<NodeId>) -> (HashSet<String>, Vec<NodeId>) {
        let mut networks = HashSet::new();
        let mut missing = Vec::new();
        for id in ids {
            match self.networks.get(id) {
                Some(network) => {
                    networks.insert(network.clone());
                }
                None => missing.push(*id),
            }
        }
        (networks, missing)
    }
}

struct CacheState<S>
where
    S: NodeStore,
{
    store: Arc<S>,
    node_config: NodeSelectionConfig,
    cache_config: SelectionCacheConfig,
    placement: Arc<dyn PlacementRules>,
    snapshot: ArcSwapOption<SelectionSnapshot>,
    in_flight: Mutex<Option<RefreshFuture>>,
    shutdown: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Drop for CacheState<S>
where
    S: NodeStore,
{
    fn drop(&mut self) {
        // Stops the refresh loop when the last handle goes away without
        // an explicit shutdown.
        self.shutdown.cancel();
    }
}

impl<S> CacheState<S>
where
    S: NodeStore,
{
    async fn rebuild(&self) -> OverlayResult<Arc<SelectionSnapshot>> {
        let criteria = default_criteria(&self.node_config)?;
        let started = Instant::now();

        let nodes = cancellable(&self.shutdown, self.store.read_by_criteria(&criteria)).await?;
        let snapshot = Arc::new(SelectionSnapshot::new(nodes));
        self.snapshot.store(Some(Arc::clone(&snapshot)));

        debug!(
            "Rebuilt selection snapshot: {} reputable, {} new in {:?}",
            snapshot.reputable().len(),
            snapshot.new_nodes().len(),
            started.elapsed()
        );

        Ok(snapshot)
    }
}

/// Serves node selection from an in-memory snapshot of the store.
///
/// A snapshot older than the configured staleness is rebuilt before answering.
/// Concurrent callers share one rebuild. The background loop stops on
/// [`shutdown`](Self::shutdown) or once every handle is dropped.
pub struct SelectionCache<S>
where
    S: NodeStore,
{
    state: Arc<CacheState<S>>,
}

impl<S> SelectionCache<S>
where
    S: NodeStore,
{
    /// Create a cache over `store`. Nothing is read until the first request or
    /// [`start`](Self::start).
    pub fn new(
        store: Arc<S>,
        node_config: NodeSelectionConfig,
        cache_config: SelectionCacheConfig,
        placement: Arc<dyn PlacementRules>,
    ) -> Self {
        info!(
            "Creating selection cache with staleness {:?} and refresh interval {:?}",
            cache_config.staleness, cache_config.refresh_interval
        );

        Self {
            state: Arc::new(CacheState {
                store,
                node_config,
                cache_config,
                placement,
                snapshot: ArcSwapOption::empty(),
                in_flight: Mutex::new(None),
                shutdown: CancellationToken::new(),
                refresh_task: Mutex::new(None),
            }),
        }
    }

    /// Build the first snapshot and start the background refresh loop.
    ///
    /// # Errors
    ///
    /// Returns the error of the initial rebuild.
    pub async fn start(&self) -> OverlayResult<()> {
        info!("Starting selection cache");

        self.refresh().await?;
        self.start_refresh_task();

        Ok(())
    }

    /// Stop the background loop, abandoning any rebuild in flight.
    ///
    /// The cache cannot be restarted afterwards.
    pub async fn shutdown(&self) -> OverlayResult<()> {
        info!("Shutting down selection cache");

        self.state.shutdown.cancel();

        let task = self.state.refresh_task.lock().take();
        if let Some(task) = task {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!("Selection refresh task completed"),
                Ok(Err(e)) => warn!("Selection refresh task failed: {}", e),
                Err(_) => warn!("Selection refresh task timed out"),
            }
        }

        Ok(())
    }

    /// Rebuild the snapshot now, or join the rebuild already running.
    ///
    /// # Errors
    ///
    /// Returns store errors, or [`OverlayError::Cancelled`] if the cache was
    /// shut down mid-rebuild. The previous snapshot is kept on failure.
    pub async fn refresh(&self) -> OverlayResult<Arc<SelectionSnapshot>> {
        self.refresh_future().await
    }

    /// Current snapshot, however old.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<SelectionSnapshot>> {
        self.state.snapshot.load_full()
    }

    /// Whether `request` can be answered from the snapshot.
    ///
    /// The snapshot is built from process-wide criteria, so requests needing a
    /// stricter version floor, or excluding more nodes than the configured
    /// limit, must go to the store.
    #[must_use]
    pub fn accepts(&self, request: &FindStorageNodesRequest) -> bool {
        let cache_config = &self.state.cache_config;
        if cache_config.disabled
            || self.state.shutdown.is_cancelled()
            || request.excluded_ids.len() > cache_config.max_cached_exclusions
        {
            return false;
        }

        let Some(raw) = request.minimum_version.as_deref() else {
            return true;
        };
        match (
            parse_minimum_version(raw),
            self.state.node_config.minimum_version(),
        ) {
            (Ok(None), _) => true,
            (Ok(Some(requested)), Ok(Some(floor))) => requested <= floor,
            _ => false,
        }
    }

    /// Select nodes for `request` from the snapshot.
    ///
    /// # Errors
    ///
    /// Returns validation errors for malformed requests, `NotEnoughNodes` when
    /// the snapshot cannot satisfy the quota, and `Cancelled` if `cancel` fires
    /// while waiting for a rebuild. A failed rebuild is only surfaced when
    /// there is no earlier snapshot to fall back to. Store errors are returned
    /// when excluded nodes outside the snapshot need their networks looked up.
    pub async fn get_nodes(
        &self,
        request: &FindStorageNodesRequest,
        cancel: &CancellationToken,
    ) -> OverlayResult<Vec<SelectedNode>> {
        let resolved = resolve(request, &self.state.node_config)?;
        let filter = filter_for(self.state.placement.as_ref(), resolved.placement)?;
        let snapshot = self.current(cancel).await?;

        let excluded_ids = &resolved.criteria.excluded_ids;
        let networks = if resolved.plan.distinct_network {
            let (mut networks, missing) = snapshot.known_networks(excluded_ids);
            // Offline or otherwise ineligible nodes are absent from the
            // snapshot but still block their network.
            if !missing.is_empty() {
                networks.extend(
                    cancellable(cancel, self.state.store.get_nodes_network(&missing)).await?,
                );
            }
            networks
        } else {
            HashSet::new()
        };

        let exclusions = Exclusions {
            ids: excluded_ids.clone(),
            networks,
        };
        select_nodes(
            &snapshot.nodes,
            &resolved.plan,
            &exclusions,
            &filter,
            &mut rand::thread_rng(),
        )
    }

    async fn current(&self, cancel: &CancellationToken) -> OverlayResult<Arc<SelectionSnapshot>> {
        let previous = self.state.snapshot.load_full();
        if let Some(snapshot) = &previous {
            if snapshot.age() <= self.state.cache_config.staleness {
                return Ok(Arc::clone(snapshot));
            }
        }

        let refresh = self.refresh_future();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(OverlayError::Cancelled),
            result = refresh => result,
        };

        match (result, previous) {
            (Ok(snapshot), _) => Ok(snapshot),
            (Err(e), Some(previous)) => {
                warn!(
                    "Selection snapshot rebuild failed, serving snapshot aged {:?}: {}",
                    previous.age(),
                    e
                );
                Ok(previous)
            }
            (Err(e), None) => Err(e),
        }
    }

    fn refresh_future(&self) -> RefreshFuture {
        let mut in_flight = self.state.in_flight.lock();
        if let Some(refresh) = in_flight.as_ref() {
            return refresh.clone();
        }

        // The rebuild runs on its own task so a joiner dropping out never
        // aborts it for the others.
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let result = state.rebuild().await;
            if let Err(e) = &result {
                debug!("Selection snapshot rebuild failed: {}", e);
            }
            state.in_flight.lock().take();
            result
        });

        let refresh = async move {
            handle
                .await
                .map_err(|e| OverlayError::Internal(format!("selection refresh task: {e}")))?
        }
        .boxed()
        .shared();

        *in_flight = Some(refresh.clone());
        refresh
    }

    fn start_refresh_task(&self) {
        let state = Arc::downgrade(&self.state);
        let shutdown = self.state.shutdown.clone();
        let refresh_interval = self.state.cache_config.refresh_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + refresh_interval,
                refresh_interval,
            );
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(state) = state.upgrade() else {
                            break;
                        };
                        let cache = Self { state };
                        match cache.refresh().await {
                            Ok(snapshot) => debug!("Background refresh: {} nodes", snapshot.len()),
                            Err(OverlayError::Cancelled) => {}
                            Err(e) => error!("Failed to refresh selection snapshot: {}", e),
                        }
                    }
                    () = shutdown.cancelled() => {
                        info!("Selection refresh task shutting down");
                        break;
                    }
                }
            }
        });

        *self.state.refresh_task.lock() = Some(task);
    }
}

impl<S> Clone for SelectionCache<S>
where
    S: NodeStore,
{
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S> Debug for SelectionCache<S>
where
    S: NodeStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionCache")
            .field("staleness", &self.state.cache_config.staleness)
            .field("snapshot_len", &self.snapshot().map(|s| s.len()))
            .finish_non_exhaustive()
    }
}
