//! # Topology Refresh
//!
//! Purpose: Fetch the cluster's slot layout, install it as the new slot map,
//! and keep it current through redirect-triggered, periodic and manual
//! refreshes.
//!
//! ## Design Principles
//! 1. **Coalesced Refresh**: Callers that ask for a refresh while one is in
//!    flight wait for it and share its outcome instead of starting another.
//! 2. **Old Map Survives Failure**: If no node answers, the previous map stays
//!    installed and only the triggering caller sees the error.
//! 3. **Known Nodes First**: Primaries of the current map are asked before
//!    the configured seeds, which may be long gone.
//!
//! ## Coalescing
//!
//! ```text
//! caller A: observe epoch 4 -> lock -> fetch ...... install -> epoch 5 -> unlock
//! caller B: observe epoch 4 -> wait on lock ...................... -> epoch 5 > 4: reuse A's outcome
//! caller C: (arrives after unlock) observe epoch 5 -> lock -> fetch again
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ckv_common::{Command, Value};
use futures::future::join_all;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeAddress;
use crate::error::{ClientError, ClientResult, RequestError};
use crate::pool::NodeRegistry;
use crate::slot_map::{SlotMap, SlotMapCell};

#[derive(Default)]
struct RefreshState {
    epoch: u64,
    last: Option<ClientResult<Arc<SlotMap>>>,
}

/// Owns the slot map and the refresh machinery.
pub struct TopologyManager {
    seeds: Vec<NodeAddress>,
    cell: SlotMapCell,
    registry: Arc<NodeRegistry>,
    request_timeout: Duration,
    completed: AtomicU64,
    state: AsyncMutex<RefreshState>,
}

impl TopologyManager {
    pub fn new(seeds: Vec<NodeAddress>, registry: Arc<NodeRegistry>, request_timeout: Duration) -> Self {
        TopologyManager {
            seeds,
            cell: SlotMapCell::new(),
            registry,
            request_timeout,
            completed: AtomicU64::new(0),
            state: AsyncMutex::new(RefreshState::default()),
        }
    }

    /// Current slot map; `NotInitialized` before the first successful refresh.
    pub fn snapshot(&self) -> ClientResult<Arc<SlotMap>> {
        self.cell.snapshot()
    }

    /// Fetches and installs a fresh slot map.
    ///
    /// Safe to call concurrently: overlapping calls share one fetch.
    pub async fn refresh(&self) -> ClientResult<Arc<SlotMap>> {
        let observed = self.completed.load(Ordering::Acquire);
        let mut state = self.state.lock().await;
        if state.epoch > observed {
            if let Some(outcome) = &state.last {
                debug!("joining completed topology refresh");
                return outcome.clone();
            }
        }

        let outcome = self.fetch_and_install().await;
        state.epoch += 1;
        state.last = Some(outcome.clone());
        self.completed.store(state.epoch, Ordering::Release);
        outcome
    }

    async fn fetch_and_install(&self) -> ClientResult<Arc<SlotMap>> {
        let map = self.fetch().await?;
        let (map, changed) = self.cell.update(map);
        if changed {
            info!(
                shards = map.shard_count(),
                nodes = map.all_nodes().len(),
                covered = map.is_fully_covered(),
                "topology updated"
            );
            self.registry.retain(&map.all_nodes());
            if self.registry.tracks_zones() {
                self.learn_replica_zones(&map).await;
            }
        } else {
            debug!("topology unchanged");
        }
        Ok(map)
    }

    async fn fetch(&self) -> ClientResult<SlotMap> {
        let mut last_error = None;
        for addr in self.candidates() {
            match self.fetch_from(&addr).await {
                Ok(map) => return Ok(map),
                Err(ClientError::Closing) if self.registry.is_closed() => return Err(ClientError::Closing),
                Err(err) => {
                    warn!(node = %addr, error = %err, "topology fetch failed");
                    if err.is_connection_error() {
                        self.registry.invalidate(&addr);
                    }
                    last_error = Some(err);
                }
            }
        }

        let detail = match last_error {
            Some(err) => format!("no node returned a usable topology, last error: {}", err),
            None => "no node to ask for topology".to_string(),
        };
        Err(ClientError::connection(
            "cluster",
            io::Error::new(io::ErrorKind::NotConnected, detail),
        ))
    }

    /// Connects to every replica so its zone is known before reads pick one.
    async fn learn_replica_zones(&self, map: &SlotMap) {
        let primaries = map.primaries();
        let replicas: Vec<NodeAddress> = map
            .all_nodes()
            .into_iter()
            .filter(|node| !primaries.contains(node))
            .collect();
        let connects = replicas.iter().map(|addr| async move {
            if let Err(err) = self.registry.get_connection(addr).await {
                debug!(node = %addr, error = %err, "replica unreachable, zone unknown");
            }
        });
        if tokio::time::timeout(self.request_timeout, join_all(connects)).await.is_err() {
            debug!("replica zone lookup timed out");
        }
    }

    async fn fetch_from(&self, addr: &NodeAddress) -> ClientResult<SlotMap> {
        let cmd = Command::new("CLUSTER").arg("SLOTS");
        let exchange = async { self.registry.get_connection(addr).await?.send(&cmd).await };
        let reply = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout {
                command: cmd.full_name(),
                addr: addr.to_string(),
                timeout: self.request_timeout,
            })??;
        match reply {
            Value::ServerError(err) => Err(RequestError::from_server(&err, cmd.full_name(), addr).into()),
            reply => SlotMap::from_cluster_slots(reply, addr),
        }
    }

    /// Primaries of the current map, then its replicas, then the seeds.
    fn candidates(&self) -> Vec<NodeAddress> {
        let mut nodes = Vec::new();
        if let Ok(map) = self.cell.snapshot() {
            nodes.extend(map.primaries());
            nodes.extend(map.all_nodes());
        }
        nodes.extend(self.seeds.iter().cloned());

        let mut unique = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !unique.contains(&node) {
                unique.push(node);
            }
        }
        unique
    }

    /// Refreshes every `interval` until `shutdown` fires or the manager is dropped.
    pub fn spawn_periodic_checks(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; connect already refreshed.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else { break };
                if let Err(err) = manager.refresh().await {
                    warn!(error = %err, "periodic topology check failed");
                }
            }
            debug!("periodic topology checks stopped");
        });
    }
}
