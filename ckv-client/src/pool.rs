//! # Node Registry
//!
//! Purpose: Own exactly one logical connection per known node, create it on
//! first use, and replace it after it breaks.
//!
//! ## Design Principles
//! 1. **One Connection per Node**: Every caller targeting a node shares its
//!    multiplexed `NodeConnection`.
//! 2. **One Attempt per Node**: Connecting runs in its own task. Callers
//!    racing to a cold node await the same attempt, and a caller that stops
//!    waiting does not cancel it.
//! 3. **Failures Are Shared Too**: A failed attempt is remembered until the
//!    next backoff window; callers in between get the same error at once.
//! 4. **Handshake Once**: Protocol, name, database, replica reads and the
//!    node's availability zone are set up when the connection opens, never
//!    per request.
//! 5. **Close Is Final**: After `close`, every lookup fails with `Closing`
//!    without touching the network. Dropping a single node (prune or
//!    invalidate) only releases the registry's handle; requests already on
//!    that connection still get their replies.
//!
//! ## Slot States
//!
//! ```text
//! Idle --lookup--> Connecting --ok--> Ready --broken/invalidate--> Idle
//!                      |
//!                      +--err--> Failed --retry window over--> Connecting
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ckv_common::{Command, ProtocolVersion, Value};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{BackoffStrategy, ClientConfig, NodeAddress};
use crate::connection::{Connector, NodeConnection};
use crate::error::{ClientError, ClientResult, RequestError};

/// Connection settings the registry needs from the client config.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub connect_timeout: Duration,
    pub reconnect: BackoffStrategy,
    pub protocol: ProtocolVersion,
    pub client_name: Option<String>,
    pub database_id: u32,
    /// Send `READONLY` so replicas accept reads.
    pub readonly: bool,
    /// Ask each node for its `availability-zone`.
    pub query_zone: bool,
}

impl RegistryConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        RegistryConfig {
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect,
            protocol: config.protocol,
            client_name: config.client_name.clone(),
            database_id: if config.cluster_mode { 0 } else { config.database_id },
            readonly: config.cluster_mode && config.read_from.reads_replicas(),
            query_zone: config.cluster_mode && config.read_from.client_az().is_some(),
        }
    }

    /// Commands sent on every new connection, in order. The zone query, when
    /// present, is always last.
    fn handshake(&self) -> Vec<Command> {
        let mut cmds = Vec::new();
        if self.protocol == ProtocolVersion::Resp3 {
            cmds.push(Command::new("HELLO").arg("3"));
        }
        if let Some(name) = &self.client_name {
            cmds.push(Command::new("CLIENT").arg("SETNAME").arg(name.clone()));
        }
        if self.database_id != 0 {
            cmds.push(Command::new("SELECT").arg_int(self.database_id as i64));
        }
        if self.readonly {
            cmds.push(Command::new("READONLY"));
        }
        if self.query_zone {
            cmds.push(Command::new("CONFIG").arg("GET").arg("availability-zone"));
        }
        cmds
    }

    /// How long a failed connect is reported without trying again.
    fn retry_window(&self) -> Duration {
        self.reconnect.delay(self.reconnect.num_of_retries)
    }
}

/// Availability zone each node reported when it connected.
#[derive(Debug, Default)]
pub struct NodeZones {
    zones: RwLock<HashMap<NodeAddress, String>>,
}

impl NodeZones {
    pub fn record(&self, addr: &NodeAddress, zone: Option<String>) {
        let mut zones = self.zones.write();
        match zone {
            Some(zone) => zones.insert(addr.clone(), zone),
            None => zones.remove(addr),
        };
    }

    pub fn get(&self, addr: &NodeAddress) -> Option<String> {
        self.zones.read().get(addr).cloned()
    }

    pub fn is_in(&self, addr: &NodeAddress, zone: &str) -> bool {
        self.zones.read().get(addr).map_or(false, |z| z == zone)
    }

    fn retain(&self, keep: &[NodeAddress]) {
        self.zones.write().retain(|addr, _| keep.contains(addr));
    }
}

type Connecting = Shared<BoxFuture<'static, ClientResult<NodeConnection>>>;

enum SlotState {
    Idle,
    Connecting(Connecting),
    Ready(NodeConnection),
    Failed { error: ClientError, retry_at: Instant },
}

impl fmt::Debug for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Idle => f.write_str("Idle"),
            SlotState::Connecting(_) => f.write_str("Connecting"),
            SlotState::Ready(conn) => f.debug_tuple("Ready").field(conn).finish(),
            SlotState::Failed { error, .. } => f.debug_struct("Failed").field("error", error).finish(),
        }
    }
}

type Slot = Arc<Mutex<SlotState>>;

/// Everything a background connect needs, detached from the registry.
#[derive(Debug, Clone)]
struct Opener {
    config: RegistryConfig,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
    zones: Arc<NodeZones>,
}

/// Lazily connected, shared connections keyed by node address.
#[derive(Debug)]
pub struct NodeRegistry {
    opener: Opener,
    slots: Mutex<HashMap<NodeAddress, Slot>>,
}

impl NodeRegistry {
    /// Creates an empty registry. Cancelling `shutdown` closes it.
    pub fn new(config: RegistryConfig, connector: Arc<dyn Connector>, shutdown: CancellationToken) -> Self {
        NodeRegistry {
            opener: Opener {
                config,
                connector,
                shutdown,
                zones: Arc::new(NodeZones::default()),
            },
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Zones reported by connected nodes.
    pub fn zones(&self) -> Arc<NodeZones> {
        self.opener.zones.clone()
    }

    /// True when nodes are asked for their zone on connect.
    pub fn tracks_zones(&self) -> bool {
        self.opener.config.query_zone
    }

    /// Returns the live connection to `addr`, opening one if needed.
    ///
    /// Dropping the returned future does not cancel a connect in progress.
    pub async fn get_connection(&self, addr: &NodeAddress) -> ClientResult<NodeConnection> {
        if self.is_closed() {
            return Err(ClientError::Closing);
        }

        let connecting = {
            let slot = self.slot(addr);
            let mut state = slot.lock();
            let in_flight = match &*state {
                SlotState::Ready(conn) if !conn.is_broken() => return Ok(conn.clone()),
                SlotState::Failed { error, retry_at } if Instant::now() < *retry_at => {
                    return Err(error.clone())
                }
                SlotState::Connecting(in_flight) => Some(in_flight.clone()),
                SlotState::Ready(_) => {
                    warn!(node = %addr, "connection broken, reconnecting");
                    None
                }
                SlotState::Idle | SlotState::Failed { .. } => None,
            };
            match in_flight {
                Some(in_flight) => in_flight,
                None => {
                    let connecting = self.opener.spawn_establish(addr.clone(), Arc::downgrade(&slot));
                    *state = SlotState::Connecting(connecting.clone());
                    connecting
                }
            }
        };
        connecting.await
    }

    /// Releases the registry's handle to `addr`; the next lookup reconnects.
    ///
    /// A connect in progress or a remembered failure is left as is.
    pub fn invalidate(&self, addr: &NodeAddress) {
        let slot = self.slots.lock().get(addr).cloned();
        if let Some(slot) = slot {
            let mut state = slot.lock();
            if matches!(*state, SlotState::Ready(_)) {
                debug!(node = %addr, "invalidating connection");
                *state = SlotState::Idle;
            }
        }
    }

    /// Forgets nodes not in `keep`. Their connections wind down once the
    /// requests already sent on them have been answered.
    pub fn retain(&self, keep: &[NodeAddress]) {
        self.slots.lock().retain(|addr, _| {
            let kept = keep.contains(addr);
            if !kept {
                debug!(node = %addr, "node left topology, releasing connection");
            }
            kept
        });
        self.opener.zones.retain(keep);
    }

    /// Tears down every connection. In-flight requests fail with `Closing`.
    pub fn close(&self) {
        self.opener.shutdown.cancel();
        self.slots.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.opener.shutdown.is_cancelled()
    }

    /// Nodes that currently hold a live connection.
    #[cfg(test)]
    pub fn connected_nodes(&self) -> Vec<NodeAddress> {
        let slots = self.slots.lock();
        let mut nodes: Vec<NodeAddress> = slots
            .iter()
            .filter(|(_, slot)| matches!(&*slot.lock(), SlotState::Ready(conn) if !conn.is_broken()))
            .map(|(addr, _)| addr.clone())
            .collect();
        nodes.sort();
        nodes
    }

    fn slot(&self, addr: &NodeAddress) -> Slot {
        self.slots
            .lock()
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SlotState::Idle)))
            .clone()
    }
}

impl Opener {
    /// Connects in a detached task and records the outcome in `slot`, if the
    /// slot is still registered by then.
    fn spawn_establish(&self, addr: NodeAddress, slot: Weak<Mutex<SlotState>>) -> Connecting {
        let opener = self.clone();
        let task_addr = addr.clone();
        let task = tokio::spawn(async move {
            let addr = task_addr;
            let result = match opener.establish(&addr).await {
                Ok(conn) if opener.shutdown.is_cancelled() => {
                    conn.shutdown();
                    Err(ClientError::Closing)
                }
                other => other,
            };
            if let Some(slot) = slot.upgrade() {
                *slot.lock() = match &result {
                    Ok(conn) => SlotState::Ready(conn.clone()),
                    Err(error) => SlotState::Failed {
                        error: error.clone(),
                        retry_at: Instant::now() + opener.config.retry_window(),
                    },
                };
            }
            result
        });

        async move {
            task.await.unwrap_or_else(|err| {
                Err(ClientError::connection(
                    &addr,
                    io::Error::new(io::ErrorKind::Other, format!("connect task failed: {}", err)),
                ))
            })
        }
        .boxed()
        .shared()
    }

    async fn establish(&self, addr: &NodeAddress) -> ClientResult<NodeConnection> {
        let backoff = self.config.reconnect;
        let mut attempt = 0;
        loop {
            match self.open(addr).await {
                Ok(conn) => return Ok(conn),
                Err(err) if err.is_connection_error() && attempt < backoff.num_of_retries => {
                    let delay = backoff.delay(attempt);
                    warn!(node = %addr, attempt, ?delay, error = %err, "connect failed, retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(ClientError::Closing),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn open(&self, addr: &NodeAddress) -> ClientResult<NodeConnection> {
        let timeout = self.config.connect_timeout;
        let stream = match tokio::time::timeout(timeout, self.connector.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ClientError::connection(addr, err)),
            Err(_) => {
                return Err(ClientError::connection(
                    addr,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }
        };

        let conn = NodeConnection::spawn(addr.clone(), stream, self.shutdown.child_token());
        match self.handshake(&conn, timeout).await {
            Ok(zone) => {
                if self.config.query_zone {
                    debug!(node = %addr, zone = ?zone, "availability zone");
                    self.zones.record(addr, zone);
                }
            }
            Err(err) => {
                conn.shutdown();
                return Err(err);
            }
        }
        debug!(node = %addr, "connected");
        Ok(conn)
    }

    /// Runs the handshake and returns the zone the node reported, if asked.
    async fn handshake(&self, conn: &NodeConnection, timeout: Duration) -> ClientResult<Option<String>> {
        let cmds = self.config.handshake();
        if cmds.is_empty() {
            return Ok(None);
        }

        let replies = match tokio::time::timeout(timeout, conn.send_batch(&cmds)).await {
            Ok(replies) => replies?,
            Err(_) => {
                return Err(ClientError::Timeout {
                    command: cmds[0].full_name(),
                    addr: conn.addr().to_string(),
                    timeout,
                })
            }
        };

        let mut replies = replies.into_iter();
        let zone_reply = if self.config.query_zone { replies.next_back() } else { None };
        for (cmd, reply) in cmds.iter().zip(replies) {
            if let Value::ServerError(err) = reply {
                return Err(RequestError::from_server(&err, cmd.full_name(), conn.addr()).into());
            }
        }
        // Servers without the setting answer with an error or an empty value.
        Ok(zone_reply.and_then(parse_zone))
    }
}

/// Zone from a `CONFIG GET availability-zone` reply (flat pairs or a map).
fn parse_zone(reply: Value) -> Option<String> {
    let value = match reply {
        Value::Map(pairs) => pairs.into_iter().next().map(|(_, value)| value),
        other => other.into_sequence().and_then(|items| items.into_iter().nth(1)),
    }?;
    let zone = String::from_utf8_lossy(value.as_bytes()?).into_owned();
    (!zone.is_empty()).then_some(zone)
}
