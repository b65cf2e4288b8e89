//! # Client API
//!
//! Purpose: Expose one async entry point for issuing commands to a
//! standalone node or a sharded cluster.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides routing, the node registry, topology
//!    refresh and the wire protocol.
//! 2. **Cheap to Share**: `Client` is a handle over an `Arc`; clones issue
//!    requests over the same connections.
//! 3. **Passthrough First**: `execute` and `custom_command` reach every
//!    command; the typed helpers are thin conveniences on top.
//! 4. **Fail Fast**: Bad configs and cross-slot requests are rejected before
//!    any I/O.

use std::sync::Arc;

use bytes::Bytes;
use ckv_common::{Command, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ClientConfig, PeriodicChecks};
use crate::connection::{Connector, TcpConnector};
use crate::dispatcher::{Dispatcher, Reply};
use crate::error::{ClientError, ClientResult, ConfigurationError};
use crate::pool::{NodeRegistry, RegistryConfig};
use crate::routing::{Route, RouteResolver};
use crate::slot_map::SlotMap;
use crate::topology::TopologyManager;
use crate::transaction::Transaction;

struct ClientInner {
    config: ClientConfig,
    registry: Arc<NodeRegistry>,
    topology: Option<Arc<TopologyManager>>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

/// Async client for a standalone node or a cluster.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects over TCP.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        Self::connect_with(config, Arc::new(TcpConnector)).await
    }

    /// Connects using a custom transport.
    ///
    /// Cluster mode fetches the topology before returning; standalone mode
    /// opens the node connection eagerly.
    pub async fn connect_with(config: ClientConfig, connector: Arc<dyn Connector>) -> ClientResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let registry = Arc::new(NodeRegistry::new(
            RegistryConfig::from_client_config(&config),
            connector,
            shutdown.clone(),
        ));

        let (dispatcher, topology) = if config.cluster_mode {
            let topology = Arc::new(TopologyManager::new(
                config.addresses.clone(),
                registry.clone(),
                config.request_timeout,
            ));
            if let Err(err) = topology.refresh().await {
                registry.close();
                return Err(err);
            }
            if let PeriodicChecks::Enabled { interval } = config.periodic_checks {
                topology.spawn_periodic_checks(interval, shutdown.clone());
            }
            let resolver = RouteResolver::new(config.read_from.clone(), config.replica_selection)
                .with_zones(registry.zones());
            let dispatcher = Dispatcher::cluster(
                registry.clone(),
                topology.clone(),
                resolver,
                config.request_timeout,
                shutdown.clone(),
            );
            (dispatcher, Some(topology))
        } else {
            let node = config.addresses[0].clone();
            if let Err(err) = registry.get_connection(&node).await {
                registry.close();
                return Err(err);
            }
            let dispatcher =
                Dispatcher::standalone(registry.clone(), node, config.request_timeout, shutdown.clone());
            (dispatcher, None)
        };

        info!(
            cluster = config.cluster_mode,
            seeds = config.addresses.len(),
            protocol = ?config.protocol,
            "client connected"
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                registry,
                topology,
                dispatcher,
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Executes a command. Without a route, the command's keys (or its
    /// keyless default) decide where it goes.
    pub async fn execute(&self, cmd: Command, route: Option<Route>) -> ClientResult<Reply> {
        self.inner.dispatcher.execute(&cmd, route.as_ref()).await
    }

    /// Executes a raw token list, name first.
    pub async fn custom_command<I, A>(&self, tokens: I, route: Option<Route>) -> ClientResult<Reply>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        let cmd = Command::from_tokens(tokens)
            .ok_or_else(|| ConfigurationError::Invalid("empty command".to_string()))?;
        self.execute(cmd, route).await
    }

    /// Empty transaction checked against this client's mode.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.inner.config.cluster_mode)
    }

    /// Runs `tx` atomically. `Ok(None)` when the server discarded it.
    pub async fn exec(&self, tx: &Transaction, route: Option<Route>) -> ClientResult<Option<Vec<Value>>> {
        if tx.is_cluster_mode() != self.inner.config.cluster_mode {
            return Err(ConfigurationError::Invalid(
                "transaction was built for a different client mode".to_string(),
            )
            .into());
        }
        self.inner.dispatcher.exec_transaction(tx, route.as_ref()).await
    }

    /// Forces a topology refresh and returns the installed map.
    pub async fn refresh_topology(&self) -> ClientResult<Arc<SlotMap>> {
        if self.is_closed() {
            return Err(ClientError::Closing);
        }
        match &self.inner.topology {
            Some(topology) => topology.refresh().await,
            None => Err(ConfigurationError::Invalid("topology refresh requires cluster mode".to_string()).into()),
        }
    }

    /// Current slot map, cluster mode only.
    pub fn slot_map(&self) -> Option<Arc<SlotMap>> {
        self.inner.topology.as_ref().and_then(|t| t.snapshot().ok())
    }

    /// Closes every connection. Pending and later calls fail with `Closing`.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.registry.close();
        info!("client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub async fn get(&self, key: impl Into<Bytes>) -> ClientResult<Option<Bytes>> {
        match self.single(Command::new("GET").arg(key)).await? {
            Value::BulkString(data) => Ok(Some(data)),
            Value::Nil => Ok(None),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> ClientResult<()> {
        match self.single(Command::new("SET").arg(key).arg(value)).await? {
            reply if reply.is_ok() => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes keys. Returns how many existed. In cluster mode the keys must
    /// share a slot.
    pub async fn del<I, K>(&self, keys: I) -> ClientResult<i64>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        match self.single(Command::with_args("DEL", keys)).await? {
            Value::Int(count) => Ok(count),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pings the server (every primary in cluster mode).
    pub async fn ping(&self) -> ClientResult<Bytes> {
        match self.single(Command::new("PING")).await? {
            Value::SimpleString(text) => Ok(Bytes::from(text)),
            Value::BulkString(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches INFO output, keyed by node address.
    pub async fn info(&self) -> ClientResult<Vec<(String, Bytes)>> {
        let reply = self.execute(Command::new("INFO"), None).await?;
        let values = match reply {
            Reply::Single(value) => vec![(self.inner.config.addresses[0].to_string(), value)],
            multi => multi.into_values()?.into_iter().collect(),
        };
        values
            .into_iter()
            .map(|(node, value)| match value {
                Value::BulkString(data) => Ok((node, data)),
                Value::VerbatimString { text, .. } => Ok((node, Bytes::from(text))),
                _ => Err(ClientError::UnexpectedResponse),
            })
            .collect()
    }

    async fn single(&self, cmd: Command) -> ClientResult<Value> {
        self.execute(cmd, None).await?.into_single()
    }
}
