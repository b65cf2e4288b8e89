//! # ClusterKV Client
//!
//! Purpose: Async client core for a Redis-compatible key-value store, in
//! standalone mode or against a cluster sharded over 16384 hash slots.
//!
//! ## Design Principles
//! 1. **Route Before I/O**: Slot hashing, key extraction and cross-slot
//!    checks happen before a connection is touched.
//! 2. **Atomic Topology**: Readers see one complete slot map; refreshes
//!    install a new one in a single swap.
//! 3. **Multiplexed Connections**: One connection per node, shared by every
//!    concurrent request to it.
//! 4. **Bounded Recovery**: One refresh-and-retry for MOVED, one primed retry
//!    for ASK, nothing more.
//!
//! ## Layers
//!
//! ```text
//! Client -> Dispatcher -> RouteResolver -> SlotMap (via TopologyManager)
//!                      -> NodeRegistry  -> NodeConnection -> ckv-common codec
//! ```

mod client;
pub mod command_table;
mod config;
mod connection;
mod dispatcher;
mod error;
pub mod logger;
mod pool;
mod redirect;
mod routing;
pub mod slot;
mod slot_map;
mod topology;
mod transaction;

pub use ckv_common::{Command, ProtocolVersion, ServerError, Value};
pub use client::Client;
pub use config::{BackoffStrategy, ClientConfig, NodeAddress, PeriodicChecks, ReadFrom, ReplicaSelection, DEFAULT_PORT};
pub use connection::{AsyncStream, BoxedStream, Connector, TcpConnector};
pub use dispatcher::Reply;
pub use pool::NodeZones;
pub use error::{ClientError, ClientResult, ConfigurationError, RequestError, RequestErrorKind};
pub use redirect::{parse_redirect, Redirect};
pub use routing::{NodeSelector, Route, RouteResolver, SlotRole, Targets};
pub use slot_map::{Node, NodeRole, Shard, SlotMap, SlotMapCell, SlotRange};
pub use transaction::Transaction;
