//! # Routing Resolver
//!
//! Purpose: Turn a command plus an optional explicit route into the node
//! (or nodes) that must receive it.
//!
//! ## Design Principles
//! 1. **Closed Route Set**: `Route` is a tagged enum matched exhaustively;
//!    there is no open-ended routing hook.
//! 2. **Fail Before I/O**: Cross-slot commands and unknown addresses are
//!    rejected here, before a connection is touched.
//! 3. **Snapshot In, Targets Out**: Resolution reads one `SlotMap` snapshot
//!    and never blocks.
//!
//! ## Priority
//!
//! ```text
//! explicit Address            -> that node (no slot logic)
//! explicit SlotKey / SlotId   -> slot owner, primary or replica per role
//! explicit AllNodes / AllPrimaries / Random
//! no route                    -> keys' common slot, or the command's keyless default
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ckv_common::Command;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::command_table::{self, CommandInfo, KeylessRoute};
use crate::config::{NodeAddress, ReadFrom, ReplicaSelection};
use crate::error::{ClientResult, ConfigurationError, RequestError};
use crate::pool::NodeZones;
use crate::slot::key_slot;
use crate::slot_map::{Shard, SlotMap};

/// Which member of a shard a slot route targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotRole {
    #[default]
    Primary,
    /// A replica of the slot; the primary when the shard has none.
    Replica,
}

/// Selects exactly one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSelector {
    /// Owner of the slot `key` hashes to.
    SlotKey { key: Bytes, role: SlotRole },
    /// Owner of `slot`.
    SlotId { slot: u16, role: SlotRole },
    /// A node by address. Without a port the host must be unique in the topology.
    Address { host: String, port: Option<u16> },
}

/// Caller-supplied routing directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    SingleNode(NodeSelector),
    AllNodes,
    AllPrimaries,
    /// One primary chosen at random.
    Random,
}

impl Route {
    /// Primary owning the slot of `key`.
    pub fn key(key: impl Into<Bytes>) -> Self {
        Route::SingleNode(NodeSelector::SlotKey {
            key: key.into(),
            role: SlotRole::Primary,
        })
    }

    pub fn slot(slot: u16, role: SlotRole) -> Self {
        Route::SingleNode(NodeSelector::SlotId { slot, role })
    }

    pub fn address(host: impl Into<String>, port: Option<u16>) -> Self {
        Route::SingleNode(NodeSelector::Address {
            host: host.into(),
            port,
        })
    }
}

/// Resolved destination of a request. The shape of the reply follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    Single(NodeAddress),
    Multi(Vec<NodeAddress>),
}

/// Slot shared by all keys of `cmd`, `None` for keyless commands.
///
/// Fails with CROSSSLOT when the keys span several slots.
pub fn command_slot(cmd: &Command, info: &CommandInfo) -> ClientResult<Option<u16>> {
    if let Some(slot) = command_table::slot_argument(cmd, info.keys) {
        return Ok(Some(slot));
    }

    let mut slot = None;
    for key in command_table::keys(cmd, info.keys) {
        let next = key_slot(key);
        match slot {
            None => slot = Some(next),
            Some(current) if current != next => {
                return Err(RequestError::cross_slot(command_table::lookup_name(cmd)).into());
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// Picks target nodes for commands.
#[derive(Debug)]
pub struct RouteResolver {
    read_from: ReadFrom,
    replica_selection: ReplicaSelection,
    next_replica: AtomicUsize,
    zones: Arc<NodeZones>,
}

impl RouteResolver {
    pub fn new(read_from: ReadFrom, replica_selection: ReplicaSelection) -> Self {
        RouteResolver {
            read_from,
            replica_selection,
            next_replica: AtomicUsize::new(0),
            zones: Arc::default(),
        }
    }

    /// Uses `zones` to keep replica reads in the client's availability zone.
    pub fn with_zones(mut self, zones: Arc<NodeZones>) -> Self {
        self.zones = zones;
        self
    }

    /// Resolves `cmd` against `map`, honoring `route` when given.
    pub fn resolve(&self, cmd: &Command, route: Option<&Route>, map: &SlotMap) -> ClientResult<Targets> {
        let targets = match route {
            Some(route) => self.resolve_explicit(route, map)?,
            None => self.resolve_implicit(cmd, map)?,
        };
        debug!(command = %cmd, ?targets, "resolved route");
        Ok(targets)
    }

    fn resolve_explicit(&self, route: &Route, map: &SlotMap) -> ClientResult<Targets> {
        match route {
            Route::SingleNode(NodeSelector::Address { host, port }) => {
                resolve_address(host, *port, map).map(Targets::Single)
            }
            Route::SingleNode(NodeSelector::SlotKey { key, role }) => {
                self.slot_target(key_slot(key), *role, map)
            }
            Route::SingleNode(NodeSelector::SlotId { slot, role }) => self.slot_target(*slot, *role, map),
            Route::AllNodes => Ok(Targets::Multi(map.all_nodes())),
            Route::AllPrimaries => Ok(Targets::Multi(map.primaries())),
            Route::Random => random_primary(map).map(Targets::Single),
        }
    }

    fn resolve_implicit(&self, cmd: &Command, map: &SlotMap) -> ClientResult<Targets> {
        let info = command_table::lookup(cmd);
        match command_slot(cmd, &info)? {
            Some(slot) => {
                let role = if info.readonly && self.read_from.reads_replicas() {
                    SlotRole::Replica
                } else {
                    SlotRole::Primary
                };
                self.slot_target(slot, role, map)
            }
            None => match info.keyless_route {
                KeylessRoute::Random => random_primary(map).map(Targets::Single),
                KeylessRoute::AllPrimaries => Ok(Targets::Multi(map.primaries())),
                KeylessRoute::AllNodes => Ok(Targets::Multi(map.all_nodes())),
            },
        }
    }

    fn slot_target(&self, slot: u16, role: SlotRole, map: &SlotMap) -> ClientResult<Targets> {
        let shard = map.shard_for_slot(slot)?;
        let addr = match role {
            SlotRole::Primary => shard.primary.clone(),
            SlotRole::Replica => self.pick_replica(shard).clone(),
        };
        Ok(Targets::Single(addr))
    }

    fn pick_replica<'a>(&self, shard: &'a Shard) -> &'a NodeAddress {
        if shard.replicas.is_empty() {
            return &shard.primary;
        }
        let mut candidates: Vec<&NodeAddress> = match self.read_from.client_az() {
            Some(az) => shard.replicas.iter().filter(|r| self.zones.is_in(r, az)).collect(),
            None => Vec::new(),
        };
        // No replica in our zone (or no zone preference): any replica will do.
        if candidates.is_empty() {
            candidates = shard.replicas.iter().collect();
        }
        let idx = match self.replica_selection {
            ReplicaSelection::RoundRobin => {
                self.next_replica.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            ReplicaSelection::Random => rand::thread_rng().gen_range(0..candidates.len()),
        };
        candidates[idx]
    }
}

fn resolve_address(host: &str, port: Option<u16>, map: &SlotMap) -> ClientResult<NodeAddress> {
    if let Some(port) = port {
        return Ok(NodeAddress::new(host, port));
    }
    match map.nodes_with_host(host).as_slice() {
        [only] => Ok((*only).clone()),
        _ => Err(ConfigurationError::AddressNotFound(host.to_string()).into()),
    }
}

fn random_primary(map: &SlotMap) -> ClientResult<NodeAddress> {
    map.primaries()
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| ConfigurationError::NotInitialized.into())
}
