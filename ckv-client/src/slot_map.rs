//! # Slot Map
//!
//! Purpose: Map each of the 16384 hash slots to the shard (primary plus
//! replicas) that serves it, and hand readers a consistent view while a
//! refresh installs a new one.
//!
//! ## Design Principles
//! 1. **Immutable Snapshots**: A `SlotMap` never changes after it is built;
//!    a refresh builds a new one.
//! 2. **Atomic Swap**: `SlotMapCell` holds an `Arc<SlotMap>`; readers clone
//!    the `Arc` under a short read lock, writers replace it. Nobody can
//!    observe a half-updated map.
//! 3. **O(1) Lookup**: One `u16` shard index per slot.
//!
//! ## Memory Layout Example
//!
//! ```text
//! slots:  [0, 0, 0, ..., 1, 1, ..., 2, 2]   (16384 entries, shard index)
//! shards: [Shard{7000, [7003]}, Shard{7001, []}, Shard{7002, [7005]}]
//! nodes:  {7000: Primary, 7001: Primary, 7002: Primary, 7003: Replica, 7005: Replica}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ckv_common::Value;
use parking_lot::RwLock;

use crate::config::NodeAddress;
use crate::error::{ClientResult, ConfigurationError};
use crate::slot::SLOT_COUNT;

const UNASSIGNED: u16 = u16::MAX;

/// Role a node plays for the slots it appears in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Primary,
    Replica,
}

/// A node known from the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub addr: NodeAddress,
    /// Cluster node id, when the topology reply carried one.
    pub id: Option<String>,
    pub role: NodeRole,
}

/// Nodes serving one group of slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub primary: NodeAddress,
    pub replicas: Vec<NodeAddress>,
}

/// Contiguous slot range as reported by `CLUSTER SLOTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// First slot (inclusive).
    pub start: u16,
    /// Last slot (inclusive).
    pub end: u16,
    pub primary: Node,
    pub replicas: Vec<Node>,
}

/// Immutable slot → shard mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMap {
    slots: Box<[u16]>,
    shards: Vec<Shard>,
    nodes: BTreeMap<NodeAddress, Node>,
}

impl SlotMap {
    /// Builds a map from slot ranges.
    ///
    /// Ranges served by the same primary share one shard. Overlapping or
    /// out-of-range slots are rejected.
    pub fn from_ranges(ranges: Vec<SlotRange>) -> ClientResult<Self> {
        let mut slots = vec![UNASSIGNED; SLOT_COUNT as usize].into_boxed_slice();
        let mut shards: Vec<Shard> = Vec::new();
        let mut shard_index: HashMap<NodeAddress, u16> = HashMap::new();
        let mut nodes = BTreeMap::new();

        for range in ranges {
            if range.start > range.end || range.end >= SLOT_COUNT {
                return Err(invalid_topology(format!(
                    "bad slot range {}-{}",
                    range.start, range.end
                )));
            }

            let idx = match shard_index.get(&range.primary.addr) {
                Some(&idx) => idx,
                None => {
                    let idx = shards.len() as u16;
                    shards.push(Shard {
                        primary: range.primary.addr.clone(),
                        replicas: range.replicas.iter().map(|r| r.addr.clone()).collect(),
                    });
                    shard_index.insert(range.primary.addr.clone(), idx);
                    idx
                }
            };

            for slot in range.start..=range.end {
                if slots[slot as usize] != UNASSIGNED {
                    return Err(invalid_topology(format!("slot {} assigned twice", slot)));
                }
                slots[slot as usize] = idx;
            }

            nodes.insert(range.primary.addr.clone(), range.primary);
            for replica in range.replicas {
                nodes.entry(replica.addr.clone()).or_insert(replica);
            }
        }

        Ok(SlotMap {
            slots,
            shards,
            nodes,
        })
    }

    /// Parses a `CLUSTER SLOTS` reply.
    ///
    /// `reporting` is the node that answered; its host stands in for nodes
    /// announced with an empty or unknown (`?`) endpoint.
    pub fn from_cluster_slots(reply: Value, reporting: &NodeAddress) -> ClientResult<Self> {
        let entries = reply
            .into_sequence()
            .ok_or_else(|| invalid_topology("CLUSTER SLOTS reply is not an array"))?;

        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut fields = entry
                .into_sequence()
                .ok_or_else(|| invalid_topology("slot entry is not an array"))?
                .into_iter();
            let start = slot_number(fields.next())?;
            let end = slot_number(fields.next())?;
            let primary = match fields.next() {
                Some(node) => parse_node(node, NodeRole::Primary, reporting)?,
                None => return Err(invalid_topology("slot entry without primary")),
            };
            let replicas = fields
                .map(|node| parse_node(node, NodeRole::Replica, reporting))
                .collect::<ClientResult<Vec<_>>>()?;
            ranges.push(SlotRange {
                start,
                end,
                primary,
                replicas,
            });
        }

        if ranges.is_empty() {
            return Err(invalid_topology("no slots are assigned"));
        }
        SlotMap::from_ranges(ranges)
    }

    /// Shard serving `slot`.
    pub fn shard_for_slot(&self, slot: u16) -> ClientResult<&Shard> {
        let idx = self
            .slots
            .get(slot as usize)
            .copied()
            .unwrap_or(UNASSIGNED);
        if idx == UNASSIGNED {
            return Err(ConfigurationError::SlotNotCovered(slot).into());
        }
        Ok(&self.shards[idx as usize])
    }

    /// Primary serving `slot`.
    pub fn primary_for_slot(&self, slot: u16) -> ClientResult<&NodeAddress> {
        self.shard_for_slot(slot).map(|shard| &shard.primary)
    }

    /// Every shard primary, in shard order.
    pub fn primaries(&self) -> Vec<NodeAddress> {
        self.shards.iter().map(|s| s.primary.clone()).collect()
    }

    /// Every known node, primaries and replicas.
    pub fn all_nodes(&self) -> Vec<NodeAddress> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, addr: &NodeAddress) -> Option<&Node> {
        self.nodes.get(addr)
    }

    /// Known nodes whose host equals `host`.
    pub fn nodes_with_host(&self, host: &str) -> Vec<&NodeAddress> {
        self.nodes.keys().filter(|addr| addr.host == host).collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// True when every slot has an owner.
    pub fn is_fully_covered(&self) -> bool {
        self.slots.iter().all(|&idx| idx != UNASSIGNED)
    }
}

fn slot_number(value: Option<Value>) -> ClientResult<u16> {
    match value.and_then(|v| v.as_int()) {
        Some(n) if (0..SLOT_COUNT as i64).contains(&n) => Ok(n as u16),
        _ => Err(invalid_topology("slot bound is not a valid slot number")),
    }
}

fn parse_node(value: Value, role: NodeRole, reporting: &NodeAddress) -> ClientResult<Node> {
    let mut fields = value
        .into_sequence()
        .ok_or_else(|| invalid_topology("node entry is not an array"))?
        .into_iter();

    let host = match fields.next() {
        Some(Value::Nil) | None => String::new(),
        Some(v) => v
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| invalid_topology("node host is not a string"))?,
    };
    let host = if host.is_empty() || host == "?" {
        reporting.host.clone()
    } else {
        host
    };

    let port = match fields.next().and_then(|v| v.as_int()) {
        Some(p) if (1..=u16::MAX as i64).contains(&p) => p as u16,
        _ => return Err(invalid_topology("node port is missing or invalid")),
    };
    let id = fields
        .next()
        .and_then(|v| v.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()));

    Ok(Node {
        addr: NodeAddress::new(host, port),
        id,
        role,
    })
}

fn invalid_topology(message: impl Into<String>) -> crate::error::ClientError {
    ConfigurationError::InvalidTopology(message.into()).into()
}

/// Holder for the current slot map.
///
/// Empty until the first successful topology fetch.
#[derive(Debug, Default)]
pub struct SlotMapCell {
    current: RwLock<Option<Arc<SlotMap>>>,
}

impl SlotMapCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent view of the current map.
    pub fn snapshot(&self) -> ClientResult<Arc<SlotMap>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| ConfigurationError::NotInitialized.into())
    }

    /// Replaces the whole map. Returns the installed map and whether it differs
    /// from the previous one.
    pub fn update(&self, map: SlotMap) -> (Arc<SlotMap>, bool) {
        let map = Arc::new(map);
        let mut current = self.current.write();
        let changed = current.as_deref() != Some(&*map);
        *current = Some(map.clone());
        (map, changed)
    }

    /// Primary owning `slot` in the current map.
    pub fn resolve(&self, slot: u16) -> ClientResult<NodeAddress> {
        self.snapshot()?.primary_for_slot(slot).cloned()
    }

    pub fn all_primaries(&self) -> ClientResult<Vec<NodeAddress>> {
        Ok(self.snapshot()?.primaries())
    }

    pub fn all_nodes(&self) -> ClientResult<Vec<NodeAddress>> {
        Ok(self.snapshot()?.all_nodes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::error::ClientError;

    fn node(port: u16, role: NodeRole) -> Node {
        Node {
            addr: NodeAddress::new("127.0.0.1", port),
            id: None,
            role,
        }
    }

    fn range(start: u16, end: u16, primary: u16, replicas: &[u16]) -> SlotRange {
        SlotRange {
            start,
            end,
            primary: node(primary, NodeRole::Primary),
            replicas: replicas.iter().map(|&p| node(p, NodeRole::Replica)).collect(),
        }
    }

    fn three_shards() -> SlotMap {
        SlotMap::from_ranges(vec![
            range(0, 5460, 7000, &[7003]),
            range(5461, 10922, 7001, &[7004]),
            range(10923, 16383, 7002, &[]),
        ])
        .expect("slot map")
    }

    #[test]
    fn resolves_each_slot_to_one_primary() {
        let map = three_shards();
        assert!(map.is_fully_covered());
        assert_eq!(map.primary_for_slot(0).unwrap().port, 7000);
        assert_eq!(map.primary_for_slot(5460).unwrap().port, 7000);
        assert_eq!(map.primary_for_slot(5461).unwrap().port, 7001);
        assert_eq!(map.primary_for_slot(16383).unwrap().port, 7002);
        assert_eq!(map.shard_for_slot(100).unwrap().replicas.len(), 1);
    }

    #[test]
    fn lists_primaries_and_nodes() {
        let map = three_shards();
        let primaries: Vec<u16> = map.primaries().iter().map(|a| a.port).collect();
        assert_eq!(primaries, vec![7000, 7001, 7002]);
        assert_eq!(map.all_nodes().len(), 5);
        assert_eq!(
            map.node(&NodeAddress::new("127.0.0.1", 7004)).map(|n| n.role),
            Some(NodeRole::Replica)
        );
    }

    #[test]
    fn non_contiguous_ranges_share_a_shard() {
        let map = SlotMap::from_ranges(vec![
            range(0, 99, 7000, &[]),
            range(100, 199, 7001, &[]),
            range(200, 16383, 7000, &[]),
        ])
        .unwrap();
        assert_eq!(map.shard_count(), 2);
        assert_eq!(map.primary_for_slot(250).unwrap().port, 7000);
    }

    #[test]
    fn rejects_overlap_and_reports_gaps() {
        let overlap = SlotMap::from_ranges(vec![range(0, 100, 7000, &[]), range(100, 200, 7001, &[])]);
        assert!(matches!(
            overlap,
            Err(ClientError::Configuration(ConfigurationError::InvalidTopology(_)))
        ));

        let partial = SlotMap::from_ranges(vec![range(0, 100, 7000, &[])]).unwrap();
        assert!(!partial.is_fully_covered());
        assert!(matches!(
            partial.shard_for_slot(101),
            Err(ClientError::Configuration(ConfigurationError::SlotNotCovered(101)))
        ));
    }

    #[test]
    fn parses_cluster_slots_reply() {
        let bulk = |s: &str| Value::BulkString(Bytes::from(s.to_string()));
        let reply = Value::Array(vec![
            Value::Array(vec![
                Value::Int(0),
                Value::Int(8191),
                Value::Array(vec![bulk("10.0.0.1"), Value::Int(7000), bulk("id-a")]),
                Value::Array(vec![bulk("10.0.0.2"), Value::Int(7001), bulk("id-b")]),
            ]),
            Value::Array(vec![
                Value::Int(8192),
                Value::Int(16383),
                Value::Array(vec![bulk(""), Value::Int(7002)]),
            ]),
        ]);
        let reporting = NodeAddress::new("10.0.0.9", 7002);
        let map = SlotMap::from_cluster_slots(reply, &reporting).expect("parse");

        assert_eq!(map.primary_for_slot(0).unwrap(), &NodeAddress::new("10.0.0.1", 7000));
        assert_eq!(map.primary_for_slot(9000).unwrap(), &NodeAddress::new("10.0.0.9", 7002));
        let primary = map.node(&NodeAddress::new("10.0.0.1", 7000)).unwrap();
        assert_eq!(primary.id.as_deref(), Some("id-a"));
        assert_eq!(map.shard_for_slot(0).unwrap().replicas, vec![NodeAddress::new("10.0.0.2", 7001)]);
    }

    #[test]
    fn rejects_malformed_cluster_slots() {
        let reporting = NodeAddress::new("127.0.0.1", 7000);
        assert!(SlotMap::from_cluster_slots(Value::Int(1), &reporting).is_err());
        assert!(SlotMap::from_cluster_slots(Value::Array(vec![]), &reporting).is_err());
        let bad_port = Value::Array(vec![Value::Array(vec![
            Value::Int(0),
            Value::Int(10),
            Value::Array(vec![Value::SimpleString("h".into()), Value::Int(0)]),
        ])]);
        assert!(SlotMap::from_cluster_slots(bad_port, &reporting).is_err());
    }

    #[test]
    fn cell_starts_uninitialized_and_swaps_whole_maps() {
        let cell = SlotMapCell::new();
        assert!(matches!(
            cell.resolve(0),
            Err(ClientError::Configuration(ConfigurationError::NotInitialized))
        ));

        let (_, changed) = cell.update(three_shards());
        assert!(changed);
        let before = cell.snapshot().unwrap();

        let (_, changed) = cell.update(three_shards());
        assert!(!changed);

        let (_, changed) = cell.update(SlotMap::from_ranges(vec![range(0, 16383, 7009, &[])]).unwrap());
        assert!(changed);

        // A snapshot taken earlier keeps seeing the old map in full.
        assert_eq!(before.primary_for_slot(16383).unwrap().port, 7002);
        assert_eq!(cell.resolve(16383).unwrap().port, 7009);
        assert_eq!(cell.all_primaries().unwrap().len(), 1);
    }
}
