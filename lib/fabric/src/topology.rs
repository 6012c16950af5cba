// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! NUMA topology and address ownership
//!
//! Answers the two questions the router asks for every command: which node this process
//! serves ([`NodeLocator`]), and which node owns a destination ([`AddressResolver`]).

use crate::codec::AddressHandle;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Default sysfs location of the NUMA node directories
pub const SYSFS_NODE_DIR: &str = "/sys/devices/system/node";

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("node directory {0} not found")]
    MissingNodeDir(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid cpulist entry: {0}")]
    InvalidCpuList(String),

    #[error("no NUMA nodes found")]
    NoNodes,

    #[error("failed to read CPU affinity: {0}")]
    Affinity(#[source] std::io::Error),

    #[error("none of CPUs {0:?} belong to a known NUMA node")]
    UnknownCpus(Vec<usize>),

    #[error("CPU affinity spans NUMA nodes {0:?}")]
    SpansNodes(Vec<NodeId>),

    #[error("address range [{base:#x}, +{len}) overlaps an existing mapping")]
    Overlap { base: u64, len: u64 },

    #[error("no mapping starts at {0:#x}")]
    NoSuchRange(u64),

    #[error("address map is not a JSON list of ranges: {0}")]
    Json(#[from] serde_json::Error),
}

/// A compute node: a NUMA domain with its own address, GPUs and fabric interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNode {
    pub id: NodeId,
    pub ip_address: Option<IpAddr>,
    #[serde(default)]
    pub gpus: BTreeSet<String>,
    #[serde(default)]
    pub rdma_interfaces: BTreeSet<String>,
}

impl NumaNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            ip_address: None,
            gpus: BTreeSet::new(),
            rdma_interfaces: BTreeSet::new(),
        }
    }
}

/// CPU to NUMA node mapping read from sysfs
#[derive(Debug, Clone, Default)]
pub struct NumaTopology {
    node_to_cpus: HashMap<u32, Vec<usize>>,
    cpu_to_node: HashMap<usize, u32>,
}

impl NumaTopology {
    /// Read NUMA topology from `/sys/devices/system/node`
    pub fn from_sysfs() -> Result<Self, TopologyError> {
        Self::from_node_dir(Path::new(SYSFS_NODE_DIR))
    }

    /// Read NUMA topology from a directory laid out like `/sys/devices/system/node`
    pub fn from_node_dir(node_dir: &Path) -> Result<Self, TopologyError> {
        if !node_dir.exists() {
            return Err(TopologyError::MissingNodeDir(node_dir.display().to_string()));
        }
        let entries = fs::read_dir(node_dir).map_err(|source| TopologyError::Io {
            path: node_dir.display().to_string(),
            source,
        })?;

        let mut topology = Self::default();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            // nodeN directories only; sysfs also has files like "online" and "possible"
            let Some(node_id) = name.strip_prefix("node").and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let cpulist_path = path.join("cpulist");
            if !cpulist_path.exists() {
                continue;
            }
            let cpulist = fs::read_to_string(&cpulist_path).map_err(|source| TopologyError::Io {
                path: cpulist_path.display().to_string(),
                source,
            })?;

            topology.insert(node_id, parse_cpulist(cpulist.trim())?);
        }

        if topology.node_to_cpus.is_empty() {
            return Err(TopologyError::NoNodes);
        }
        Ok(topology)
    }

    /// Build from an explicit node → cpus table
    pub fn from_nodes(nodes: impl IntoIterator<Item = (u32, Vec<usize>)>) -> Self {
        let mut topology = Self::default();
        for (node, cpus) in nodes {
            topology.insert(node, cpus);
        }
        topology
    }

    fn insert(&mut self, node_id: u32, cpus: Vec<usize>) {
        for cpu in &cpus {
            self.cpu_to_node.insert(*cpu, node_id);
        }
        self.node_to_cpus.insert(node_id, cpus);
    }

    pub fn cpus_for_node(&self, node_id: u32) -> Option<&[usize]> {
        self.node_to_cpus.get(&node_id).map(|v| v.as_slice())
    }

    pub fn node_for_cpu(&self, cpu_id: usize) -> Option<NodeId> {
        self.cpu_to_node.get(&cpu_id).copied().map(NodeId)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.node_to_cpus.keys().copied().map(NodeId).collect();
        ids.sort();
        ids
    }

    pub fn num_nodes(&self) -> usize {
        self.node_to_cpus.len()
    }

    pub fn is_single_node(&self) -> bool {
        self.num_nodes() == 1
    }

    /// The one node that every CPU in `cpus` belongs to. CPUs outside the topology are ignored.
    pub fn node_for_cpus(&self, cpus: &[usize]) -> Result<NodeId, TopologyError> {
        let nodes: BTreeSet<NodeId> = cpus
            .iter()
            .filter_map(|cpu| self.node_for_cpu(*cpu))
            .collect();
        match (nodes.first().copied(), nodes.len()) {
            (Some(node), 1) => Ok(node),
            (None, _) => Err(TopologyError::UnknownCpus(cpus.to_vec())),
            _ => Err(TopologyError::SpansNodes(nodes.into_iter().collect())),
        }
    }

    /// Node the calling process is pinned to, from its CPU affinity mask
    pub fn pinned_node(&self) -> Result<NodeId, TopologyError> {
        self.node_for_cpus(&affinity_cpus()?)
    }
}

/// CPUs in the calling thread's affinity mask. Threads inherit the mask of the process that
/// spawned them, so at startup this is the process mask.
pub fn affinity_cpus() -> Result<Vec<usize>, TopologyError> {
    // SAFETY: cpu_set_t is plain data and the kernel writes at most its size
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        let result = libc::sched_getaffinity(
            0, // current thread
            std::mem::size_of::<libc::cpu_set_t>(),
            &mut cpu_set,
        );
        if result != 0 {
            return Err(TopologyError::Affinity(std::io::Error::last_os_error()));
        }
        Ok((0..libc::CPU_SETSIZE as usize)
            .filter(|cpu| libc::CPU_ISSET(*cpu, &cpu_set))
            .collect())
    }
}

/// Parse Linux cpulist format
/// Examples:
///   "0-15"        -> [0,1,2,...,15]
///   "0,4,8"       -> [0,4,8]
///   "0-3,8-11"    -> [0,1,2,3,8,9,10,11]
pub fn parse_cpulist(cpulist: &str) -> Result<Vec<usize>, TopologyError> {
    let parse = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| TopologyError::InvalidCpuList(s.to_string()))
    };

    let mut cpus = Vec::new();
    for part in cpulist.split(',').filter(|p| !p.trim().is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(TopologyError::InvalidCpuList(part.to_string()));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(parse(part)?),
        }
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Which node the calling thread is executing on
pub trait NodeLocator: Send + Sync {
    fn current_node(&self) -> NodeId;
}

/// Node identity fixed at startup, from configuration or the process affinity mask
#[derive(Debug, Clone, Copy)]
pub struct FixedNode(pub NodeId);

impl NodeLocator for FixedNode {
    fn current_node(&self) -> NodeId {
        self.0
    }
}

/// Which node owns a destination
pub trait AddressResolver: Send + Sync {
    fn resolve_address_node(&self, addr: AddressHandle) -> Option<NodeId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub base: u64,
    pub len: u64,
    pub node: NodeId,
}

impl AddressRange {
    fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }
}

/// Explicit `[base, base + len) → node` table. Ranges can be moved between nodes at runtime.
#[derive(Debug, Default)]
pub struct AddressMap {
    ranges: RwLock<BTreeMap<u64, AddressRange>>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(
        ranges: impl IntoIterator<Item = AddressRange>,
    ) -> Result<Self, TopologyError> {
        let map = Self::new();
        for range in ranges {
            map.insert(range.base, range.len, range.node)?;
        }
        Ok(map)
    }

    /// Read `[{"base": .., "len": .., "node": ..}, ..]` from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| TopologyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let ranges: Vec<AddressRange> = serde_json::from_str(&json)?;
        Self::from_ranges(ranges)
    }

    pub fn insert(&self, base: u64, len: u64, node: NodeId) -> Result<(), TopologyError> {
        let candidate = AddressRange { base, len, node };
        let mut ranges = self.ranges.write();
        let overlaps = len == 0
            || ranges
                .values()
                .any(|r| candidate.base < r.end() && r.base < candidate.end());
        if overlaps {
            return Err(TopologyError::Overlap { base, len });
        }
        ranges.insert(base, candidate);
        Ok(())
    }

    /// Move the range starting at `base` to `node`. Returns the previous owner.
    pub fn migrate(&self, base: u64, node: NodeId) -> Result<NodeId, TopologyError> {
        let mut ranges = self.ranges.write();
        let range = ranges
            .get_mut(&base)
            .ok_or(TopologyError::NoSuchRange(base))?;
        let previous = std::mem::replace(&mut range.node, node);
        tracing::info!(
            base = format_args!("{base:#x}"),
            from = %previous,
            to = %node,
            "address range migrated"
        );
        Ok(previous)
    }

    pub fn remove(&self, base: u64) -> Option<AddressRange> {
        self.ranges.write().remove(&base)
    }

    pub fn ranges(&self) -> Vec<AddressRange> {
        self.ranges.read().values().copied().collect()
    }
}

impl AddressResolver for AddressMap {
    fn resolve_address_node(&self, addr: AddressHandle) -> Option<NodeId> {
        let ranges = self.ranges.read();
        ranges
            .range(..=addr.raw())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| addr.raw() < r.end())
            .map(|r| r.node)
    }
}
