// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node → IP route table.
//!
//! The on-disk form is a JSON object keyed by the stringified node id:
//!
//! ```json
//! { "0": "10.0.0.10", "8": "10.0.0.11" }
//! ```
//!
//! Readers take a snapshot; reconfiguration swaps the whole table.

use crate::topology::NodeId;

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RouteTableError {
    #[error("failed to read route table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("route table is not a JSON object of strings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid node id {0:?}")]
    InvalidNode(String),

    #[error("invalid address {addr:?} for node {node}")]
    InvalidAddress { node: NodeId, addr: String },
}

pub type Routes = HashMap<NodeId, IpAddr>;

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Arc<Routes>>,
}

impl RouteTable {
    pub fn new(routes: Routes) -> Self {
        Self {
            routes: RwLock::new(Arc::new(routes)),
        }
    }

    /// Read and parse a route table file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouteTableError> {
        Ok(Self::new(read_routes(path.as_ref())?))
    }

    pub fn from_json(json: &str) -> Result<Self, RouteTableError> {
        Ok(Self::new(parse_routes(json)?))
    }

    pub fn lookup(&self, node: NodeId) -> Option<IpAddr> {
        self.routes.read().get(&node).copied()
    }

    /// Current table; later replacements do not affect the returned snapshot
    pub fn snapshot(&self) -> Arc<Routes> {
        self.routes.read().clone()
    }

    /// Swap in a new table wholesale
    pub fn replace(&self, routes: Routes) {
        let count = routes.len();
        *self.routes.write() = Arc::new(routes);
        tracing::info!(routes = count, "route table replaced");
    }

    /// Re-read `path` and replace the table. On error the current table stays in place.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<(), RouteTableError> {
        let routes = read_routes(path.as_ref())?;
        self.replace(routes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_routes(path: &Path) -> Result<Routes, RouteTableError> {
    let json = std::fs::read_to_string(path).map_err(|source| RouteTableError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_routes(&json)
}

fn parse_routes(json: &str) -> Result<Routes, RouteTableError> {
    let raw: BTreeMap<String, String> = serde_json::from_str(json)?;
    raw.into_iter()
        .map(|(node, addr)| {
            let node = node
                .trim()
                .parse::<u32>()
                .map(NodeId)
                .map_err(|_| RouteTableError::InvalidNode(node.clone()))?;
            let ip = addr
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| RouteTableError::InvalidAddress { node, addr })?;
            Ok((node, ip))
        })
        .collect()
}
