// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use aitherion_runtime::FabricConfig;
use clap::Parser;
use std::path::PathBuf;

/// Command line overrides. Anything left unset comes from the layered configuration.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
pub struct Flags {
    /// TOML configuration file
    #[arg(long, env = "AIT_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// NUMA node this process serves; detected from the CPU when unset
    #[arg(long)]
    pub node_id: Option<u32>,

    /// Interface carrying the RPC control plane
    #[arg(long)]
    pub control_iface: Option<String>,

    /// Interface carrying fabric datagrams
    #[arg(long)]
    pub data_iface: Option<String>,

    /// UDP port of the ingress receive loop
    #[arg(long)]
    pub data_port: Option<u16>,

    /// Node id → IP route table (JSON)
    #[arg(long)]
    pub route_table: Option<PathBuf>,

    /// GPU inventory: JSON, or saved nvidia-smi CSV when the file ends in .csv
    #[arg(long)]
    pub gpu_inventory: Option<PathBuf>,

    /// Address range ownership (JSON)
    #[arg(long)]
    pub address_map: Option<PathBuf>,

    /// Listen address of the RPC server
    #[arg(long)]
    pub rpc_address: Option<String>,
}

impl Flags {
    pub fn apply(&self, config: &mut FabricConfig) {
        if let Some(node_id) = self.node_id {
            config.node_id = Some(node_id);
        }
        if let Some(iface) = &self.control_iface {
            config.control_iface = iface.clone();
        }
        if let Some(iface) = &self.data_iface {
            config.data_iface = iface.clone();
        }
        if let Some(port) = self.data_port {
            config.data_port = port;
        }
        if let Some(path) = &self.route_table {
            config.route_table_path = path.clone();
        }
        if let Some(path) = &self.gpu_inventory {
            config.gpu_inventory_path = Some(path.clone());
        }
        if let Some(path) = &self.address_map {
            config.address_map_path = Some(path.clone());
        }
        if let Some(addr) = &self.rpc_address {
            config.rpc_address = addr.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let flags = Flags::parse_from([
            "aitherion-run",
            "--node-id",
            "1",
            "--data-iface",
            "ib0",
            "--route-table",
            "/etc/routes.json",
        ]);
        let mut config = FabricConfig::default();
        flags.apply(&mut config);

        assert_eq!(config.node_id, Some(1));
        assert_eq!(config.data_iface, "ib0");
        assert_eq!(config.route_table_path, PathBuf::from("/etc/routes.json"));
        // untouched keys keep their configured values
        assert_eq!(config.data_port, FabricConfig::default().data_port);
    }
}
