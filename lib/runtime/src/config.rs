// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

pub mod environment_names;

use environment_names::fabric as env_fabric;

/// System-wide configuration file, merged when present
const DEFAULT_CONFIG_PATH: &str = "/opt/aitherion/etc/fabric.toml";

/// Default UDP port of the data-plane ingress
pub const DEFAULT_DATA_PORT: u16 = 5555;

/// Default control-plane RPC listen address
const DEFAULT_RPC_ADDRESS: &str = "0.0.0.0:7070";

/// Default location of the NUMA route table
const DEFAULT_ROUTE_TABLE_PATH: &str = "config/numa_routes.json";

/// Default ingress queue capacity (entries)
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of ingress worker threads
pub const DEFAULT_INGRESS_WORKERS: usize = 4;

/// Default largest datagram accepted by the ingress receive loop
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 4096;

/// Default size of the locally served memory pool (64 MiB)
const DEFAULT_MEMORY_POOL_BYTES: usize = 64 * 1024 * 1024;

/// Transport queue depths and port, passed to `Transport::init`
#[derive(Serialize, Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Local port for transport sockets; 0 picks an ephemeral port
    pub port: u16,

    /// Maximum outstanding send work requests
    #[validate(range(min = 1))]
    pub max_send_wr: u32,

    /// Maximum outstanding receive work requests
    #[validate(range(min = 1))]
    pub max_recv_wr: u32,

    /// Maximum inline payload size in bytes
    pub max_inline: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            port: 0,
            max_send_wr: 1024,
            max_recv_wr: 1024,
            max_inline: 64,
        }
    }
}

/// Fabric process configuration
///
/// Sources, lowest priority first:
/// 1. built-in defaults
/// 2. `/opt/aitherion/etc/fabric.toml` when it exists
/// 3. the TOML file named by `AIT_CONFIG_PATH` (or passed explicitly)
/// 4. `CONTROL_IFACE` / `DATA_IFACE`
/// 5. `AIT_*` environment variables (`__` separates nested keys)
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug))]
pub struct FabricConfig {
    /// NUMA node this process serves. Detected from the CPU the process runs on when unset.
    #[builder(default)]
    pub node_id: Option<u32>,

    /// Control-plane network interface (RPC)
    #[builder(default, setter(into))]
    pub control_iface: String,

    /// Data-plane network interface (datagram ingress and forwarding)
    #[builder(default, setter(into))]
    pub data_iface: String,

    /// UDP port of the data-plane ingress on every node
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_DATA_PORT")]
    pub data_port: u16,

    /// Listen address of the control-plane RPC server
    #[builder(default = "DEFAULT_RPC_ADDRESS.to_string()", setter(into))]
    pub rpc_address: String,

    /// JSON object mapping stringified NUMA node ids to IP addresses. Re-read on SIGHUP.
    #[builder(default = "PathBuf::from(DEFAULT_ROUTE_TABLE_PATH)", setter(into))]
    pub route_table_path: PathBuf,

    /// Optional GPU inventory: a JSON list, or saved `nvidia-smi` CSV when the file ends in `.csv`.
    #[builder(default, setter(into, strip_option))]
    pub gpu_inventory_path: Option<PathBuf>,

    /// Optional JSON list of `{base, len, node}` address ranges owned by each node. Without it
    /// only the local memory pool is mapped.
    #[builder(default, setter(into, strip_option))]
    pub address_map_path: Option<PathBuf>,

    /// Number of ingress worker threads
    #[validate(range(min = 1, max = 256))]
    #[builder(default = "DEFAULT_INGRESS_WORKERS")]
    pub ingress_workers: usize,

    /// Capacity of the ingress ring buffer
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Largest datagram the receive loop reads, header and checksum trailer included
    #[validate(range(min = 36))]
    #[builder(default = "DEFAULT_MAX_DATAGRAM_SIZE")]
    pub max_datagram_size: usize,

    /// Bytes of locally served memory backing Copy/Set on this node
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_MEMORY_POOL_BYTES")]
    pub memory_pool_bytes: usize,

    /// Handle of the first byte of the local memory pool
    #[builder(default)]
    pub memory_pool_base: u64,

    /// Transport queue depths and port
    #[validate(nested)]
    #[builder(default)]
    pub transport: TransportSettings,

    /// Reject `Release` calls from a client that does not own the GPU
    #[builder(default)]
    pub enforce_release_owner: bool,

    /// Directory holding kernel modules (`<name>.ptx`)
    #[builder(default = "PathBuf::from(\"kernels\")", setter(into))]
    pub kernel_module_dir: PathBuf,

    /// Module used when a launch request names no module
    #[builder(default = "\"default\".to_string()", setter(into))]
    pub default_module: String,

    /// Seconds to wait for in-flight work during shutdown
    #[builder(default = "default_graceful_shutdown_timeout()")]
    pub graceful_shutdown_timeout: u64,
}

fn default_graceful_shutdown_timeout() -> u64 {
    if cfg!(debug_assertions) {
        1 // Debug build: 1 second
    } else {
        30 // Release build: 30 seconds
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            node_id: None,
            control_iface: String::new(),
            data_iface: String::new(),
            data_port: DEFAULT_DATA_PORT,
            rpc_address: DEFAULT_RPC_ADDRESS.to_string(),
            route_table_path: PathBuf::from(DEFAULT_ROUTE_TABLE_PATH),
            gpu_inventory_path: None,
            address_map_path: None,
            ingress_workers: DEFAULT_INGRESS_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            memory_pool_bytes: DEFAULT_MEMORY_POOL_BYTES,
            memory_pool_base: 0,
            transport: TransportSettings::default(),
            enforce_release_owner: false,
            kernel_module_dir: PathBuf::from("kernels"),
            default_module: "default".to_string(),
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
        }
    }
}

impl FabricConfig {
    /// Layered configuration sources, see the type-level docs for the order.
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        let system_path = Path::new(DEFAULT_CONFIG_PATH);
        if system_path.exists() {
            figment = figment.merge(Toml::file(system_path));
        }

        let explicit = config_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(env_fabric::AIT_CONFIG_PATH).map(PathBuf::from));
        if let Some(path) = explicit {
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::raw().only(&[env_fabric::CONTROL_IFACE, env_fabric::DATA_IFACE]))
            .merge(Env::prefixed(env_fabric::AIT_PREFIX).split("__"))
    }

    /// Load and validate the configuration from every source.
    pub fn from_settings() -> Result<Self> {
        Self::from_settings_with(None)
    }

    /// Same as [`FabricConfig::from_settings`] with an explicit TOML file taking the place of
    /// `AIT_CONFIG_PATH`.
    pub fn from_settings_with(config_path: Option<&Path>) -> Result<Self> {
        let config: FabricConfig = Self::figment(config_path)
            .extract()
            .context("failed to load fabric configuration")?;
        config
            .validate()
            .context("invalid fabric configuration")?;
        Ok(config)
    }

    /// Seconds to wait for in-flight work during shutdown, as a [`std::time::Duration`]
    pub fn graceful_shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.graceful_shutdown_timeout)
    }
}

impl FabricConfigBuilder {
    /// Build and validate the [`FabricConfig`]
    pub fn build(&self) -> Result<FabricConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}

/// Check if a string is truthy.
///
/// Truthy values: "1", "true", "on", "yes" (case-insensitive)
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if an environment variable is truthy. Unset counts as `false`.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Check whether JSONL logging is requested
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(environment_names::logging::AIT_LOGGING_JSONL)
}

/// Check whether ANSI colors should be disabled
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(environment_names::logging::AIT_LOG_DISABLE_ANSI)
}
