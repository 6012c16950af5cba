// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernel launches.
//!
//! A [`KernelLauncher`] validates a [`KernelLaunch`], resolves its function through the
//! [`KernelCache`], stages the parameter blob into a pooled buffer padded to whole 64-bit
//! words and hands everything to a [`KernelExecutor`].

use crate::kernel_cache::{CacheLoadError, KernelCache, ModuleLoader};

use aitherion_runtime::utils::Pool;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Parameter staging buffers kept between launches
const STAGING_POOL_IDLE: usize = 16;
const STAGING_INITIAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelLaunch {
    pub name: String,
    pub grid_dims: [u32; 3],
    pub block_dims: [u32; 3],
    #[serde(default)]
    pub shared_mem_bytes: u32,
    #[serde(with = "crate::rpc::protocol::base64_bytes")]
    pub params: Vec<u8>,
    pub func_handle: u64,
    #[serde(default)]
    pub flags: u32,
    /// Module to load the function from; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl KernelLaunch {
    pub fn new(name: impl Into<String>, func_handle: u64, params: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            grid_dims: [1, 1, 1],
            block_dims: [1, 1, 1],
            shared_mem_bytes: 0,
            params,
            func_handle,
            flags: 0,
            module: None,
        }
    }

    pub fn with_grid(mut self, grid_dims: [u32; 3]) -> Self {
        self.grid_dims = grid_dims;
        self
    }

    pub fn with_block(mut self, block_dims: [u32; 3]) -> Self {
        self.block_dims = block_dims;
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.name.is_empty() {
            return Err(LaunchError::Invalid("kernel name is empty".into()));
        }
        if self.params.is_empty() {
            return Err(LaunchError::Invalid("kernel parameters are empty".into()));
        }
        if self.grid_dims.contains(&0) {
            return Err(LaunchError::Invalid(format!(
                "grid dimensions {:?} contain zero",
                self.grid_dims
            )));
        }
        if self.block_dims.contains(&0) {
            return Err(LaunchError::Invalid(format!(
                "block dimensions {:?} contain zero",
                self.block_dims
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid launch: {0}")]
    Invalid(String),

    #[error(transparent)]
    Cache(#[from] CacheLoadError),

    #[error("kernel {name} failed to launch: {reason}")]
    Execution { name: String, reason: String },
}

/// Runs a resolved function on a device
pub trait KernelExecutor<F>: Send + Sync {
    /// `params` is the parameter blob padded with zeros to a multiple of 8 bytes
    fn execute(&self, function: &F, launch: &KernelLaunch, params: &[u8])
    -> Result<(), LaunchError>;
}

/// Object-safe launch entry point used by the RPC service
pub trait LaunchService: Send + Sync {
    fn launch(&self, launch: &KernelLaunch) -> Result<(), LaunchError>;
}

pub struct KernelLauncher<L: ModuleLoader, E> {
    cache: KernelCache<L>,
    executor: E,
    default_module: String,
    staging: Pool<Vec<u8>>,
}

impl<L: ModuleLoader, E> Debug for KernelLauncher<L, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelLauncher")
            .field("cache", &self.cache)
            .field("default_module", &self.default_module)
            .finish()
    }
}

impl<L, E> KernelLauncher<L, E>
where
    L: ModuleLoader,
    E: KernelExecutor<L::Function>,
{
    pub fn new(loader: L, executor: E, default_module: impl Into<String>) -> Self {
        Self {
            cache: KernelCache::new(loader),
            executor,
            default_module: default_module.into(),
            staging: Pool::new(STAGING_POOL_IDLE, || {
                Vec::with_capacity(STAGING_INITIAL_CAPACITY)
            }),
        }
    }

    pub fn cache(&self) -> &KernelCache<L> {
        &self.cache
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn launch(&self, launch: &KernelLaunch) -> Result<(), LaunchError> {
        launch.validate()?;

        let module = launch.module.as_deref().unwrap_or(&self.default_module);
        let function = self
            .cache
            .get_or_load(launch.func_handle, module, &launch.name)?;

        let mut staged = self.staging.acquire();
        staged.extend_from_slice(&launch.params);
        staged.resize(launch.params.len().next_multiple_of(8), 0);

        tracing::debug!(
            name = %launch.name,
            handle = format_args!("{:#x}", launch.func_handle),
            grid = ?launch.grid_dims,
            block = ?launch.block_dims,
            shared_mem = launch.shared_mem_bytes,
            param_bytes = launch.params.len(),
            flags = format_args!("{:#x}", launch.flags),
            "launching kernel"
        );
        self.executor.execute(&function, launch, &staged)
    }
}

impl<L, E> LaunchService for KernelLauncher<L, E>
where
    L: ModuleLoader,
    E: KernelExecutor<L::Function>,
{
    fn launch(&self, launch: &KernelLaunch) -> Result<(), LaunchError> {
        KernelLauncher::launch(self, launch)
    }
}

/// Executor for hosts without a device: logs and counts launches
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    launches: AtomicU64,
}

impl DryRunExecutor {
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }
}

impl<F: Debug> KernelExecutor<F> for DryRunExecutor {
    fn execute(
        &self,
        function: &F,
        launch: &KernelLaunch,
        params: &[u8],
    ) -> Result<(), LaunchError> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::info!(?function, name = %launch.name, param_bytes = params.len(), "dry-run kernel launch");
        Ok(())
    }
}
