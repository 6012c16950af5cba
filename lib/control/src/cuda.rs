// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CUDA backend for the kernel cache and launcher.
//!
//! Modules are PTX files loaded into one device context; each 8-byte word of the staged
//! parameter blob is passed as one 64-bit kernel argument.

use crate::kernel_cache::{CacheLoadError, ModuleLoader, PtxDirectoryLoader};
use crate::launch::{KernelExecutor, KernelLaunch, LaunchError};

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::Ptx;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub name: String,
    pub module: Arc<CudaModule>,
}

#[derive(Debug)]
pub struct CudaModuleLoader {
    context: Arc<CudaContext>,
    files: PtxDirectoryLoader,
}

impl CudaModuleLoader {
    pub fn new(context: Arc<CudaContext>, module_dir: impl Into<PathBuf>) -> Self {
        Self {
            context,
            files: PtxDirectoryLoader::new(module_dir),
        }
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }
}

impl ModuleLoader for CudaModuleLoader {
    type Module = LoadedModule;
    type Function = CudaFunction;

    fn load_module(&self, name: &str) -> Result<LoadedModule, CacheLoadError> {
        let path = self.files.module_path(name)?;
        if !path.exists() {
            return Err(CacheLoadError::ModuleNotFound {
                module: name.to_string(),
                path,
            });
        }
        let module = self
            .context
            .load_module(Ptx::from_file(path))
            .map_err(|e| CacheLoadError::ModuleLoad {
                module: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(LoadedModule {
            name: name.to_string(),
            module,
        })
    }

    fn resolve_function(
        &self,
        loaded: &LoadedModule,
        name: &str,
    ) -> Result<CudaFunction, CacheLoadError> {
        loaded
            .module
            .load_function(name)
            .map_err(|_| CacheLoadError::FunctionNotFound {
                module: loaded.name.clone(),
                function: name.to_string(),
            })
    }
}

#[derive(Debug)]
pub struct CudaExecutor {
    stream: Arc<CudaStream>,
}

impl CudaExecutor {
    pub fn new(context: &Arc<CudaContext>) -> Self {
        Self {
            stream: context.default_stream(),
        }
    }
}

impl KernelExecutor<CudaFunction> for CudaExecutor {
    fn execute(
        &self,
        function: &CudaFunction,
        launch: &KernelLaunch,
        params: &[u8],
    ) -> Result<(), LaunchError> {
        let failed = |e: cudarc::driver::DriverError| LaunchError::Execution {
            name: launch.name.clone(),
            reason: e.to_string(),
        };

        let words: Vec<u64> = params
            .chunks_exact(8)
            .map(|w| u64::from_le_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]))
            .collect();

        let [gx, gy, gz] = launch.grid_dims;
        let [bx, by, bz] = launch.block_dims;
        let cfg = LaunchConfig {
            grid_dim: (gx, gy, gz),
            block_dim: (bx, by, bz),
            shared_mem_bytes: launch.shared_mem_bytes,
        };

        let mut builder = self.stream.launch_builder(function);
        for word in &words {
            builder.arg(word);
        }
        unsafe {
            builder.launch(cfg).map_err(failed)?;
        }
        self.stream.synchronize().map_err(failed)
    }
}
