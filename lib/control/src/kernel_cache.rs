// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Two-level device function cache.
//!
//! `handle → (module, function)` and `module name → module`. Lookups take the read lock; a
//! miss takes the write lock, checks again, loads the module if it is not resident, resolves
//! the symbol and inserts both entries. Nothing is cached when a load fails and nothing is
//! ever evicted.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheLoadError {
    #[error("module {module} not found at {path}")]
    ModuleNotFound { module: String, path: PathBuf },

    #[error("failed to load module {module}: {reason}")]
    ModuleLoad { module: String, reason: String },

    #[error("function {function} not found in module {module}")]
    FunctionNotFound { module: String, function: String },

    #[error("invalid module name {0:?}")]
    InvalidModuleName(String),
}

/// Loads device modules and resolves functions inside them
pub trait ModuleLoader: Send + Sync {
    type Module: Clone + Send + Sync;
    type Function: Clone + Send + Sync;

    fn load_module(&self, name: &str) -> Result<Self::Module, CacheLoadError>;

    fn resolve_function(
        &self,
        module: &Self::Module,
        name: &str,
    ) -> Result<Self::Function, CacheLoadError>;
}

#[derive(Debug, Clone)]
struct FunctionEntry<F> {
    module: String,
    function: F,
}

struct CacheState<M, F> {
    functions: HashMap<u64, FunctionEntry<F>>,
    modules: HashMap<String, M>,
}

pub struct KernelCache<L: ModuleLoader> {
    loader: L,
    state: RwLock<CacheState<L::Module, L::Function>>,
}

impl<L: ModuleLoader> std::fmt::Debug for KernelCache<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("KernelCache")
            .field("functions", &state.functions.len())
            .field("modules", &state.modules.len())
            .finish()
    }
}

impl<L: ModuleLoader> KernelCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            state: RwLock::new(CacheState {
                functions: HashMap::new(),
                modules: HashMap::new(),
            }),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Cached function for `handle`, or load `function` from `module` and cache it under
    /// `handle`. The handle is the cache key: a hit ignores `module` and `function`.
    pub fn get_or_load(
        &self,
        handle: u64,
        module: &str,
        function: &str,
    ) -> Result<L::Function, CacheLoadError> {
        if let Some(entry) = self.state.read().functions.get(&handle) {
            return Ok(entry.function.clone());
        }

        let mut state = self.state.write();
        if let Some(entry) = state.functions.get(&handle) {
            return Ok(entry.function.clone());
        }

        let loaded = match state.modules.get(module) {
            Some(loaded) => loaded.clone(),
            None => {
                let loaded = self.loader.load_module(module)?;
                state.modules.insert(module.to_string(), loaded.clone());
                tracing::info!(%module, "loaded device module");
                loaded
            }
        };

        let resolved = self.loader.resolve_function(&loaded, function)?;
        state.functions.insert(
            handle,
            FunctionEntry {
                module: module.to_string(),
                function: resolved.clone(),
            },
        );
        tracing::debug!(%module, %function, handle = format_args!("{handle:#x}"), "cached device function");
        Ok(resolved)
    }

    pub fn get(&self, handle: u64) -> Option<L::Function> {
        self.state
            .read()
            .functions
            .get(&handle)
            .map(|e| e.function.clone())
    }

    /// Module the cached function for `handle` came from
    pub fn module_of(&self, handle: u64) -> Option<String> {
        self.state
            .read()
            .functions
            .get(&handle)
            .map(|e| e.module.clone())
    }

    pub fn function_count(&self) -> usize {
        self.state.read().functions.len()
    }

    pub fn module_count(&self) -> usize {
        self.state.read().modules.len()
    }
}

/// A PTX module read from disk
#[derive(Debug, Clone)]
pub struct PtxModule {
    pub name: String,
    pub path: PathBuf,
    pub source: Arc<str>,
    entries: Arc<[String]>,
}

impl PtxModule {
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtxFunction {
    pub module: String,
    pub name: String,
}

/// Resolves modules as `<dir>/<name>.ptx` and functions against the `.entry` symbols the
/// PTX declares.
#[derive(Debug, Clone)]
pub struct PtxDirectoryLoader {
    dir: PathBuf,
}

impl PtxDirectoryLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn module_path(&self, name: &str) -> Result<PathBuf, CacheLoadError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(CacheLoadError::InvalidModuleName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.ptx")))
    }
}

impl ModuleLoader for PtxDirectoryLoader {
    type Module = PtxModule;
    type Function = PtxFunction;

    fn load_module(&self, name: &str) -> Result<PtxModule, CacheLoadError> {
        let path = self.module_path(name)?;
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheLoadError::ModuleNotFound {
                    module: name.to_string(),
                    path,
                });
            }
            Err(e) => {
                return Err(CacheLoadError::ModuleLoad {
                    module: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let entries = ptx_entries(&source);
        Ok(PtxModule {
            name: name.to_string(),
            path,
            source: source.into(),
            entries: entries.into(),
        })
    }

    fn resolve_function(
        &self,
        module: &PtxModule,
        name: &str,
    ) -> Result<PtxFunction, CacheLoadError> {
        if module.entries.iter().any(|entry| entry == name) {
            Ok(PtxFunction {
                module: module.name.clone(),
                name: name.to_string(),
            })
        } else {
            Err(CacheLoadError::FunctionNotFound {
                module: module.name.clone(),
                function: name.to_string(),
            })
        }
    }
}

/// Names declared with `.entry` in a PTX listing
pub fn ptx_entries(ptx: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut rest = ptx;
    while let Some(pos) = rest.find(".entry") {
        rest = &rest[pos + ".entry".len()..];
        // `.entry` must be a whole directive, not a prefix of another token
        if !rest.starts_with(|c: char| c.is_whitespace()) {
            continue;
        }
        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'))
            .collect();
        if !name.is_empty() {
            entries.push(name);
        }
    }
    entries
}
