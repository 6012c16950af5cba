// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Aitherion control plane.
//!
//! Tracks which client owns each GPU, caches device functions by handle and exposes both,
//! together with the data-plane router, through an RPC service.

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod gpu;
pub mod kernel_cache;
pub mod launch;
pub mod ownership;
pub mod rpc;
pub mod service;

pub use gpu::{ClientId, GpuInfo, GpuResource, GpuStatus, Ownership};
pub use kernel_cache::{CacheLoadError, KernelCache, ModuleLoader};
pub use launch::{KernelExecutor, KernelLaunch, KernelLauncher, LaunchError, LaunchService};
pub use ownership::{OwnershipScheduler, SchedulerError};
pub use service::{GpuService, ServiceError};
