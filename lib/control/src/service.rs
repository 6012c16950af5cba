// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The GPU service behind the RPC surface.
//!
//! Every method is synchronous. `run_command` and `launch_kernel` may block on the data
//! plane or the device and must be called off the async executor.

use crate::gpu::{ClientId, GpuInfo, GpuStatus};
use crate::launch::{KernelLaunch, LaunchError, LaunchService};
use crate::ownership::{OwnershipScheduler, SchedulerError};

use aitherion_fabric::codec::{self, CodecError};
use aitherion_fabric::ingress::CommandHandler;
use aitherion_fabric::{RouteError, RouteOutcome};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("rejected command: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl ServiceError {
    /// Stable machine-readable code carried in RPC error responses
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Scheduler(SchedulerError::UnknownGpu(_)) => "unknown_gpu",
            ServiceError::Scheduler(SchedulerError::OwnershipConflict { .. }) => {
                "ownership_conflict"
            }
            ServiceError::Scheduler(SchedulerError::NotOwner { .. }) => "not_owner",
            ServiceError::Codec(_) => "bad_command",
            ServiceError::Route(RouteError::RouteNotFound(_)) => "route_not_found",
            ServiceError::Route(RouteError::Transfer { .. }) => "transfer_failed",
            ServiceError::Route(_) => "memory_fault",
            ServiceError::Launch(LaunchError::Cache(_)) => "cache_load",
            ServiceError::Launch(LaunchError::Invalid(_)) => "invalid_launch",
            ServiceError::Launch(LaunchError::Execution { .. }) => "launch_failed",
        }
    }
}

/// Result of a `RunCommand`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub stream_handle: u64,
    pub node: u32,
    /// Peer the command was forwarded to; absent when it was applied locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_to: Option<IpAddr>,
}

impl CommandResponse {
    fn new(stream_handle: u64, outcome: RouteOutcome) -> Self {
        match outcome {
            RouteOutcome::Local { node } => Self {
                stream_handle,
                node: node.0,
                forwarded_to: None,
            },
            RouteOutcome::Forwarded { node, addr } => Self {
                stream_handle,
                node: node.0,
                forwarded_to: Some(addr),
            },
        }
    }
}

#[derive(Clone)]
pub struct GpuService {
    scheduler: Arc<OwnershipScheduler>,
    commands: Arc<dyn CommandHandler>,
    launcher: Arc<dyn LaunchService>,
}

impl std::fmt::Debug for GpuService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuService")
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl GpuService {
    pub fn new(
        scheduler: Arc<OwnershipScheduler>,
        commands: Arc<dyn CommandHandler>,
        launcher: Arc<dyn LaunchService>,
    ) -> Self {
        Self {
            scheduler,
            commands,
            launcher,
        }
    }

    pub fn scheduler(&self) -> &Arc<OwnershipScheduler> {
        &self.scheduler
    }

    pub fn list_gpus(&self) -> Vec<GpuInfo> {
        self.scheduler.list()
    }

    pub fn get_gpu_status(&self, uuid: &str) -> Result<GpuStatus, ServiceError> {
        Ok(self.scheduler.status(uuid)?)
    }

    pub fn acquire_gpu(&self, client: &ClientId, uuid: &str) -> Result<(), ServiceError> {
        Ok(self.scheduler.acquire(uuid, client)?)
    }

    pub fn release_gpu(&self, client: &ClientId, uuid: &str) -> Result<(), ServiceError> {
        Ok(self.scheduler.release(uuid, client)?)
    }

    /// Verify a framed wire command and route it
    pub fn run_command(
        &self,
        frame: &[u8],
        stream_handle: u64,
    ) -> Result<CommandResponse, ServiceError> {
        let cmd = codec::decode_framed(frame)?;
        tracing::debug!(
            op = %cmd.operation(),
            dst = %cmd.destination(),
            bytes = cmd.data_size(),
            stream_handle,
            "rpc command"
        );
        let outcome = self.commands.handle(cmd)?;
        Ok(CommandResponse::new(stream_handle, outcome))
    }

    pub fn launch_kernel(&self, launch: &KernelLaunch) -> Result<(), ServiceError> {
        Ok(self.launcher.launch(launch)?)
    }
}
