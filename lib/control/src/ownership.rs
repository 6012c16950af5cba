// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exclusive GPU ownership.
//!
//! Every read and transition happens under one mutex, so the first successful acquire for a
//! GPU wins and all later acquires by other clients see the owner.

use crate::gpu::{ClientId, GpuInfo, GpuResource, GpuStatus, Ownership};

use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown GPU {0}")]
    UnknownGpu(String),

    #[error("GPU {uuid} is owned by {owner}")]
    OwnershipConflict { uuid: String, owner: ClientId },

    #[error("GPU {uuid} is not owned by {client}")]
    NotOwner { uuid: String, client: ClientId },
}

#[derive(Debug)]
pub struct OwnershipScheduler {
    gpus: Mutex<BTreeMap<String, GpuResource>>,
    enforce_release_owner: bool,
}

impl OwnershipScheduler {
    pub fn new(gpus: impl IntoIterator<Item = GpuResource>) -> Self {
        let gpus = gpus
            .into_iter()
            .map(|gpu| (gpu.uuid.clone(), gpu))
            .collect::<BTreeMap<_, _>>();
        tracing::info!(gpus = gpus.len(), "ownership scheduler ready");
        Self {
            gpus: Mutex::new(gpus),
            enforce_release_owner: false,
        }
    }

    /// Only the owning client may release when enabled
    pub fn with_enforced_release(mut self, enforce: bool) -> Self {
        self.enforce_release_owner = enforce;
        self
    }

    pub fn len(&self) -> usize {
        self.gpus.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free → Owned(client). Acquiring a GPU the client already owns succeeds.
    pub fn acquire(&self, uuid: &str, client: &ClientId) -> Result<(), SchedulerError> {
        let mut gpus = self.gpus.lock();
        let gpu = gpus
            .get_mut(uuid)
            .ok_or_else(|| SchedulerError::UnknownGpu(uuid.to_string()))?;

        match &gpu.ownership {
            Ownership::Free => {
                gpu.ownership = Ownership::Owned(client.clone());
                tracing::info!(%uuid, %client, "GPU acquired");
                Ok(())
            }
            Ownership::Owned(owner) if owner == client => Ok(()),
            Ownership::Owned(owner) => Err(SchedulerError::OwnershipConflict {
                uuid: uuid.to_string(),
                owner: owner.clone(),
            }),
        }
    }

    /// Owned → Free. Releasing a free GPU is a no-op.
    pub fn release(&self, uuid: &str, client: &ClientId) -> Result<(), SchedulerError> {
        let mut gpus = self.gpus.lock();
        let gpu = gpus
            .get_mut(uuid)
            .ok_or_else(|| SchedulerError::UnknownGpu(uuid.to_string()))?;

        let Ownership::Owned(owner) = &gpu.ownership else {
            return Ok(());
        };
        if self.enforce_release_owner && owner != client {
            return Err(SchedulerError::NotOwner {
                uuid: uuid.to_string(),
                client: client.clone(),
            });
        }
        if owner != client {
            tracing::warn!(%uuid, %owner, %client, "GPU released by a client that does not own it");
        }

        gpu.ownership = Ownership::Free;
        tracing::info!(%uuid, %client, "GPU released");
        Ok(())
    }

    /// Release everything `client` owns; used when its session ends
    pub fn release_all(&self, client: &ClientId) -> usize {
        let mut gpus = self.gpus.lock();
        let mut released = 0;
        for gpu in gpus.values_mut() {
            if gpu.ownership.owner() == Some(client) {
                gpu.ownership = Ownership::Free;
                released += 1;
            }
        }
        if released > 0 {
            tracing::info!(%client, released, "released GPUs of closed session");
        }
        released
    }

    pub fn list(&self) -> Vec<GpuInfo> {
        self.gpus.lock().values().map(GpuResource::info).collect()
    }

    pub fn status(&self, uuid: &str) -> Result<GpuStatus, SchedulerError> {
        self.gpus
            .lock()
            .get(uuid)
            .map(GpuResource::status)
            .ok_or_else(|| SchedulerError::UnknownGpu(uuid.to_string()))
    }

    pub fn owner(&self, uuid: &str) -> Option<ClientId> {
        self.gpus
            .lock()
            .get(uuid)
            .and_then(|gpu| gpu.ownership.owner().cloned())
    }
}
