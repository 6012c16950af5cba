// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Aitherion runtime
//!
//! Shared process plumbing for the data plane and the control plane: layered configuration,
//! structured logging, the process-wide cancellation/shutdown story, buffer pools and the
//! retry combinator.

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod config;
pub mod logging;
pub mod runtime;
pub mod utils;

pub use config::{FabricConfig, FabricConfigBuilder, TransportSettings};
pub use runtime::Runtime;
pub use tokio_util::sync::CancellationToken;
