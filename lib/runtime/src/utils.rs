// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub use tokio::time::{Duration, Instant};

pub mod graceful_shutdown;
pub mod pool;
pub mod retry;

pub use graceful_shutdown::GracefulShutdownTracker;
pub use pool::{Pool, PoolItem, Returnable};
pub use retry::{RetryError, RetryPolicy, retry_async, retry_blocking};
