// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Aitherion data plane.
//!
//! Datagrams arrive on the [`ingress`] receive loop, are queued in a bounded [`ring`], decoded
//! by [`codec`] on a fixed pool of worker threads and handed to the [`routing`] engine. The
//! router either touches node-local memory through [`memory`] or forwards the command to the
//! owning node over a [`transport`].

pub mod codec;
pub mod ingress;
pub mod memory;
pub mod ring;
pub mod routes;
pub mod routing;
pub mod topology;
pub mod transport;

pub use codec::{AddressHandle, CodecError, MemoryOpCommand, Operation};
pub use routing::{RouteError, RouteOutcome, Router};
pub use topology::NodeId;
