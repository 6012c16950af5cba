// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane RPC.
//!
//! A TCP stream of length-delimited frames, each one JSON [`RpcRequest`] or [`RpcResponse`].
//! The connection is the capability: the server binds a [`ClientId`](crate::ClientId) to the
//! session when it is accepted and every ownership call on it uses that identity.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RpcClient;
pub use protocol::{RpcError, RpcRequest, RpcResponse};
pub use server::RpcServer;
