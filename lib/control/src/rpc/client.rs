// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::protocol::{self, RpcError, RpcRequest, RpcResponse};
use crate::gpu::{ClientId, GpuInfo, GpuStatus};
use crate::launch::KernelLaunch;
use crate::service::CommandResponse;

use aitherion_fabric::codec::{self, MemoryOpCommand};
use aitherion_runtime::utils::retry::{Backoff, RetryPolicy, retry_async};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Connect attempts while the server is not yet reachable
const CONNECT_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 25,
    backoff: Backoff::Fixed(Duration::from_millis(200)),
};

#[derive(Debug)]
pub struct RpcClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    client_id: ClientId,
}

impl RpcClient {
    /// Connect and open a session. With `name` the session keeps that identity; without it
    /// the server assigns one.
    pub async fn connect(address: &str, name: Option<&str>) -> Result<Self, RpcError> {
        let stream = connect(address).await?;
        let mut client = Self {
            framed: Framed::new(stream, protocol::codec()),
            client_id: ClientId::new(""),
        };

        let hello = RpcRequest::Hello {
            client_name: name.map(str::to_string),
        };
        match client.call(hello).await? {
            RpcResponse::Welcome { client_id } => client.client_id = client_id,
            other => return Err(unexpected("hello", other)),
        }
        tracing::debug!(%address, client = %client.client_id, "RPC session opened");
        Ok(client)
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Send one request and wait for its response. Server-side errors come back as
    /// [`RpcError::Remote`].
    pub async fn call(&mut self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        self.framed.send(protocol::encode(&request)?).await?;
        let frame = self
            .framed
            .next()
            .await
            .ok_or(RpcError::ConnectionClosed)??;
        match protocol::decode::<RpcResponse>(&frame)? {
            RpcResponse::Error { code, message } => Err(RpcError::Remote { code, message }),
            response => Ok(response),
        }
    }

    pub async fn list_gpus(&mut self) -> Result<Vec<GpuInfo>, RpcError> {
        match self.call(RpcRequest::ListGpus).await? {
            RpcResponse::Gpus { gpus } => Ok(gpus),
            other => Err(unexpected("list_gpus", other)),
        }
    }

    pub async fn get_gpu_status(&mut self, uuid: &str) -> Result<GpuStatus, RpcError> {
        let request = RpcRequest::GetGpuStatus { uuid: uuid.into() };
        match self.call(request).await? {
            RpcResponse::Status { status } => Ok(status),
            other => Err(unexpected("get_gpu_status", other)),
        }
    }

    pub async fn acquire_gpu(&mut self, uuid: &str) -> Result<(), RpcError> {
        let request = RpcRequest::AcquireGpu { uuid: uuid.into() };
        self.expect_ack("acquire_gpu", request).await
    }

    pub async fn release_gpu(&mut self, uuid: &str) -> Result<(), RpcError> {
        let request = RpcRequest::ReleaseGpu { uuid: uuid.into() };
        self.expect_ack("release_gpu", request).await
    }

    /// Frame `cmd` with its checksum trailer and have the server route it
    pub async fn run_command(
        &mut self,
        cmd: &MemoryOpCommand,
        stream_handle: u64,
    ) -> Result<CommandResponse, RpcError> {
        let frame = codec::encode_framed(cmd).map_err(|e| RpcError::Remote {
            code: "bad_command".into(),
            message: e.to_string(),
        })?;
        self.run_raw_command(frame.to_vec(), stream_handle).await
    }

    /// Send an already framed command as-is
    pub async fn run_raw_command(
        &mut self,
        command: Vec<u8>,
        stream_handle: u64,
    ) -> Result<CommandResponse, RpcError> {
        let request = RpcRequest::RunCommand {
            command,
            stream_handle,
        };
        match self.call(request).await? {
            RpcResponse::CommandResult(response) => Ok(response),
            other => Err(unexpected("run_command", other)),
        }
    }

    pub async fn launch_kernel(&mut self, launch: KernelLaunch) -> Result<(), RpcError> {
        self.expect_ack("launch_kernel", RpcRequest::LaunchKernel(launch))
            .await
    }

    async fn expect_ack(
        &mut self,
        method: &'static str,
        request: RpcRequest,
    ) -> Result<(), RpcError> {
        match self.call(request).await? {
            RpcResponse::Ack => Ok(()),
            other => Err(unexpected(method, other)),
        }
    }
}

async fn connect(address: &str) -> Result<TcpStream, RpcError> {
    let retryable = |e: &std::io::Error| {
        matches!(
            e.kind(),
            std::io::ErrorKind::AddrNotAvailable | std::io::ErrorKind::ConnectionRefused
        )
    };
    let stream = retry_async(&CONNECT_POLICY, retryable, |attempt| async move {
        if attempt > 1 {
            tracing::debug!(%address, attempt, "retrying RPC connect");
        }
        TcpStream::connect(address).await
    })
    .await
    .map_err(|e| RpcError::Io(e.into_inner()))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn unexpected(method: &'static str, response: RpcResponse) -> RpcError {
    RpcError::UnexpectedResponse {
        method,
        response: format!("{response:?}"),
    }
}
