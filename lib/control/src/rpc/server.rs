// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::protocol::{self, RpcError, RpcRequest, RpcResponse};
use crate::gpu::ClientId;
use crate::service::{GpuService, ServiceError};

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct RpcServer {
    listener: TcpListener,
    service: Arc<GpuService>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

/// Per-connection identity
struct Session {
    client: ClientId,
    named: bool,
    greeted: bool,
}

impl RpcServer {
    pub async fn bind(
        addr: &str,
        service: Arc<GpuService>,
        cancel: CancellationToken,
    ) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RpcError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the token is cancelled
    pub async fn run(self) -> Result<(), RpcError> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "RPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let service = self.service.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(
                                async move {
                                    if let Err(e) = handle_connection(stream, service, cancel).await {
                                        tracing::debug!(error = %e, "RPC connection ended with error");
                                    }
                                }
                                .instrument(tracing::info_span!("rpc", %peer)),
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to accept RPC connection");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("RPC server received cancellation signal, shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<GpuService>,
    cancel: CancellationToken,
) -> Result<(), RpcError> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, protocol::codec());
    let mut session = Session {
        client: ClientId::new_v4(),
        named: false,
        greeted: false,
    };
    tracing::debug!(client = %session.client, "RPC session opened");

    let result = loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = cancel.cancelled() => break Ok(()),
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(RpcError::Io(e)),
            None => break Ok(()),
        };

        let response = match protocol::decode::<RpcRequest>(&frame) {
            Ok(request) => dispatch(&service, &mut session, request).await,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode RPC request");
                RpcResponse::error("invalid_request", e)
            }
        };

        if let Err(e) = framed.send(protocol::encode(&response)?).await {
            break Err(RpcError::Io(e));
        }
    };

    // a named client can reconnect under the same id; an anonymous one never can
    if !session.named {
        service.scheduler().release_all(&session.client);
    }
    tracing::debug!(client = %session.client, "RPC session closed");
    result
}

async fn dispatch(
    service: &Arc<GpuService>,
    session: &mut Session,
    request: RpcRequest,
) -> RpcResponse {
    let method = request.method();
    let first = !session.greeted;
    session.greeted = true;

    let result: Result<RpcResponse, ServiceError> = match request {
        RpcRequest::Hello { client_name } => {
            if !first {
                return RpcResponse::error("invalid_request", "hello must be the first message");
            }
            if let Some(name) = client_name.filter(|n| !n.is_empty()) {
                session.client = ClientId::new(name);
                session.named = true;
            }
            tracing::info!(client = %session.client, "client connected");
            Ok(RpcResponse::Welcome {
                client_id: session.client.clone(),
            })
        }
        RpcRequest::ListGpus => Ok(RpcResponse::Gpus {
            gpus: service.list_gpus(),
        }),
        RpcRequest::GetGpuStatus { uuid } => service
            .get_gpu_status(&uuid)
            .map(|status| RpcResponse::Status { status }),
        RpcRequest::AcquireGpu { uuid } => service
            .acquire_gpu(&session.client, &uuid)
            .map(|_| RpcResponse::Ack),
        RpcRequest::ReleaseGpu { uuid } => service
            .release_gpu(&session.client, &uuid)
            .map(|_| RpcResponse::Ack),
        RpcRequest::RunCommand {
            command,
            stream_handle,
        } => {
            let service = service.clone();
            match tokio::task::spawn_blocking(move || {
                service.run_command(&command, stream_handle)
            })
            .await
            {
                Ok(result) => result.map(RpcResponse::CommandResult),
                Err(e) => return RpcResponse::error("internal", e),
            }
        }
        RpcRequest::LaunchKernel(launch) => {
            let service = service.clone();
            match tokio::task::spawn_blocking(move || service.launch_kernel(&launch)).await {
                Ok(result) => result.map(|_| RpcResponse::Ack),
                Err(e) => return RpcResponse::error("internal", e),
            }
        }
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(method, client = %session.client, code = e.code(), error = %e, "RPC call failed");
            RpcResponse::error(e.code(), e)
        }
    }
}
