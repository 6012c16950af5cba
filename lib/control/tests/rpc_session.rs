// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! RPC sessions against a real router: ownership, command routing and kernel launches.

use aitherion_control::gpu::GpuResource;
use aitherion_control::kernel_cache::PtxDirectoryLoader;
use aitherion_control::launch::DryRunExecutor;
use aitherion_control::rpc::{RpcClient, RpcServer};
use aitherion_control::{GpuService, KernelLaunch, KernelLauncher, OwnershipScheduler};
use aitherion_fabric::codec::{AddressHandle, MemoryOpCommand, decode_framed, encode_framed};
use aitherion_fabric::memory::LocalAddressSpace;
use aitherion_fabric::routes::RouteTable;
use aitherion_fabric::routing::Router;
use aitherion_fabric::topology::{AddressMap, FixedNode, NodeId};
use aitherion_fabric::transport::loopback::LoopbackTransport;
use aitherion_fabric::transport::{ConnectionRegistry, Transport, TransportConfig};
use aitherion_runtime::CancellationToken;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const PTX: &str = ".visible .entry vec_add(\n.param .u64 p0\n)\n{\nret;\n}\n";

struct Harness {
    address: String,
    memory: Arc<LocalAddressSpace>,
    peer_inbox: Arc<LoopbackTransport>,
    scheduler: Arc<OwnershipScheduler>,
    registry: Arc<ConnectionRegistry>,
    token: CancellationToken,
    server: tokio::task::JoinHandle<Result<(), aitherion_control::rpc::RpcError>>,
    _modules: tempfile::TempDir,
}

async fn start() -> Harness {
    let memory = Arc::new(LocalAddressSpace::new());
    memory.map_region(0x1000, 0x1000).unwrap();

    let map = AddressMap::new();
    map.insert(0x1000, 0x1000, NodeId(1)).unwrap();
    map.insert(0x2000, 0x1000, NodeId(2)).unwrap();

    let peer_inbox = Arc::new(LoopbackTransport::new());
    peer_inbox
        .init(TransportConfig::new("lo", 5555))
        .await
        .unwrap();
    let factory = {
        let peer_inbox = peer_inbox.clone();
        move || -> Arc<dyn Transport> {
            let transport = LoopbackTransport::new();
            transport.set_peer(peer_inbox.inbox());
            Arc::new(transport)
        }
    };
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(factory),
        TransportConfig::new("lo", 0),
        5555,
        tokio::runtime::Handle::current(),
    ));

    let router = Router::builder()
        .locator(Arc::new(FixedNode(NodeId(1))))
        .resolver(Arc::new(map))
        .routes(Arc::new(RouteTable::new(HashMap::from([
            (NodeId(1), "10.0.0.1".parse().unwrap()),
            (NodeId(2), "10.0.0.2".parse().unwrap()),
        ]))))
        .memory(memory.clone())
        .forwarder(registry.clone())
        .build()
        .unwrap();

    let modules = tempfile::tempdir().unwrap();
    std::fs::write(modules.path().join("default.ptx"), PTX).unwrap();
    let launcher = KernelLauncher::new(
        PtxDirectoryLoader::new(modules.path()),
        DryRunExecutor::default(),
        "default",
    );

    let scheduler = Arc::new(OwnershipScheduler::new([
        GpuResource::new("GPU-0", "Tesla V100", 16 << 30, 16 << 30),
        GpuResource::new("GPU-1", "Tesla V100", 16 << 30, 8 << 30),
    ]));
    let service = Arc::new(GpuService::new(
        scheduler.clone(),
        Arc::new(router),
        Arc::new(launcher),
    ));

    let token = CancellationToken::new();
    let server = RpcServer::bind("127.0.0.1:0", service, token.clone())
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    let server = tokio::spawn(server.run());

    Harness {
        address,
        memory,
        peer_inbox,
        scheduler,
        registry,
        token,
        server,
        _modules: modules,
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ownership_over_rpc() {
    let h = start().await;

    let mut alice = RpcClient::connect(&h.address, Some("alice")).await.unwrap();
    let mut anon = RpcClient::connect(&h.address, None).await.unwrap();
    assert_eq!(alice.client_id().as_str(), "alice");
    assert_ne!(anon.client_id(), alice.client_id());

    let gpus = alice.list_gpus().await.unwrap();
    assert_eq!(gpus.len(), 2);

    alice.acquire_gpu("GPU-0").await.unwrap();
    alice.acquire_gpu("GPU-0").await.unwrap();

    let err = anon.acquire_gpu("GPU-0").await.unwrap_err();
    assert_eq!(err.code(), Some("ownership_conflict"));

    let status = anon.get_gpu_status("GPU-0").await.unwrap();
    assert!(!status.available);
    assert_eq!(status.owner, Some(alice.client_id().clone()));

    let err = anon.get_gpu_status("GPU-7").await.unwrap_err();
    assert_eq!(err.code(), Some("unknown_gpu"));

    // an anonymous session's GPUs are freed when it goes away
    anon.acquire_gpu("GPU-1").await.unwrap();
    drop(anon);
    wait_until(|| h.scheduler.owner("GPU-1").is_none()).await;
    assert_eq!(h.scheduler.owner("GPU-1"), None);

    // a named session keeps ownership across reconnects
    drop(alice);
    let mut alice = RpcClient::connect(&h.address, Some("alice")).await.unwrap();
    assert_eq!(
        h.scheduler.owner("GPU-0").map(|c| c.to_string()),
        Some("alice".to_string())
    );
    alice.release_gpu("GPU-0").await.unwrap();
    assert!(alice.get_gpu_status("GPU-0").await.unwrap().available);

    h.token.cancel();
    h.server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_command_routes_local_and_remote() {
    let h = start().await;
    let mut client = RpcClient::connect(&h.address, None).await.unwrap();

    let local = MemoryOpCommand::fill(0x1100u64, 0x5a, 16);
    let resp = client.run_command(&local, 1).await.unwrap();
    assert_eq!(resp.node, 1);
    assert_eq!(resp.forwarded_to, None);
    assert_eq!(
        h.memory.read(AddressHandle::new(0x1100), 16).unwrap(),
        vec![0x5a; 16]
    );

    let remote = MemoryOpCommand::copy(0x2040u64, b"to node two".to_vec());
    let resp = client.run_command(&remote, 2).await.unwrap();
    assert_eq!(resp.stream_handle, 2);
    assert_eq!(resp.node, 2);
    assert_eq!(resp.forwarded_to, Some("10.0.0.2".parse().unwrap()));
    let arrived = h.peer_inbox.receive().await.unwrap();
    assert_eq!(decode_framed(&arrived).unwrap(), remote);

    let mut corrupt = encode_framed(&local).unwrap().to_vec();
    corrupt[40] ^= 0x01;
    let err = client.run_raw_command(corrupt, 3).await.unwrap_err();
    assert_eq!(err.code(), Some("bad_command"));

    let err = client
        .run_command(&MemoryOpCommand::copy(0x9000u64, vec![1]), 4)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("memory_fault"));

    h.token.cancel();
    h.server.await.unwrap().unwrap();
    h.registry.close_all().await;
    h.peer_inbox.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_launch_kernel() {
    let h = start().await;
    let mut client = RpcClient::connect(&h.address, Some("launcher")).await.unwrap();

    client
        .launch_kernel(KernelLaunch::new("vec_add", 0x100, vec![0; 8]).with_grid([2, 1, 1]))
        .await
        .unwrap();

    let err = client
        .launch_kernel(KernelLaunch::new("vec_add", 0x101, vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("invalid_launch"));

    let err = client
        .launch_kernel(KernelLaunch::new("missing_kernel", 0x102, vec![1]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("cache_load"));

    h.token.cancel();
    h.server.await.unwrap().unwrap();
}
