// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use aitherion_control::gpu::{self, GpuResource};
use aitherion_control::rpc::RpcServer;
use aitherion_control::{GpuService, LaunchService, OwnershipScheduler};
use aitherion_fabric::ingress::{Dispatcher, DispatcherConfig};
use aitherion_fabric::memory::LocalAddressSpace;
use aitherion_fabric::routes::RouteTable;
use aitherion_fabric::routing::Router;
use aitherion_fabric::topology::{
    AddressMap, AddressResolver, FixedNode, NodeId, NumaTopology,
};
use aitherion_fabric::transport::datagram::DatagramTransport;
use aitherion_fabric::transport::interface::validate_interface;
use aitherion_fabric::transport::{
    ConnectionRegistry, DatagramFactory, Transport, TransportConfig,
};
use aitherion_fabric::AddressHandle;
use aitherion_runtime::{CancellationToken, FabricConfig, Runtime};

use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};

mod flags;
pub use flags::Flags;

/// Bring the node up, serve until the runtime is cancelled, then shut down in order:
/// stop accepting work, drain workers, release memory registrations, close transports.
pub async fn run(runtime: Runtime, config: FabricConfig) -> anyhow::Result<()> {
    //
    // Startup checks; any failure here is fatal
    //

    let data_iface = validate_interface(&config.data_iface)
        .with_context(|| format!("data-plane interface {:?}", config.data_iface))?;
    let control_iface = validate_interface(&config.control_iface)
        .with_context(|| format!("control-plane interface {:?}", config.control_iface))?;
    tracing::info!(
        data = %data_iface.name,
        control = %control_iface.name,
        "fabric interfaces ready"
    );

    let routes = Arc::new(
        RouteTable::load(&config.route_table_path).context("failed to load NUMA route table")?,
    );
    tracing::info!(routes = routes.len(), path = %config.route_table_path.display(), "route table loaded");

    let local = local_node(&config)?;

    let gpus = load_gpus(&config)?;

    //
    // Data plane
    //

    let memory = Arc::new(LocalAddressSpace::new());
    let pool = memory
        .map_region(config.memory_pool_base, config.memory_pool_bytes)
        .context("failed to map local memory pool")?;
    let address_map = Arc::new(address_map(&config, local)?);

    let listener = Arc::new(DatagramTransport::new(config.max_datagram_size));
    let mut listen = TransportConfig::from_settings(&config.data_iface, &config.transport);
    listen.port = config.data_port;
    listener
        .init(listen)
        .await
        .context("failed to open the fabric listener")?;
    let registration = listener
        .register_memory(pool.region())
        .context("failed to register the local memory pool")?;

    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(DatagramFactory {
            max_datagram_size: config.max_datagram_size,
        }),
        TransportConfig::from_settings(&config.data_iface, &config.transport),
        config.data_port,
        runtime.primary(),
    ));

    let router = Arc::new(
        Router::builder()
            .locator(Arc::new(FixedNode(local)))
            .resolver(address_map)
            .routes(routes.clone())
            .memory(memory)
            .forwarder(registry.clone())
            .build()
            .context("failed to build router")?,
    );

    let dispatcher = Arc::new(Dispatcher::start(
        DispatcherConfig::from(&config),
        router.clone(),
        runtime.graceful_shutdown_tracker(),
    )?);

    //
    // Control plane
    //

    let scheduler = Arc::new(
        OwnershipScheduler::new(gpus).with_enforced_release(config.enforce_release_owner),
    );
    let service = Arc::new(GpuService::new(scheduler, router, launcher(&config)?));

    //
    // Serve
    //

    let token = runtime.child_token();
    let ingress = {
        let dispatcher = dispatcher.clone();
        let listener: Arc<dyn Transport> = listener.clone();
        let token = token.clone();
        tokio::spawn(async move { dispatcher.run_transport(listener, token).await })
    };
    let server = RpcServer::bind(&config.rpc_address, service, token.clone())
        .await
        .with_context(|| format!("failed to bind RPC server on {}", config.rpc_address))?;
    let server = tokio::spawn(server.run());
    let reloader = tokio::spawn(reload_routes_on_hangup(
        routes,
        config.route_table_path.clone(),
        token.clone(),
    ));

    tracing::info!(node = %local, data_port = config.data_port, rpc = %config.rpc_address, "fabric node running");
    token.cancelled().await;

    //
    // Shutdown
    //

    ingress.await??;
    server.await??;
    reloader.await??;

    {
        let dispatcher = dispatcher.clone();
        tokio::task::spawn_blocking(move || dispatcher.shutdown()).await?;
    }
    runtime
        .wait_for_workers(config.graceful_shutdown_timeout())
        .await;

    if let Err(e) = listener.unregister_memory(registration) {
        tracing::warn!(error = %e, "failed to unregister local memory pool");
    }
    registry.close_all().await;
    listener.close().await?;

    tracing::info!("fabric node stopped");
    Ok(())
}

/// The NUMA node this process serves, resolved once. Without a configured `node_id` the
/// process must be pinned to a single node.
fn local_node(config: &FabricConfig) -> anyhow::Result<NodeId> {
    if let Some(id) = config.node_id {
        tracing::info!(node = id, "serving configured NUMA node");
        return Ok(NodeId(id));
    }
    let topology = match NumaTopology::from_sysfs() {
        Ok(topology) => topology,
        Err(e) => {
            tracing::warn!(error = %e, "NUMA topology unavailable, assuming node 0");
            return Ok(NodeId(0));
        }
    };
    let node = topology.pinned_node().context(
        "cannot tell which NUMA node to serve; pin the process to one node or set node_id",
    )?;
    tracing::info!(%node, nodes = topology.num_nodes(), "serving NUMA node from CPU affinity");
    Ok(node)
}

/// Re-read the route table on every SIGHUP until `token` is cancelled. A file that fails to
/// load leaves the current table in place.
async fn reload_routes_on_hangup(
    routes: Arc<RouteTable>,
    path: PathBuf,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(()) = hangup.recv() => match routes.reload(&path) {
                Ok(()) => tracing::info!(routes = routes.len(), path = %path.display(), "route table reloaded"),
                Err(e) => tracing::warn!(error = %e, "route table reload failed, keeping the current table"),
            }
        }
    }
    Ok(())
}

fn load_gpus(config: &FabricConfig) -> anyhow::Result<Vec<GpuResource>> {
    let Some(path) = &config.gpu_inventory_path else {
        tracing::warn!("no GPU inventory configured; serving zero GPUs");
        return Ok(Vec::new());
    };
    let gpus = gpu::load_inventory(path)
        .with_context(|| format!("failed to load GPU inventory {}", path.display()))?;
    tracing::info!(gpus = gpus.len(), "GPU inventory loaded");
    Ok(gpus)
}

/// Configured ranges, with the local pool added when no range covers it
fn address_map(config: &FabricConfig, local: NodeId) -> anyhow::Result<AddressMap> {
    let map = match &config.address_map_path {
        Some(path) => AddressMap::load(path)
            .with_context(|| format!("failed to load address map {}", path.display()))?,
        None => AddressMap::new(),
    };
    if map
        .resolve_address_node(AddressHandle::new(config.memory_pool_base))
        .is_none()
    {
        map.insert(
            config.memory_pool_base,
            config.memory_pool_bytes as u64,
            local,
        )
        .context("local memory pool overlaps a configured address range")?;
    }
    Ok(map)
}

#[cfg(not(feature = "cuda"))]
fn launcher(config: &FabricConfig) -> anyhow::Result<Arc<dyn LaunchService>> {
    use aitherion_control::kernel_cache::PtxDirectoryLoader;
    use aitherion_control::launch::DryRunExecutor;
    use aitherion_control::KernelLauncher;

    tracing::warn!("built without CUDA; kernel launches are validated and logged only");
    Ok(Arc::new(KernelLauncher::new(
        PtxDirectoryLoader::new(&config.kernel_module_dir),
        DryRunExecutor::default(),
        config.default_module.clone(),
    )))
}

#[cfg(feature = "cuda")]
fn launcher(config: &FabricConfig) -> anyhow::Result<Arc<dyn LaunchService>> {
    use aitherion_control::cuda::{CudaExecutor, CudaModuleLoader};
    use aitherion_control::KernelLauncher;

    let context = cudarc::driver::CudaContext::new(0).context("failed to open CUDA device 0")?;
    let executor = CudaExecutor::new(&context);
    Ok(Arc::new(KernelLauncher::new(
        CudaModuleLoader::new(context, &config.kernel_module_dir),
        executor,
        config.default_module.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_configured_node_id_wins() {
        let config = FabricConfig {
            node_id: Some(3),
            ..Default::default()
        };
        assert_eq!(local_node(&config).unwrap(), NodeId(3));
    }

    #[tokio::test]
    async fn test_sighup_reloads_route_table() {
        // keep the process alive if SIGHUP lands before the reload task is listening
        let _guard = signal(SignalKind::hangup()).unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{"0": "10.0.0.1"}"#).unwrap();
        let routes = Arc::new(RouteTable::load(file.path()).unwrap());

        let token = CancellationToken::new();
        let reloader = tokio::spawn(reload_routes_on_hangup(
            routes.clone(),
            file.path().to_path_buf(),
            token.clone(),
        ));

        // a broken file is ignored
        std::fs::write(file.path(), "not json").unwrap();
        unsafe { libc::raise(libc::SIGHUP) };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(routes.lookup(NodeId(0)), Some("10.0.0.1".parse().unwrap()));

        std::fs::write(file.path(), r#"{"0": "10.0.0.1", "1": "10.0.0.2"}"#).unwrap();
        for _ in 0..100 {
            if routes.len() == 2 {
                break;
            }
            unsafe { libc::raise(libc::SIGHUP) };
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(routes.lookup(NodeId(1)), Some("10.0.0.2".parse().unwrap()));

        token.cancel();
        reloader.await.unwrap().unwrap();
    }
}
