//! # Dynagate - Main Entry Point
//!
//! Bootstraps the gateway: load configuration, build the registry and the
//! descriptor loader, wire the two ingress servers, self-register, and
//! shut everything down cleanly on SIGINT/SIGTERM.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dynagate::core::config::Config;
use dynagate::core::error::{GatewayError, GatewayResult};
use dynagate::load_balancing;
use dynagate::proto::{DescriptorLoader, HotReloadManager};
use dynagate::proxy::{ConnectionPool, GrpcProxy, HttpProxy, MessageBuilder, PrototypeCache};
use dynagate::registry::{self, Registry, ServiceInstance};
use dynagate::server;

#[tokio::main]
async fn main() -> GatewayResult<()> {
    init_tracing();

    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());
    let config = Config::from_file(&config_path).map_err(|err| {
        error!(path = %config_path, error = %err, "failed to load configuration");
        err
    })?;

    info!(http_port = %config.server.http_port, grpc_port = %config.server.grpc_port, "starting gateway");
    if config.registry.enabled {
        info!(kind = %config.registry.kind, address = %config.registry.address, "registry enabled");
    }

    // Runtime schema: seed from the primary protoset and any local
    // per-service protosets; URL sources arrive through hot reload.
    let loader = Arc::new(if config.proto.protoset_path.is_empty() {
        DescriptorLoader::empty()
    } else {
        DescriptorLoader::from_path(&config.proto.protoset_path)?
    });
    for protoset in &config.proto.protosets {
        if !protoset.path.is_empty() {
            loader.load_from_path(&protoset.path)?;
        }
    }

    // Backend fabric, shared by both ingress paths.
    let registry = registry::build(&config.registry)?;
    let pool = Arc::new(ConnectionPool::new());
    let balancer: Arc<dyn load_balancing::LoadBalancer> =
        Arc::from(load_balancing::for_strategy("round_robin"));
    let messages = Arc::new(PrototypeCache::new(Arc::clone(&loader)));

    let (http_proxy, grpc_proxy) = match &registry {
        Some(reg) => (
            Some(Arc::new(HttpProxy::new(
                Arc::clone(&loader),
                Arc::clone(reg),
                Arc::clone(&pool),
                Arc::clone(&balancer),
                messages.clone() as Arc<dyn MessageBuilder>,
            ))),
            Some(Arc::new(GrpcProxy::new(
                Arc::clone(reg),
                Arc::clone(&pool),
                Arc::clone(&balancer),
            ))),
        ),
        None => {
            warn!("registry disabled; requests will not be forwarded");
            (None, None)
        }
    };

    // Hot reload, with the prototype cache wired for invalidation.
    let hot_reload = if config.proto.hot_reload.enabled {
        let manager = Arc::new(HotReloadManager::new(
            Arc::clone(&loader),
            config.proto.hot_reload.clone(),
            config.proto.protosets.clone(),
        ));
        let cache = Arc::clone(&messages);
        manager.set_cache_clear_fn(move || cache.clear());
        manager.start()?;
        Some(manager)
    } else {
        None
    };

    // Ingress listeners.
    let shutdown = CancellationToken::new();

    let http_listener = TcpListener::bind(bind_addr(&config.server.http_port)).await?;
    let http_state = server::http::HttpState { proxy: http_proxy };
    let http_task = tokio::spawn(server::http::serve(
        http_listener,
        http_state,
        shutdown.clone(),
    ));

    let grpc_listener = TcpListener::bind(bind_addr(&config.server.grpc_port)).await?;
    let grpc_task = tokio::spawn(server::grpc::serve(
        grpc_listener,
        grpc_proxy,
        shutdown.clone(),
    ));

    // Advertise ourselves once both listeners are up.
    if let Some(reg) = &registry {
        register_gateway(reg.as_ref(), &config).await?;
        info!(
            service = %config.registry.service_name,
            id = %config.registry.service_id,
            "gateway registered"
        );
    }

    wait_for_shutdown_signal().await;
    info!("shutting down");

    if let Some(manager) = &hot_reload {
        manager.stop().await;
    }

    if let Some(reg) = &registry {
        if let Err(err) = reg.deregister(&config.registry.service_id).await {
            warn!(error = %err, "failed to deregister gateway");
        }
    }

    shutdown.cancel();
    if let Err(err) = http_task.await.map_err(|e| GatewayError::internal(e.to_string()))? {
        warn!(error = %err, "HTTP server exited with error");
    }
    if let Err(err) = grpc_task.await.map_err(|e| GatewayError::internal(e.to_string()))? {
        warn!(error = %err, "gRPC server exited with error");
    }

    pool.close();
    info!("gateway stopped");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dynagate=info".into()),
        )
        .init();
}

/// Turn a `":8080"`-style port into a bindable address.
fn bind_addr(port: &str) -> String {
    format!("0.0.0.0:{}", port.trim_start_matches(':'))
}

/// Register the gateway itself: gRPC port as the instance port, HTTP port
/// and protocol in metadata.
async fn register_gateway(registry: &dyn Registry, config: &Config) -> GatewayResult<()> {
    let grpc_port: u16 = config
        .server
        .grpc_port
        .trim_start_matches(':')
        .parse()
        .map_err(|err| GatewayError::config(format!("invalid grpc port: {err}")))?;
    let http_port = config.server.http_port.trim_start_matches(':').to_string();

    let mut metadata = HashMap::new();
    metadata.insert("http_port".to_string(), http_port);
    metadata.insert("protocol".to_string(), "grpc".to_string());

    registry
        .register(ServiceInstance {
            id: config.registry.service_id.clone(),
            name: config.registry.service_name.clone(),
            address: config.server.host.clone(),
            port: grpc_port,
            tags: config.registry.tags.clone(),
            metadata,
        })
        .await
}

async fn wait_for_shutdown_signal() {
    let interrupt = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
