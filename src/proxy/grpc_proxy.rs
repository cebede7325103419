//! # gRPC Stream Forwarder
//!
//! Transparent relay for methods the ingress server has never heard of.
//! Frames are never deserialized: the [`RawCodec`] hands the payload of
//! each length-prefixed message through as opaque bytes, so unary,
//! client-streaming, server-streaming and bidi calls are all covered by a
//! single client stream opened with both streaming flags set.
//!
//! Two legs run independently. The ingress-to-egress leg is a spawned task
//! pumping inbound frames into the outbound channel; a graceful half-close
//! from the client drops the sender, which half-closes the backend stream.
//! The egress-to-ingress leg is the returned response stream, which yields
//! backend frames in arrival order and surfaces the backend's terminal
//! status verbatim. Cancellation of the incoming call drops both legs and
//! with them the outbound RPC.

use bytes::Bytes;
use futures::stream::BoxStream;
use http::uri::PathAndQuery;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::{Request, Status, Streaming};
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::LoadBalancer;
use crate::proxy::codec::RawCodec;
use crate::proxy::pool::ConnectionPool;
use crate::registry::Registry;

/// Outbound frames buffered between the two pump legs.
const FORWARD_BUFFER: usize = 16;

/// Transparent stream proxy for the gRPC ingress.
pub struct GrpcProxy {
    registry: Arc<dyn Registry>,
    pool: Arc<ConnectionPool>,
    balancer: Arc<dyn LoadBalancer>,
}

impl GrpcProxy {
    pub fn new(
        registry: Arc<dyn Registry>,
        pool: Arc<ConnectionPool>,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        Self {
            registry,
            pool,
            balancer,
        }
    }

    /// Forward a raw stream to a backend of `service_name`. `full_method`
    /// is the wire path, e.g. `/order.OrderService/Create`. Returns the
    /// stream of backend frames to relay to the caller.
    pub async fn proxy_stream(
        &self,
        service_name: &str,
        full_method: &str,
        mut inbound: Streaming<Bytes>,
    ) -> GatewayResult<BoxStream<'static, Result<Bytes, Status>>> {
        counter!("gateway_grpc_forwarded_streams").increment(1);

        // Discover -> select -> connect, same fabric as the HTTP path.
        let instances = self
            .registry
            .discover(service_name)
            .await
            .map_err(|err| {
                GatewayError::no_backend(service_name, format!("discovery failed: {err}"))
            })?;
        if instances.is_empty() {
            return Err(GatewayError::no_backend(
                service_name,
                "no available instances",
            ));
        }

        let instance = self.balancer.select(&instances).ok_or_else(|| {
            GatewayError::no_backend(service_name, "failed to select instance")
        })?;
        let target = instance.target();

        info!(
            service = %service_name,
            method = %full_method,
            target = %target,
            "proxying stream"
        );

        let channel = self
            .pool
            .get(&target)
            .map_err(|err| GatewayError::no_backend(service_name, err.to_string()))?;

        let path = PathAndQuery::try_from(full_method.to_string())
            .map_err(|err| GatewayError::internal(format!("invalid method path: {err}")))?;

        // Ingress -> egress. The pump must run before the client stream is
        // awaited: a unary backend will not answer until it has received
        // the request frame and the half-close.
        let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(FORWARD_BUFFER);
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        if frames_tx.send(frame).await.is_err() {
                            // Backend side gone; nothing left to forward.
                            return;
                        }
                    }
                    Ok(None) => {
                        // Client half-closed. Dropping the sender ends the
                        // outbound stream, which sends the half-close on.
                        return;
                    }
                    Err(status) => {
                        debug!(error = %status, "ingress receive ended");
                        return;
                    }
                }
            }
        });

        let mut client = Grpc::new(channel);
        if let Err(err) = client.ready().await {
            self.pool.mark_unhealthy(&target);
            return Err(GatewayError::no_backend(
                service_name,
                format!("failed to connect to backend {target}: {err}"),
            ));
        }

        let outbound = ReceiverStream::new(frames_rx);
        let response = client
            .streaming(Request::new(outbound), path, RawCodec)
            .await
            .map_err(GatewayError::Upstream)?;
        let mut backend = response.into_inner();

        // Egress -> ingress: relay frames in order until the backend ends
        // the stream, propagating its terminal status untouched.
        let output = async_stream::try_stream! {
            while let Some(frame) = backend.message().await? {
                yield frame;
            }
        };

        Ok(Box::pin(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancing::RoundRobinBalancer;
    use crate::registry::memory::InMemoryRegistry;
    use crate::registry::ServiceInstance;

    fn proxy(registry: Arc<InMemoryRegistry>) -> GrpcProxy {
        GrpcProxy::new(
            registry,
            Arc::new(ConnectionPool::new()),
            Arc::new(RoundRobinBalancer::new()),
        )
    }

    #[tokio::test]
    async fn test_selection_uses_registered_instances() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .register(ServiceInstance {
                id: "a".to_string(),
                name: "echo.Echo".to_string(),
                address: "127.0.0.1".to_string(),
                port: 50061,
                ..Default::default()
            })
            .await
            .unwrap();

        let forwarder = proxy(Arc::clone(&registry));
        let instances = registry.discover("echo.Echo").await.unwrap();
        let selected = forwarder.balancer.select(&instances).unwrap();
        assert_eq!(selected.target(), "127.0.0.1:50061");
    }
}
