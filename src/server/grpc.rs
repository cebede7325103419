//! # gRPC Ingress
//!
//! The gRPC listener registers the standard `grpc.health.v1.Health`
//! service and routes every other method path to [`ForwardService`], the
//! unknown-method handler. The handler is a tower service in the shape
//! tonic generates for static services, except that it accepts any path
//! and wraps the call in a raw-codec bidi stream, which covers unary,
//! client-streaming, server-streaming and bidi calls uniformly.

use axum::Router;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::codegen::{http, Body, StdError};
use tonic::server::{Grpc, StreamingService};
use tonic::{Request, Response, Status, Streaming};
use tower::Service;
use tracing::{debug, info};

use crate::core::error::GatewayResult;
use crate::proxy::codec::RawCodec;
use crate::proxy::grpc_proxy::GrpcProxy;

/// Split a wire method path into `(service, method)`.
///
/// The boundary is the first `/` after trimming the leading one. With no
/// separator the whole remainder is treated as the method and the service
/// is empty; callers treat an empty service as a routing failure.
pub fn parse_service_method(full_method: &str) -> (String, String) {
    let trimmed = full_method.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((service, method)) => (service.to_string(), method.to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}

/// Catch-all gRPC service that forwards every method path through the
/// stream proxy.
#[derive(Clone)]
pub struct ForwardService {
    proxy: Option<Arc<GrpcProxy>>,
}

impl ForwardService {
    /// `proxy` is `None` when the registry is disabled; calls then fail
    /// with an internal status instead of being forwarded.
    pub fn new(proxy: Option<Arc<GrpcProxy>>) -> Self {
        Self { proxy }
    }
}

impl<B> Service<http::Request<B>> for ForwardService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let proxy = self.proxy.clone();
        Box::pin(async move {
            let path = req.uri().path().to_owned();
            let handler = ForwardStreaming { proxy, path };
            let mut grpc = Grpc::new(RawCodec);
            Ok(grpc.streaming(handler, req).await)
        })
    }
}

struct ForwardStreaming {
    proxy: Option<Arc<GrpcProxy>>,
    path: String,
}

impl StreamingService<Bytes> for ForwardStreaming {
    type Response = Bytes;
    type ResponseStream = BoxStream<'static, Result<Bytes, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let proxy = self.proxy.clone();
        let path = self.path.clone();

        Box::pin(async move {
            let (service_name, method_name) = parse_service_method(&path);
            debug!(
                service = %service_name,
                method = %method_name,
                "handling unknown service call"
            );

            if service_name.is_empty() {
                return Err(Status::unimplemented(format!(
                    "malformed method path: {path}"
                )));
            }
            let Some(proxy) = proxy else {
                return Err(Status::internal(format!(
                    "proxy not configured, cannot forward request to service: {service_name}"
                )));
            };

            let inbound = request.into_inner();
            let frames = proxy
                .proxy_stream(&service_name, &path, inbound)
                .await
                .map_err(Status::from)?;
            Ok(Response::new(frames))
        })
    }
}

/// Build the gRPC ingress router: health service plus the catch-all
/// forwarder.
pub async fn router(proxy: Option<Arc<GrpcProxy>>) -> Router {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;

    Router::new()
        .route_service("/grpc.health.v1.Health/*rpc", health_service)
        .fallback_service(ForwardService::new(proxy))
}

/// Serve the gRPC ingress until the token is canceled.
pub async fn serve(
    listener: TcpListener,
    proxy: Option<Arc<GrpcProxy>>,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    info!(addr = %listener.local_addr()?, "gRPC server listening");
    axum::serve(listener, router(proxy).await)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
