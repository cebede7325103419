//! Shared fixtures for the integration suites: programmatic descriptor
//! sets (no protoc involved), a raw-echo gRPC backend built from the
//! gateway's own codec machinery, and listener helpers.

#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use prost::Message as _;
use prost_types::{
    field_descriptor_proto, DescriptorProto, FieldDescriptorProto, FileDescriptorProto,
    FileDescriptorSet, MethodDescriptorProto, ServiceDescriptorProto,
};
use std::convert::Infallible;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tonic::codegen::{http, Body, StdError};
use tonic::server::{Grpc, StreamingService};
use tonic::{Request, Response, Status, Streaming};
use tower::Service;

use dynagate::load_balancing::RoundRobinBalancer;
use dynagate::proto::DescriptorLoader;
use dynagate::proxy::codec::RawCodec;
use dynagate::proxy::{
    ConnectionPool, GrpcProxy, HttpProxy, MessageBuilder, PrototypeCache,
};
use dynagate::registry::memory::InMemoryRegistry;
use dynagate::registry::{Registry, ServiceInstance};
use dynagate::server;

fn string_field(name: &str, number: i32) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(field_descriptor_proto::Label::Optional as i32),
        r#type: Some(field_descriptor_proto::Type::String as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    }
}

fn string_message(name: &str, field: &str) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: vec![string_field(field, 1)],
        ..Default::default()
    }
}

/// Descriptor set for `echo.Echo`: unary `Say(SayRequest) -> SayReply`
/// and bidi `Chat(stream Frame) -> stream Frame`.
pub fn echo_descriptor_set() -> Vec<u8> {
    FileDescriptorSet {
        file: vec![FileDescriptorProto {
            name: Some("echo.proto".to_string()),
            package: Some("echo".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                string_message("SayRequest", "msg"),
                string_message("SayReply", "reply"),
                string_message("Frame", "data"),
            ],
            service: vec![ServiceDescriptorProto {
                name: Some("Echo".to_string()),
                method: vec![
                    MethodDescriptorProto {
                        name: Some("Say".to_string()),
                        input_type: Some(".echo.SayRequest".to_string()),
                        output_type: Some(".echo.SayReply".to_string()),
                        ..Default::default()
                    },
                    MethodDescriptorProto {
                        name: Some("Chat".to_string()),
                        input_type: Some(".echo.Frame".to_string()),
                        output_type: Some(".echo.Frame".to_string()),
                        client_streaming: Some(true),
                        server_streaming: Some(true),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
    .encode_to_vec()
}

/// Descriptor set for a `{package}.Svc` service with a single unary
/// `Op(OpRequest) -> OpReply` method, both messages with one string field.
pub fn versioned_descriptor_set(package: &str) -> Vec<u8> {
    FileDescriptorSet {
        file: vec![FileDescriptorProto {
            name: Some(format!("{package}.proto")),
            package: Some(package.to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                string_message("OpRequest", "val"),
                string_message("OpReply", "val"),
            ],
            service: vec![ServiceDescriptorProto {
                name: Some("Svc".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("Op".to_string()),
                    input_type: Some(format!(".{package}.OpRequest")),
                    output_type: Some(format!(".{package}.OpReply")),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
    .encode_to_vec()
}

/// Raw-frame echo backend: every method path echoes each request frame
/// back in order and closes cleanly when the client half-closes.
#[derive(Clone)]
pub struct EchoBackend;

impl<B> Service<http::Request<B>> for EchoBackend
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
        Box::pin(async move {
            let mut grpc = Grpc::new(RawCodec);
            Ok(grpc.streaming(EchoStreaming, req).await)
        })
    }
}

struct EchoStreaming;

impl StreamingService<Bytes> for EchoStreaming {
    type Response = Bytes;
    type ResponseStream = BoxStream<'static, Result<Bytes, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let frames = async_stream::try_stream! {
                while let Some(frame) = inbound.message().await? {
                    yield frame;
                }
            };
            Ok(Response::new(
                Box::pin(frames) as Self::ResponseStream
            ))
        })
    }
}

/// Spawn the raw echo backend on an ephemeral port.
pub async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = axum::Router::new().fallback_service(EchoBackend);
    tokio::spawn(axum::serve(listener, router).into_future());
    addr
}

/// Spawn the gateway's gRPC ingress on an ephemeral port.
pub async fn spawn_gateway_grpc(proxy: Option<Arc<GrpcProxy>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server::grpc::router(proxy).await;
    tokio::spawn(axum::serve(listener, router).into_future());
    addr
}

/// Spawn the gateway's HTTP ingress on an ephemeral port.
pub async fn spawn_gateway_http(state: server::http::HttpState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server::http::router(state);
    tokio::spawn(axum::serve(listener, router).into_future());
    addr
}

/// Registry with one instance of `service` pointing at `backend`.
pub async fn registry_with_backend(service: &str, backend: SocketAddr) -> Arc<InMemoryRegistry> {
    let registry = Arc::new(InMemoryRegistry::new());
    registry
        .register(ServiceInstance {
            id: "backend-1".to_string(),
            name: service.to_string(),
            address: backend.ip().to_string(),
            port: backend.port(),
            ..Default::default()
        })
        .await
        .unwrap();
    registry
}

/// Assembled HTTP-side fixture pieces.
pub struct HttpFixture {
    pub loader: Arc<DescriptorLoader>,
    pub registry: Arc<InMemoryRegistry>,
    pub messages: Arc<PrototypeCache>,
    pub proxy: Arc<HttpProxy>,
}

/// Build an HTTP proxy over the given loader and registry.
pub fn http_fixture(loader: Arc<DescriptorLoader>, registry: Arc<InMemoryRegistry>) -> HttpFixture {
    let messages = Arc::new(PrototypeCache::new(Arc::clone(&loader)));
    let proxy = Arc::new(HttpProxy::new(
        Arc::clone(&loader),
        Arc::clone(&registry) as Arc<dyn Registry>,
        Arc::new(ConnectionPool::new()),
        Arc::new(RoundRobinBalancer::new()),
        Arc::clone(&messages) as Arc<dyn MessageBuilder>,
    ));
    HttpFixture {
        loader,
        registry,
        messages,
        proxy,
    }
}

/// Build a gRPC stream forwarder over the given registry.
pub fn grpc_forwarder(registry: Arc<InMemoryRegistry>) -> Arc<GrpcProxy> {
    Arc::new(GrpcProxy::new(
        registry as Arc<dyn Registry>,
        Arc::new(ConnectionPool::new()),
        Arc::new(RoundRobinBalancer::new()),
    ))
}
