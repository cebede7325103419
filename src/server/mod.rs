//! Ingress listeners: the HTTP/JSON router and the gRPC server with its
//! unknown-method forwarder.

pub mod grpc;
pub mod http;
