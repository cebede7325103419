//! The proxying core: connection pooling, dynamic message construction,
//! wire codecs, the HTTP-to-gRPC transcoder and the transparent gRPC stream
//! forwarder.

pub mod codec;
pub mod grpc_proxy;
pub mod http_proxy;
pub mod message;
pub mod pool;

pub use grpc_proxy::GrpcProxy;
pub use http_proxy::HttpProxy;
pub use message::{MessageBuilder, PrototypeCache};
pub use pool::ConnectionPool;
