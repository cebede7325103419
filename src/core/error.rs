//! # Error Handling Module
//!
//! All gateway failures flow through [`GatewayError`], defined with the
//! `thiserror` crate. Every variant carries enough context to produce both a
//! gRPC status (for the proxy paths) and an HTTP status (for the JSON
//! ingress), so the mapping between the two wire surfaces lives in exactly
//! one place.

use axum::http::StatusCode;
use thiserror::Error;
use tonic::{Code, Status};

/// Main result type used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy for the gateway.
///
/// The first group of variants covers the proxying core; the rest are
/// conversions from the libraries the gateway is built on.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration-related errors (invalid values, unsupported registry
    /// kinds, missing files).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The requested method is not present in the loaded descriptor set.
    #[error("method not found: {service}/{method}")]
    MethodNotFound { service: String, method: String },

    /// A message type referenced by a method could not be resolved.
    #[error("message descriptor not found: {name}")]
    MessageNotFound { name: String },

    /// The request body could not be decoded into the input message.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// No usable backend: discovery came back empty, selection produced
    /// nothing, or the dial failed. Retryable at a higher layer.
    #[error("no backend available for service {service}: {reason}")]
    NoBackend { service: String, reason: String },

    /// A status returned by the backend RPC, surfaced verbatim.
    #[error(transparent)]
    Upstream(#[from] Status),

    /// Unexpected internal failures (descriptor-to-prototype construction
    /// and friends).
    #[error("internal error: {message}")]
    Internal { message: String },

    /// The request context was canceled before completion.
    #[error("request canceled")]
    Canceled,

    /// Descriptor pool construction failures.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    /// Protobuf wire decoding failures.
    #[error("protobuf decode error: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    /// Transport-level failures when talking to a backend.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// I/O errors (descriptor files, listeners).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors for configuration files.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Outbound HTTP failures (hot-reload downloads, registry API calls).
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl GatewayError {
    /// Create a configuration error with a custom message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid-request error with a custom reason.
    pub fn invalid<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create a no-backend error for a service.
    pub fn no_backend<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        Self::NoBackend {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The gRPC status code this error maps to.
    pub fn code(&self) -> Code {
        match self {
            Self::MethodNotFound { .. } | Self::MessageNotFound { .. } => Code::NotFound,
            Self::InvalidRequest { .. } | Self::Json(_) => Code::InvalidArgument,
            Self::NoBackend { .. } | Self::Transport(_) => Code::Unavailable,
            Self::Upstream(status) => status.code(),
            Self::Canceled => Code::Cancelled,
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Descriptor(_)
            | Self::ProtoDecode(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::HttpClient(_) => Code::Internal,
        }
    }

    /// Render this error as a gRPC status. Backend statuses pass through
    /// untouched, preserving their code, message and details.
    pub fn to_status(&self) -> Status {
        match self {
            Self::Upstream(status) => status.clone(),
            other => Status::new(other.code(), other.to_string()),
        }
    }

    /// The HTTP status code the JSON ingress answers with. Downstream RPC
    /// failures are always a 500, whatever their gRPC code; the body
    /// carries the original status.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::MethodNotFound { .. } | Self::MessageNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidRequest { .. } | Self::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Upstream(status) => status,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}
