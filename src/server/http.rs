//! # HTTP Ingress
//!
//! Axum router for the JSON surface. Paths follow
//! `/rpc/[tenant/]<package.Service>/<Method>`; the tenant segment is
//! parsed and logged but not forwarded. Only POST is accepted. The body is
//! read once and handed to the transcoder untouched.

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::proxy::http_proxy::HttpProxy;

/// Parsed rpc path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Tenant segment, present only on four-or-more component paths.
    pub tenant: Option<String>,
    /// Fully qualified service name, e.g. `order.OrderService`.
    pub service_name: String,
    pub method_name: String,
}

/// Parse `/rpc/[tenant/]<service>/<method>`.
///
/// The service is always the second-to-last component and the method the
/// last, so extra middle segments are tolerated the same way the tenant
/// is.
pub fn parse_rpc_path(path: &str) -> GatewayResult<RpcRequest> {
    let trimmed = path.trim_matches('/');
    let parts: Vec<&str> = trimmed.split('/').collect();

    if parts.len() < 3 {
        return Err(GatewayError::invalid(format!(
            "invalid path format, expected /rpc/{{service}}/{{method}} or /rpc/{{tenant}}/{{service}}/{{method}}, got /{trimmed}"
        )));
    }
    if parts[0] != "rpc" {
        return Err(GatewayError::invalid(format!(
            "invalid path, expected /rpc prefix, got /{}",
            parts[0]
        )));
    }

    let method_name = parts[parts.len() - 1];
    if method_name.is_empty() {
        return Err(GatewayError::invalid("method name cannot be empty"));
    }
    let service_name = parts[parts.len() - 2];
    if service_name.is_empty() {
        return Err(GatewayError::invalid("service name cannot be empty"));
    }

    let tenant = if parts.len() > 3 {
        Some(parts[1].to_string())
    } else {
        None
    };

    Ok(RpcRequest {
        tenant,
        service_name: service_name.to_string(),
        method_name: method_name.to_string(),
    })
}

/// Shared state for the HTTP router.
#[derive(Clone)]
pub struct HttpState {
    /// `None` when the registry is disabled; rpc requests then answer 500.
    pub proxy: Option<Arc<HttpProxy>>,
}

/// Build the HTTP ingress router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(handle_rpc)
        .with_state(state)
}

/// Serve the HTTP ingress until the token is canceled.
pub async fn serve(
    listener: TcpListener,
    state: HttpState,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "HTTP server is healthy"
}

async fn handle_rpc(State(state): State<HttpState>, request: Request) -> Response {
    let Some(proxy) = state.proxy else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "HTTP proxy not configured",
        )
            .into_response();
    };

    if request.method() != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Only POST method is allowed").into_response();
    }

    let path = request.uri().path().to_owned();
    let body = match to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Failed to read request body: {err}"),
            )
                .into_response();
        }
    };

    let rpc = match parse_rpc_path(&path) {
        Ok(rpc) => rpc,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid request: {err}")).into_response();
        }
    };

    if let Some(tenant) = &rpc.tenant {
        // Tenant is observable for logging only; it is not forwarded.
        debug!(tenant = %tenant, service = %rpc.service_name, "tenant-scoped request");
    }

    match proxy
        .call_unary(&rpc.service_name, &rpc.method_name, &body)
        .await
    {
        Ok(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            response,
        )
            .into_response(),
        Err(err) => (
            err.http_status(),
            format!("RPC call failed: {}", err.to_status()),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_path() {
        let rpc = parse_rpc_path("/rpc/order.OrderService/Create").unwrap();
        assert_eq!(rpc.tenant, None);
        assert_eq!(rpc.service_name, "order.OrderService");
        assert_eq!(rpc.method_name, "Create");
    }

    #[test]
    fn test_parse_tenant_path() {
        let rpc = parse_rpc_path("/rpc/tenantA/order.OrderService/Create").unwrap();
        assert_eq!(rpc.tenant.as_deref(), Some("tenantA"));
        assert_eq!(rpc.service_name, "order.OrderService");
        assert_eq!(rpc.method_name, "Create");
    }

    #[test]
    fn test_parse_tolerates_trailing_slash() {
        let rpc = parse_rpc_path("/rpc/order.OrderService/Create/").unwrap();
        assert_eq!(rpc.method_name, "Create");
    }

    #[test]
    fn test_parse_extra_segments_keep_last_two() {
        // Service and method bind from the right; the first middle segment
        // is the tenant.
        let rpc = parse_rpc_path("/rpc/a/b/order.OrderService/Create").unwrap();
        assert_eq!(rpc.tenant.as_deref(), Some("a"));
        assert_eq!(rpc.service_name, "order.OrderService");
        assert_eq!(rpc.method_name, "Create");
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        assert!(parse_rpc_path("/health").is_err());
        assert!(parse_rpc_path("/rpc/onlyservice").is_err());
        assert!(parse_rpc_path("/api/order.OrderService/Create").is_err());
        assert!(parse_rpc_path("/").is_err());
    }
}
