//! # HTTP-to-gRPC Transcoder
//!
//! Translates a JSON request into a unary gRPC call against a discovered
//! backend. The method is resolved against the runtime descriptor set, the
//! request body is deserialized into a dynamic message using canonical
//! protobuf-JSON rules, and the response is marshaled back to JSON bytes.
//! Backend status errors are surfaced verbatim; nothing here retries.

use http::uri::PathAndQuery;
use metrics::{counter, histogram};
use prost_reflect::DynamicMessage;
use std::sync::Arc;
use std::time::Instant;
use tonic::client::Grpc;
use tonic::Request;
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::LoadBalancer;
use crate::proto::loader::DescriptorLoader;
use crate::proxy::codec::DynamicCodec;
use crate::proxy::message::MessageBuilder;
use crate::proxy::pool::ConnectionPool;
use crate::registry::Registry;

/// HTTP ingress proxy: JSON in, JSON out, unary gRPC in between.
pub struct HttpProxy {
    loader: Arc<DescriptorLoader>,
    registry: Arc<dyn Registry>,
    pool: Arc<ConnectionPool>,
    balancer: Arc<dyn LoadBalancer>,
    messages: Arc<dyn MessageBuilder>,
}

impl HttpProxy {
    pub fn new(
        loader: Arc<DescriptorLoader>,
        registry: Arc<dyn Registry>,
        pool: Arc<ConnectionPool>,
        balancer: Arc<dyn LoadBalancer>,
        messages: Arc<dyn MessageBuilder>,
    ) -> Self {
        Self {
            loader,
            registry,
            pool,
            balancer,
            messages,
        }
    }

    /// Proxy one JSON request to `service_name/method_name` and return the
    /// canonical protobuf-JSON response bytes.
    pub async fn call_unary(
        &self,
        service_name: &str,
        method_name: &str,
        json_body: &[u8],
    ) -> GatewayResult<Vec<u8>> {
        let started = Instant::now();
        counter!("gateway_http_requests").increment(1);

        // 1. Resolve the method against the descriptor set.
        let method = self
            .loader
            .find_method(service_name, method_name)
            .ok_or_else(|| GatewayError::MethodNotFound {
                service: service_name.to_string(),
                method: method_name.to_string(),
            })?;

        // 2. Build the request message from the JSON body.
        let input = self.messages.message_descriptor(&method.input_type)?;
        let mut deserializer = serde_json::Deserializer::from_slice(json_body);
        let request_msg = DynamicMessage::deserialize(input, &mut deserializer)
            .map_err(|err| GatewayError::invalid(format!("failed to unmarshal request: {err}")))?;
        deserializer
            .end()
            .map_err(|err| GatewayError::invalid(format!("trailing request data: {err}")))?;

        // 3. Discover backend instances.
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

        // 4. Select one.
        let instance = self.balancer.select(&instances).ok_or_else(|| {
            GatewayError::no_backend(service_name, "failed to select instance")
        })?;
        let target = instance.target();

        info!(
            service = %service_name,
            method = %method_name,
            target = %target,
            "proxying HTTP request"
        );

        // 5. Connect through the pool.
        let channel = self
            .pool
            .get(&target)
            .map_err(|err| GatewayError::no_backend(service_name, err.to_string()))?;

        // 6. Invoke the unary RPC.
        let output = self.messages.message_descriptor(&method.output_type)?;
        let path = PathAndQuery::try_from(format!("/{service_name}/{method_name}"))
            .map_err(|err| GatewayError::internal(format!("invalid method path: {err}")))?;

        let mut client = Grpc::new(channel);
        if let Err(err) = client.ready().await {
            // The transport could not produce a usable connection; evict
            // it so the next request dials fresh.
            self.pool.mark_unhealthy(&target);
            return Err(GatewayError::no_backend(
                service_name,
                format!("failed to connect to backend {target}: {err}"),
            ));
        }

        let request = Request::new(request_msg);
        let response = client
            .unary(request, path, DynamicCodec::new(output))
            .await
            .map_err(GatewayError::Upstream)?;

        // 7. Marshal the response back to JSON.
        let body = serde_json::to_vec(&response.into_inner())
            .map_err(|err| GatewayError::internal(format!("failed to marshal response: {err}")))?;

        histogram!("gateway_http_unary_duration_seconds").record(started.elapsed().as_secs_f64());
        debug!(
            service = %service_name,
            method = %method_name,
            duration_ms = started.elapsed().as_millis() as u64,
            "completed unary call"
        );
        Ok(body)
    }
}
