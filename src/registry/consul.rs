//! Consul-backed registry over the agent HTTP API.
//!
//! Registration installs either a TTL check (refreshed by a background
//! heartbeat at half the TTL) or, when the instance advertises an
//! `http_port`, an HTTP `/health` check performed by the Consul agent.
//! Discovery asks for passing instances only; watching uses blocking
//! queries keyed on `X-Consul-Index`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::config::RegistryConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::registry::{Registry, ServiceInstance, Watcher};

/// Consul client configuration.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Agent address, e.g. `127.0.0.1:8500`.
    pub address: String,
    /// `http` or `https`.
    pub scheme: String,
    /// ACL token, sent as `X-Consul-Token` when set.
    pub token: Option<String>,
    /// Blocking-query wait time.
    pub wait_time: Duration,
    pub health_check_timeout: Duration,
    pub health_check_ttl: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            scheme: "http".to_string(),
            token: None,
            wait_time: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            health_check_ttl: Duration::from_secs(15),
        }
    }
}

impl ConsulConfig {
    pub fn from_registry_config(config: &RegistryConfig) -> Self {
        Self {
            address: config.address.clone(),
            health_check_timeout: config.health_check_timeout(),
            health_check_ttl: config.health_check_ttl(),
            ..Default::default()
        }
    }
}

/// Thin handle over the Consul agent API, cheap to clone into the
/// heartbeat and watch tasks.
#[derive(Clone)]
struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    wait_time: Duration,
}

impl ApiClient {
    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    async fn update_ttl(&self, check_id: &str) -> GatewayResult<()> {
        let url = format!("{}/v1/agent/check/update/{check_id}", self.base_url);
        let response = self
            .authorized(self.http.put(&url))
            .json(&serde_json::json!({ "Status": "passing" }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "TTL update for {check_id} failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Query passing instances. With an index, this becomes a blocking
    /// query that returns once the service's index advances or the wait
    /// time elapses.
    async fn fetch_passing(
        &self,
        service_name: &str,
        index: Option<u64>,
    ) -> GatewayResult<(Vec<ServiceInstance>, u64)> {
        let url = format!("{}/v1/health/service/{service_name}", self.base_url);
        let mut request = self
            .authorized(self.http.get(&url))
            .query(&[("passing", "true")]);
        if let Some(index) = index {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", self.wait_time.as_secs())),
            ]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "health query for {service_name} failed with status {}",
                response.status()
            )));
        }

        let last_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or_default();

        let entries: Vec<HealthServiceEntry> = response.json().await?;
        let instances = entries
            .into_iter()
            .map(|entry| entry.service.into())
            .collect();
        Ok((instances, last_index))
    }
}

/// Consul [`Registry`] implementation.
pub struct ConsulRegistry {
    api: ApiClient,
    config: ConsulConfig,
    /// Heartbeat cancellation handles keyed by instance id, so
    /// deregistration tears down the matching TTL refresher.
    heartbeats: DashMap<String, CancellationToken>,
}

#[derive(Serialize)]
struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(rename = "Interval", skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
    #[serde(rename = "Timeout")]
    timeout: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

#[derive(Serialize)]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Check")]
    check: AgentServiceCheck,
}

#[derive(Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

impl From<AgentService> for ServiceInstance {
    fn from(svc: AgentService) -> Self {
        ServiceInstance {
            id: svc.id,
            name: svc.service,
            address: svc.address,
            port: svc.port,
            tags: svc.tags,
            metadata: svc.meta,
        }
    }
}

impl ConsulRegistry {
    pub fn new(config: ConsulConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            // Headroom above the blocking-query wait.
            .timeout(config.wait_time + Duration::from_secs(15))
            .build()?;
        let api = ApiClient {
            http,
            base_url: format!("{}://{}", config.scheme, config.address),
            token: config.token.clone(),
            wait_time: config.wait_time,
        };

        Ok(Self {
            api,
            config,
            heartbeats: DashMap::new(),
        })
    }

    /// Refresh the TTL check at half the TTL until the token is canceled
    /// or an update fails. A failed update means the service was likely
    /// deregistered externally; the loop ends without re-registration.
    fn spawn_heartbeat(&self, instance_id: String) {
        let token = CancellationToken::new();
        self.heartbeats.insert(instance_id.clone(), token.clone());

        let api = self.api.clone();
        let period = self.config.health_check_ttl / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so the cadence
            // starts one half-TTL after registration.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(instance_id = %instance_id, "heartbeat stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = api.update_ttl(&instance_id).await {
                            debug!(instance_id = %instance_id, error = %err, "heartbeat ended");
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, instance: ServiceInstance) -> GatewayResult<()> {
        let timeout = format!("{}s", self.config.health_check_timeout.as_secs());

        // Prefer an agent-driven HTTP check when the instance serves one;
        // otherwise fall back to a TTL check we refresh ourselves.
        let http_check = instance
            .metadata
            .get("http_port")
            .filter(|port| !port.is_empty())
            .map(|port| format!("http://{}:{}/health", instance.address, port));

        let check = match &http_check {
            Some(url) => AgentServiceCheck {
                check_id: instance.id.clone(),
                ttl: None,
                http: Some(url.clone()),
                interval: Some("10s".to_string()),
                timeout,
                deregister_critical_service_after: "30s".to_string(),
            },
            None => AgentServiceCheck {
                check_id: instance.id.clone(),
                ttl: Some(format!("{}s", self.config.health_check_ttl.as_secs())),
                http: None,
                interval: None,
                timeout,
                deregister_critical_service_after: "30s".to_string(),
            },
        };
        let uses_ttl = check.ttl.is_some();

        let registration = AgentServiceRegistration {
            id: instance.id.clone(),
            name: instance.name.clone(),
            address: instance.address.clone(),
            port: instance.port,
            tags: instance.tags.clone(),
            meta: instance.metadata.clone(),
            check,
        };

        let url = format!("{}/v1/agent/service/register", self.api.base_url);
        let response = self
            .api
            .authorized(self.api.http.put(&url))
            .json(&registration)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "service registration failed with status {}",
                response.status()
            )));
        }

        if uses_ttl {
            self.spawn_heartbeat(instance.id);
        }

        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> GatewayResult<()> {
        if let Some((_, token)) = self.heartbeats.remove(instance_id) {
            token.cancel();
        }

        let url = format!(
            "{}/v1/agent/service/deregister/{instance_id}",
            self.api.base_url
        );
        let response = self.api.authorized(self.api.http.put(&url)).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "service deregistration failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn discover(&self, service_name: &str) -> GatewayResult<Vec<ServiceInstance>> {
        let (instances, _) = self.api.fetch_passing(service_name, None).await?;
        Ok(instances)
    }

    async fn watch(&self, service_name: &str) -> GatewayResult<Box<dyn Watcher>> {
        let (event_tx, event_rx) = mpsc::channel::<Vec<ServiceInstance>>(1);
        let (err_tx, err_rx) = mpsc::channel::<GatewayError>(1);
        let token = CancellationToken::new();

        let api = self.api.clone();
        let service = service_name.to_string();
        let poll_token = token.clone();

        tokio::spawn(async move {
            let mut last_index = 0u64;
            loop {
                let result = tokio::select! {
                    _ = poll_token.cancelled() => return,
                    result = api.fetch_passing(&service, Some(last_index)) => result,
                };

                match result {
                    Err(err) => {
                        let _ = err_tx.try_send(err);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok((instances, index)) => {
                        // Same index means the blocking query timed out
                        // without changes; suppress the duplicate snapshot.
                        if index == last_index {
                            continue;
                        }
                        last_index = index;
                        tokio::select! {
                            _ = poll_token.cancelled() => return,
                            _ = event_tx.send(instances) => {}
                        }
                    }
                }
            }
        });

        Ok(Box::new(ConsulWatcher {
            events: event_rx,
            errors: err_rx,
            token,
        }))
    }

    async fn health_check(&self, instance_id: &str) -> GatewayResult<()> {
        self.api.update_ttl(instance_id).await
    }
}

struct ConsulWatcher {
    events: mpsc::Receiver<Vec<ServiceInstance>>,
    errors: mpsc::Receiver<GatewayError>,
    token: CancellationToken,
}

#[async_trait]
impl Watcher for ConsulWatcher {
    async fn next(&mut self) -> GatewayResult<Vec<ServiceInstance>> {
        tokio::select! {
            _ = self.token.cancelled() => Err(GatewayError::Canceled),
            Some(instances) = self.events.recv() => Ok(instances),
            Some(err) = self.errors.recv() => Err(err),
            else => Err(GatewayError::Canceled),
        }
    }

    fn stop(&mut self) {
        self.token.cancel();
    }
}
