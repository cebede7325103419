//! # Hot Reload Module
//!
//! Periodically refreshes descriptor sets from local files or an artifact
//! repository and merges them into the [`DescriptorLoader`]. Reloads run
//! entirely off the request path: lookups keep seeing the old descriptors
//! until the loader's write lock releases, and after every successful
//! reload the registered message-cache-clear callback fires exactly once
//! so prototypes cached under stale descriptors are evicted.

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::{HotReloadConfig, ProtoSetInfo};
use crate::core::error::{GatewayError, GatewayResult};
use crate::proto::loader::DescriptorLoader;

type CacheClearFn = Arc<dyn Fn() + Send + Sync>;

/// Periodic descriptor-set refresher.
pub struct HotReloadManager {
    loader: Arc<DescriptorLoader>,
    config: HotReloadConfig,
    protosets: RwLock<HashMap<String, ProtoSetInfo>>,
    http: reqwest::Client,
    cache_clear: RwLock<Option<CacheClearFn>>,
    ticker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HotReloadManager {
    pub fn new(
        loader: Arc<DescriptorLoader>,
        config: HotReloadConfig,
        protosets: Vec<ProtoSetInfo>,
    ) -> Self {
        let protosets = protosets
            .into_iter()
            .map(|info| (info.service_name.clone(), info))
            .collect();

        Self {
            loader,
            config,
            protosets: RwLock::new(protosets),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            cache_clear: RwLock::new(None),
            ticker: Mutex::new(None),
        }
    }

    /// Register the callback that evicts cached message prototypes after a
    /// descriptor reload.
    pub fn set_cache_clear_fn<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.cache_clear.write() = Some(Arc::new(f));
    }

    /// Start the refresh ticker. Misconfiguration (`check_period <= 0`) is
    /// reported here rather than suppressed. Calling `start` while the
    /// ticker is already running is a no-op.
    pub fn start(self: &Arc<Self>) -> GatewayResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.config.check_period <= 0 {
            return Err(GatewayError::config(
                "hot reload check period must be greater than 0",
            ));
        }

        let mut slot = self.ticker.lock();
        if slot.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.config.check_period as u64);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = ticker.tick() => manager.check_and_reload().await,
                }
            }
        });

        *slot = Some((token, handle));
        info!(
            period_secs = self.config.check_period,
            "hot reload started"
        );
        Ok(())
    }

    /// Stop the ticker and wait for any in-flight reload cycle to finish.
    /// Safe to call without a prior `start`.
    pub async fn stop(&self) {
        let taken = self.ticker.lock().take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.await;
            info!("hot reload stopped");
        }
    }

    /// Register a new protoset source for subsequent cycles.
    pub fn register_protoset(&self, info: ProtoSetInfo) {
        self.protosets.write().insert(info.service_name.clone(), info);
    }

    /// Remove a protoset source.
    pub fn unregister_protoset(&self, service_name: &str) {
        self.protosets.write().remove(service_name);
    }

    /// Snapshot of the registered protoset sources.
    pub fn registered_protosets(&self) -> Vec<ProtoSetInfo> {
        self.protosets.read().values().cloned().collect()
    }

    /// Manually reload a single service's protoset.
    pub async fn reload_service(&self, service_name: &str) -> GatewayResult<()> {
        let info = self
            .protosets
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| {
                GatewayError::config(format!("protoset not found for service: {service_name}"))
            })?;
        self.reload_protoset(&info).await
    }

    async fn check_and_reload(&self) {
        let protosets: Vec<ProtoSetInfo> = self.protosets.read().values().cloned().collect();
        for info in protosets {
            if let Err(err) = self.reload_protoset(&info).await {
                warn!(
                    service = %info.service_name,
                    error = %err,
                    "failed to reload protoset"
                );
            }
        }
    }

    async fn reload_protoset(&self, info: &ProtoSetInfo) -> GatewayResult<()> {
        if !info.url.is_empty() {
            let temp = self.download_protoset(&info.url).await?;
            let data = tokio::fs::read(&temp).await;
            let _ = tokio::fs::remove_file(&temp).await;
            self.loader.load_from_bytes(&data?)?;
        } else if !info.path.is_empty() {
            self.loader.load_from_path(&info.path)?;
        } else {
            return Ok(());
        }

        // Prototypes built from the previous descriptors are now stale.
        if let Some(clear) = self.cache_clear.read().clone() {
            clear();
        }

        info!(service = %info.service_name, "reloaded protoset");
        Ok(())
    }

    /// Download a protoset, streaming the body to a temp file. The caller
    /// removes the file after reading it back.
    async fn download_protoset(&self, url: &str) -> GatewayResult<PathBuf> {
        let mut request = self.http.get(url);
        if !self.config.auth_token.is_empty() {
            request = request.bearer_auth(&self.config.auth_token);
        }

        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(GatewayError::internal(format!(
                "protoset download from {url} failed with status {}",
                response.status()
            )));
        }

        let path = std::env::temp_dir().join(format!("protoset-{}.pb", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(err.into());
                }
            };
            if let Err(err) = file.write_all(&chunk).await {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(err.into());
            }
        }
        file.flush().await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use prost_types::{
        DescriptorProto, FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto,
        ServiceDescriptorProto,
    };
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn svc_descriptor_set(package: &str) -> Vec<u8> {
        FileDescriptorSet {
            file: vec![FileDescriptorProto {
                name: Some(format!("{package}.proto")),
                package: Some(package.to_string()),
                syntax: Some("proto3".to_string()),
                message_type: vec![
                    DescriptorProto {
                        name: Some("OpRequest".to_string()),
                        ..Default::default()
                    },
                    DescriptorProto {
                        name: Some("OpReply".to_string()),
                        ..Default::default()
                    },
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

    #[tokio::test]
    async fn test_start_rejects_nonpositive_period() {
        let loader = Arc::new(DescriptorLoader::empty());
        let manager = Arc::new(HotReloadManager::new(
            loader,
            HotReloadConfig {
                enabled: true,
                check_period: 0,
                auth_token: String::new(),
            },
            vec![],
        ));
        let err = manager.start().unwrap_err();
        assert!(err.to_string().contains("check period"));
    }

    #[tokio::test]
    async fn test_disabled_start_is_noop() {
        let loader = Arc::new(DescriptorLoader::empty());
        let manager = Arc::new(HotReloadManager::new(
            loader,
            HotReloadConfig::default(),
            vec![],
        ));
        manager.start().unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_manual_reload_merges_and_clears_cache() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&svc_descriptor_set("v2")).unwrap();
        file.flush().unwrap();

        let loader = Arc::new(DescriptorLoader::from_bytes(&svc_descriptor_set("v1")).unwrap());
        let manager = Arc::new(HotReloadManager::new(
            Arc::clone(&loader),
            HotReloadConfig {
                enabled: true,
                check_period: 60,
                auth_token: String::new(),
            },
            vec![ProtoSetInfo {
                service_name: "v2".to_string(),
                path: file.path().to_string_lossy().into_owned(),
                url: String::new(),
            }],
        ));

        let clears = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&clears);
        manager.set_cache_clear_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(loader.find_method("v2.Svc", "Op").is_none());
        manager.reload_service("v2").await.unwrap();

        assert!(loader.find_method("v2.Svc", "Op").is_some());
        assert!(loader.find_method("v1.Svc", "Op").is_some());
        assert_eq!(clears.load(Ordering::SeqCst), 1);

        // One clear per reload, not per start.
        manager.reload_service("v2").await.unwrap();
        assert_eq!(clears.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reload_unknown_service_errors() {
        let loader = Arc::new(DescriptorLoader::empty());
        let manager = Arc::new(HotReloadManager::new(
            loader,
            HotReloadConfig::default(),
            vec![],
        ));
        assert!(manager.reload_service("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_protoset_registration_roundtrip() {
        let loader = Arc::new(DescriptorLoader::empty());
        let manager = Arc::new(HotReloadManager::new(
            loader,
            HotReloadConfig::default(),
            vec![],
        ));

        manager.register_protoset(ProtoSetInfo {
            service_name: "order".to_string(),
            path: "/tmp/order.pb".to_string(),
            url: String::new(),
        });
        assert_eq!(manager.registered_protosets().len(), 1);

        manager.unregister_protoset("order");
        assert!(manager.registered_protosets().is_empty());
    }
}
