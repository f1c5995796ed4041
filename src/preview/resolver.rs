use super::address::SandboxAddress;
use super::cache::PreviewCache;
use super::control_plane::SandboxControlPlane;
use crate::error::PreviewError;
use std::sync::Arc;

/// Upstream base URL and access token for a preview request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPreview {
    pub address: SandboxAddress,
    pub url: String,
    pub token: String,
}

/// Maps preview hosts to live upstreams, reusing cached pairs within the TTL.
///
/// Concurrent misses for the same key may both reach the control plane; the
/// last write wins, which is harmless because resolution has no side effects.
pub struct PreviewResolver {
    control_plane: Arc<dyn SandboxControlPlane>,
    cache: Arc<PreviewCache>,
    default_port: u16,
    wake_stopped: bool,
}

impl PreviewResolver {
    pub fn new(
        control_plane: Arc<dyn SandboxControlPlane>,
        cache: Arc<PreviewCache>,
        default_port: u16,
        wake_stopped: bool,
    ) -> Self {
        Self {
            control_plane,
            cache,
            default_port,
            wake_stopped,
        }
    }

    pub fn cache(&self) -> &Arc<PreviewCache> {
        &self.cache
    }

    pub fn parse(&self, host: &str) -> Result<SandboxAddress, PreviewError> {
        SandboxAddress::parse(host, self.default_port)
    }

    pub async fn resolve(&self, host: &str) -> Result<ResolvedPreview, PreviewError> {
        let address = self.parse(host)?;
        self.resolve_address(address).await
    }

    pub async fn resolve_address(
        &self,
        address: SandboxAddress,
    ) -> Result<ResolvedPreview, PreviewError> {
        let key = address.cache_key();
        if let Some(entry) = self.cache.get(&key) {
            tracing::trace!(key = %key, "preview cache hit");
            return Ok(ResolvedPreview {
                address,
                url: entry.url,
                token: entry.token,
            });
        }

        tracing::debug!(key = %key, "preview cache miss");
        if self.wake_stopped {
            let sandbox = self.control_plane.get_sandbox(&address.sandbox_id).await?;
            if sandbox.is_stopped() {
                tracing::info!(sandbox = %address.sandbox_id, state = %sandbox.state, "starting sandbox");
                self.control_plane.start_sandbox(&address.sandbox_id).await?;
            }
        }

        let preview = self
            .control_plane
            .get_port_preview_url(&address.sandbox_id, address.port)
            .await?;
        let entry = self.cache.insert(&key, preview.url, preview.token);
        Ok(ResolvedPreview {
            address,
            url: entry.url,
            token: entry.token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::control_plane::{PortPreview, SandboxInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeControlPlane {
        preview_calls: AtomicUsize,
        started: Mutex<Vec<String>>,
        state: &'static str,
    }

    #[async_trait]
    impl SandboxControlPlane for FakeControlPlane {
        async fn get_port_preview_url(
            &self,
            sandbox_id: &str,
            port: u16,
        ) -> Result<PortPreview, PreviewError> {
            let call = self.preview_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(PortPreview {
                url: format!("https://{}-{}.upstream.test", port, sandbox_id),
                token: format!("token-{}", call),
            })
        }

        async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo, PreviewError> {
            Ok(SandboxInfo {
                id: sandbox_id.to_string(),
                state: self.state.to_string(),
            })
        }

        async fn start_sandbox(&self, sandbox_id: &str) -> Result<(), PreviewError> {
            self.started.lock().unwrap().push(sandbox_id.to_string());
            Ok(())
        }
    }

    fn resolver(plane: Arc<FakeControlPlane>, wake: bool) -> PreviewResolver {
        let cache = Arc::new(PreviewCache::new(16, Duration::from_secs(60)));
        PreviewResolver::new(plane, cache, 3000, wake)
    }

    #[tokio::test(start_paused = true)]
    async fn second_resolve_within_ttl_uses_cache() {
        let plane = Arc::new(FakeControlPlane {
            state: "started",
            ..Default::default()
        });
        let resolver = resolver(plane.clone(), false);

        let first = resolver.resolve("3000-abc.preview.test").await.unwrap();
        let second = resolver.resolve("3000-abc.preview.test").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(plane.preview_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_after_ttl_refreshes_entry() {
        let plane = Arc::new(FakeControlPlane {
            state: "started",
            ..Default::default()
        });
        let resolver = resolver(plane.clone(), false);

        let first = resolver.resolve("abc.preview.test").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let second = resolver.resolve("abc.preview.test").await.unwrap();

        assert_eq!(plane.preview_calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.token, "token-1");
        assert_eq!(second.token, "token-2");
        assert_eq!(resolver.cache().get("abc:3000").unwrap().token, "token-2");
    }

    #[tokio::test]
    async fn stopped_sandbox_is_started_before_resolving() {
        let plane = Arc::new(FakeControlPlane {
            state: "stopped",
            ..Default::default()
        });
        let resolver = resolver(plane.clone(), true);

        resolver.resolve("5173-abc.preview.test").await.unwrap();
        assert_eq!(*plane.started.lock().unwrap(), vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn invalid_host_never_reaches_control_plane() {
        let plane = Arc::new(FakeControlPlane::default());
        let resolver = resolver(plane.clone(), true);

        assert!(matches!(
            resolver.resolve("localhost").await,
            Err(PreviewError::InvalidHost(_))
        ));
        assert_eq!(plane.preview_calls.load(Ordering::SeqCst), 0);
    }
}
