use crate::error::OrchestrationError;
use crate::record::TenantId;
use crate::step::{PipelineStep, StepService};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Resolved, shareable reference to a pipeline collaborator instance.
pub type ServiceHandle = Arc<dyn StepService>;

/// Builds collaborator instances on demand.
///
/// Shared-scope providers are called once per process; per-tenant providers
/// once per tenant. Creation failures are not cached, so a later resolve
/// retries the provider.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Creates a handle for the given tenant.
    async fn create(&self, tenant_id: &TenantId) -> Result<ServiceHandle, OrchestrationError>;
}

/// Caching scope of a registered collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceScope {
    /// Stateless collaborator: one handle shared process-wide.
    Shared,
    /// Collaborator touching per-tenant state: one handle per tenant,
    /// created lazily on first use.
    PerTenant,
}

struct Registration {
    scope: ServiceScope,
    provider: Arc<dyn ServiceProvider>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Shared(PipelineStep),
    Tenant(TenantId, PipelineStep),
}

/// Resolves which collaborator instance handles a step for a tenant.
///
/// Handles are created lazily on first use, cached for the process lifetime,
/// and only dropped by explicit [`invalidate`](ServiceRegistry::invalidate)
/// after a collaborator signals a broken connection. Concurrent resolves for
/// the same uncached key are single-flight: exactly one provider call runs
/// and everyone shares its handle.
///
/// The registry carries no global state; construct it with
/// [`ServiceRegistry::builder`] and pass it by `Arc` to whatever needs it.
pub struct ServiceRegistry {
    registrations: HashMap<PipelineStep, Registration>,
    cache: Mutex<HashMap<CacheKey, Arc<OnceCell<ServiceHandle>>>>,
}

impl ServiceRegistry {
    /// Starts building a registry.
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::new()
    }

    fn cache_lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<OnceCell<ServiceHandle>>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_for(&self, tenant_id: &TenantId, step: PipelineStep, scope: ServiceScope) -> CacheKey {
        match scope {
            ServiceScope::Shared => CacheKey::Shared(step),
            ServiceScope::PerTenant => CacheKey::Tenant(tenant_id.clone(), step),
        }
    }

    /// Resolves the handle serving `step` for `tenant_id`.
    ///
    /// # Errors
    ///
    /// [`OrchestrationError::ServiceUnavailable`] when no collaborator is
    /// registered for the step or the provider fails to create one.
    pub async fn resolve(
        &self,
        tenant_id: &TenantId,
        step: PipelineStep,
    ) -> Result<ServiceHandle, OrchestrationError> {
        let registration = self.registrations.get(&step).ok_or_else(|| {
            OrchestrationError::ServiceUnavailable {
                step,
                details: "no collaborator registered".to_string(),
            }
        })?;

        let key = self.key_for(tenant_id, step, registration.scope);
        let cell = {
            let mut cache = self.cache_lock();
            cache.entry(key).or_default().clone()
        };

        let handle = cell
            .get_or_try_init(|| async {
                info!(%step, %tenant_id, "creating collaborator handle");
                registration.provider.create(tenant_id).await
            })
            .await?;
        Ok(handle.clone())
    }

    /// Drops the cached handle for `(tenant_id, step)`.
    ///
    /// Call when a collaborator signals a broken connection; the next
    /// resolve recreates the handle through its provider.
    pub fn invalidate(&self, tenant_id: &TenantId, step: PipelineStep) {
        if let Some(registration) = self.registrations.get(&step) {
            let key = self.key_for(tenant_id, step, registration.scope);
            if self.cache_lock().remove(&key).is_some() {
                debug!(%step, %tenant_id, "invalidated collaborator handle");
            }
        }
    }

    /// Number of live cached handles, for monitoring.
    pub fn cached_handles(&self) -> usize {
        self.cache_lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

/// Builder for [`ServiceRegistry`].
///
/// Every pipeline step must have exactly one registration before `build`
/// succeeds.
pub struct ServiceRegistryBuilder {
    registrations: HashMap<PipelineStep, Registration>,
}

impl Default for ServiceRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Registers a provider for a step with the given scope.
    pub fn register(
        mut self,
        step: PipelineStep,
        scope: ServiceScope,
        provider: Arc<dyn ServiceProvider>,
    ) -> Self {
        self.registrations
            .insert(step, Registration { scope, provider });
        self
    }

    /// Registers a stateless collaborator shared process-wide.
    pub fn register_shared(self, step: PipelineStep, provider: Arc<dyn ServiceProvider>) -> Self {
        self.register(step, ServiceScope::Shared, provider)
    }

    /// Registers a collaborator cached per tenant.
    pub fn register_per_tenant(
        self,
        step: PipelineStep,
        provider: Arc<dyn ServiceProvider>,
    ) -> Self {
        self.register(step, ServiceScope::PerTenant, provider)
    }

    /// Validates that every pipeline step is covered and builds the registry.
    pub fn build(self) -> Result<ServiceRegistry, OrchestrationError> {
        for step in PipelineStep::ALL {
            if !self.registrations.contains_key(&step) {
                return Err(OrchestrationError::Configuration(format!(
                    "no collaborator registered for step '{step}'"
                )));
            }
        }
        Ok(ServiceRegistry {
            registrations: self.registrations,
            cache: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{InvokeError, StepOutput, StepRequest};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopService;

    #[async_trait]
    impl StepService for NoopService {
        async fn invoke(&self, _request: StepRequest) -> Result<StepOutput, InvokeError> {
            Ok(StepOutput { result_ref: None })
        }
    }

    struct CountingProvider {
        created: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ServiceProvider for CountingProvider {
        async fn create(&self, _tenant_id: &TenantId) -> Result<ServiceHandle, OrchestrationError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent resolves overlap inside the provider.
            tokio::task::yield_now().await;
            Ok(Arc::new(NoopService))
        }
    }

    fn registry_with(provider: Arc<CountingProvider>, scope: ServiceScope) -> ServiceRegistry {
        let mut builder = ServiceRegistry::builder();
        for step in PipelineStep::ALL {
            builder = builder.register(step, scope, provider.clone());
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_build_requires_all_steps() {
        let result = ServiceRegistry::builder()
            .register_shared(PipelineStep::Chunking, CountingProvider::new())
            .build();
        assert!(matches!(
            result,
            Err(OrchestrationError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_scope_reuses_one_handle_across_tenants() {
        let provider = CountingProvider::new();
        let registry = registry_with(provider.clone(), ServiceScope::Shared);

        let a = registry
            .resolve(&TenantId::new("t1"), PipelineStep::Chunking)
            .await
            .unwrap();
        let b = registry
            .resolve(&TenantId::new("t2"), PipelineStep::Chunking)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_tenant_scope_isolates_tenants() {
        let provider = CountingProvider::new();
        let registry = registry_with(provider.clone(), ServiceScope::PerTenant);

        let a = registry
            .resolve(&TenantId::new("t1"), PipelineStep::Chunking)
            .await
            .unwrap();
        let b = registry
            .resolve(&TenantId::new("t2"), PipelineStep::Chunking)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(provider.created.load(Ordering::SeqCst), 2);

        // Second resolve for a known tenant hits the cache.
        let a2 = registry
            .resolve(&TenantId::new("t1"), PipelineStep::Chunking)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &a2));
        assert_eq!(provider.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_are_single_flight() {
        let provider = CountingProvider::new();
        let registry = Arc::new(registry_with(provider.clone(), ServiceScope::PerTenant));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .resolve(&TenantId::new("t1"), PipelineStep::Vectorization)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_recreates_handle() {
        let provider = CountingProvider::new();
        let registry = registry_with(provider.clone(), ServiceScope::PerTenant);
        let tenant = TenantId::new("t1");

        let first = registry
            .resolve(&tenant, PipelineStep::Summarization)
            .await
            .unwrap();
        registry.invalidate(&tenant, PipelineStep::Summarization);
        let second = registry
            .resolve(&tenant, PipelineStep::Summarization)
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(provider.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_handle_count() {
        let provider = CountingProvider::new();
        let registry = registry_with(provider, ServiceScope::PerTenant);
        assert_eq!(registry.cached_handles(), 0);
        registry
            .resolve(&TenantId::new("t1"), PipelineStep::Chunking)
            .await
            .unwrap();
        assert_eq!(registry.cached_handles(), 1);
    }
}
