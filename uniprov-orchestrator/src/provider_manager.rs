use std::collections::HashMap;
use std::sync::OnceLock;
use uniprov_common::{ProviderError, Result};
use uniprov_providers::Provider;

#[cfg(feature = "provider-mock")]
use uniprov_providers::mock::MockProvider;
#[cfg(feature = "provider-openstack")]
use uniprov_providers::openstack::OpenStackProvider;
#[cfg(feature = "provider-qemu")]
use uniprov_providers::qemu::QemuProvider;

pub type ProviderFactory = fn() -> Box<dyn Provider>;

/// Backend identifier to zero-argument constructor.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of every backend compiled into this build.
    pub fn builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "provider-qemu")]
        registry.register(uniprov_providers::qemu::BACKEND_NAME, || -> Box<dyn Provider> {
            Box::new(QemuProvider::new())
        });
        #[cfg(feature = "provider-openstack")]
        registry.register(uniprov_providers::openstack::BACKEND_NAME, || -> Box<dyn Provider> {
            Box::new(OpenStackProvider::new())
        });
        #[cfg(feature = "provider-mock")]
        registry.register(uniprov_providers::mock::BACKEND_NAME, || -> Box<dyn Provider> {
            Box::new(MockProvider::new())
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: ProviderFactory) {
        self.factories.insert(name.to_lowercase(), factory);
    }

    /// Construct a fresh, uninitialized handle. Credentials and connectivity
    /// are checked by `Provider::initialize`, not here.
    pub fn resolve(&self, name: &str) -> Result<Box<dyn Provider>> {
        self.factories
            .get(&name.trim().to_lowercase())
            .map(|factory| factory())
            .ok_or_else(|| {
                ProviderError::UnknownBackend(format!(
                    "'{}' (available: {})",
                    name,
                    self.names().join(", ")
                ))
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

static REGISTRY: OnceLock<ProviderRegistry> = OnceLock::new();

pub struct ProviderManager;

pub const DEFAULT_BACKEND: &str = "local-hypervisor";

impl ProviderManager {
    /// Normalized backend name; unset or blank selects [`DEFAULT_BACKEND`].
    pub fn provider_name(raw: Option<String>) -> String {
        raw.map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BACKEND.to_string())
    }

    /// Process-wide registry, built on first use and read-only afterwards.
    pub fn registry() -> &'static ProviderRegistry {
        REGISTRY.get_or_init(ProviderRegistry::builtin)
    }

    pub fn get_provider(provider_name: &str) -> Result<Box<dyn Provider>> {
        Self::registry().resolve(provider_name)
    }

    /// Resolve and initialize. An initialize failure is returned as is; the
    /// caller must resolve again rather than reuse the handle.
    pub async fn connect(provider_name: &str) -> Result<Box<dyn Provider>> {
        let mut provider = Self::get_provider(provider_name)?;
        tracing::info!("🔌 [provider_manager] initializing backend {}", provider.name());
        provider.initialize().await?;
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uniprov_common::ErrorKind;

    #[test]
    fn unknown_backend_is_a_registry_miss() {
        let registry = ProviderRegistry::new();
        let err = registry.resolve("vsphere").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UnknownBackend);
    }

    #[test]
    fn registered_factory_resolves_case_insensitively() {
        let mut registry = ProviderRegistry::new();
        registry.register("mock", || -> Box<dyn Provider> {
            Box::new(uniprov_providers::mock::MockProvider::new())
        });
        let provider = registry.resolve("MOCK").unwrap();
        assert_eq!(provider.name(), "mock");
        assert_eq!(registry.names(), vec!["mock"]);
    }

    #[test]
    fn provider_name_defaults_to_local_hypervisor() {
        assert_eq!(ProviderManager::provider_name(None), DEFAULT_BACKEND);
        assert_eq!(ProviderManager::provider_name(Some("  ".into())), DEFAULT_BACKEND);
        assert_eq!(ProviderManager::provider_name(Some(" Mock ".into())), "mock");
    }

    #[cfg(feature = "provider-qemu")]
    #[test]
    fn builtin_registry_has_local_hypervisor() {
        let provider = ProviderManager::get_provider("local-hypervisor").unwrap();
        assert_eq!(provider.name(), "local-hypervisor");
    }
}
