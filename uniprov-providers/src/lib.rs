use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uniprov_common::{Context, Datastore, Image, Instance, ProviderError, Result};

pub mod builder;
pub mod logs;

pub use builder::{CommandImageBuilder, ImageBuilder};
pub use logs::{InstanceLogs, LogTail};

/// Raw image bytes placed where the backend can register them from.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedImage {
    /// Direct-registration path: the catalog reads the local artifact itself.
    Local(PathBuf),
    /// Object uploaded into backend object storage.
    Object(StagedObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedObject {
    pub container: String,
    pub key: String,
    pub region: Option<String>,
    /// URL the catalog can fetch the bytes from.
    pub url: String,
    pub size_bytes: u64,
}

/// Optional object-storage capability of a backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn stage(&self, artifact: &Path, datastore: &Datastore) -> Result<StagedObject>;
}

/// Capability set every backend implements. Orchestration code only ever
/// programs against this trait.
///
/// Provided methods carry the behavior shared by all backends; a backend
/// overrides them only when it has something specific to do. Operations a
/// backend cannot perform return `UnsupportedOperation`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry identifier of this backend.
    fn name(&self) -> &'static str;

    /// Establish the session used by every later call on this handle.
    /// Missing configuration must fail here, never silently proceed.
    async fn initialize(&mut self) -> Result<()>;

    async fn build_image(&self, builder: &dyn ImageBuilder, ctx: &Context) -> Result<PathBuf> {
        let artifact = builder.build(&ctx.config).await?;
        self.customize_image(ctx, &artifact).await
    }

    async fn build_image_with_package(
        &self,
        builder: &dyn ImageBuilder,
        ctx: &Context,
        package: &Path,
    ) -> Result<PathBuf> {
        if !tokio::fs::try_exists(package).await.unwrap_or(false) {
            return Err(ProviderError::PackageNotFound(package.display().to_string()));
        }
        let artifact = builder.build_from_package(package, &ctx.config).await?;
        self.customize_image(ctx, &artifact).await
    }

    /// Hook run after every build. May read the artifact and return a new
    /// path; must not mutate the artifact or any shared state.
    async fn customize_image(&self, _ctx: &Context, artifact: &Path) -> Result<PathBuf> {
        Ok(artifact.to_path_buf())
    }

    fn object_store(&self) -> Option<&dyn ObjectStore> {
        None
    }

    /// Move the built artifact into backend-accessible storage. Without an
    /// object store or a configured datastore this degrades to the direct
    /// registration path.
    async fn stage_image(&self, ctx: &Context, artifact: &Path) -> Result<StagedImage> {
        match (self.object_store(), ctx.config.datastore.as_ref()) {
            (Some(store), Some(datastore)) => {
                let object = store.stage(artifact, datastore).await?;
                Ok(StagedImage::Object(object))
            }
            _ => Ok(StagedImage::Local(artifact.to_path_buf())),
        }
    }

    /// Register a staged image in the catalog. An existing image with the
    /// same name is rejected with `AlreadyExists`.
    async fn create_image(&self, ctx: &Context, staged: &StagedImage) -> Result<Image>;

    /// Catalog contents in a stable order.
    async fn list_images(&self, ctx: &Context) -> Result<Vec<Image>>;

    /// Deleting an absent image succeeds.
    async fn delete_image(&self, ctx: &Context, name: &str) -> Result<()>;

    async fn resize_image(&self, _ctx: &Context, _name: &str, _size: &str) -> Result<()> {
        Err(ProviderError::unsupported(self.name(), "resize_image"))
    }

    /// Create the instance described by `ctx.run_config` from a published
    /// image.
    async fn create_instance(&self, ctx: &Context) -> Result<Instance>;

    async fn list_instances(&self, ctx: &Context) -> Result<Vec<Instance>>;

    /// Deleting an absent instance succeeds.
    async fn delete_instance(&self, ctx: &Context, name: &str) -> Result<()>;

    async fn start_instance(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Stopping an absent, stopped or never-started instance succeeds.
    async fn stop_instance(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Console/serial output. With `watch` the result is a live tail the
    /// caller must cancel.
    async fn get_instance_logs(&self, ctx: &Context, name: &str, watch: bool)
        -> Result<InstanceLogs>;
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "qemu")]
pub mod hypervisor;

#[cfg(feature = "qemu")]
pub mod qemu;

#[cfg(feature = "openstack")]
pub mod openstack;
