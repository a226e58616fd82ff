use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uniprov_common::{
    Configuration, Context, ErrorKind, ImageSource, ImageStatus, ProviderError, Result,
    RunConfiguration,
};
use uniprov_orchestrator::ImageLifecycle;
use uniprov_providers::mock::MockProvider;
use uniprov_providers::qemu::QemuProvider;
use uniprov_providers::{ImageBuilder, Provider, StagedImage};

/// Writes a small fake boot image where the real builder would.
struct FakeBuilder;

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, config: &Configuration) -> Result<PathBuf> {
        match &config.source {
            Some(ImageSource::Program(_)) => write_artifact(config).await,
            Some(ImageSource::Package(path)) => self.build_from_package(path, config).await,
            None => Err(ProviderError::BuildFailed("nothing to build".into())),
        }
    }

    async fn build_from_package(&self, _package: &Path, config: &Configuration) -> Result<PathBuf> {
        write_artifact(config).await
    }
}

async fn write_artifact(config: &Configuration) -> Result<PathBuf> {
    let path = config.artifact_path();
    tokio::fs::create_dir_all(&config.output_dir).await?;
    tokio::fs::write(&path, vec![0u8; 8192]).await?;
    Ok(path)
}

fn context(out: &Path, name: &str) -> Context {
    let mut config = Configuration::new(name);
    config.output_dir = out.to_path_buf();
    Context::new(config, RunConfiguration::default())
}

fn package(dir: &Path) -> PathBuf {
    let pkg = dir.join("pkg.tar");
    std::fs::write(&pkg, b"package bytes").unwrap();
    pkg
}

async fn local_hypervisor(home: &Path) -> Box<dyn Provider> {
    let mut provider = QemuProvider::new().with_home(home);
    provider.initialize().await.unwrap();
    Box::new(provider)
}

#[tokio::test]
async fn gtest_is_listed_only_after_publish() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let mut images = ImageLifecycle::new(local_hypervisor(home.path()).await, Arc::new(FakeBuilder));
    let ctx = context(&work.path().join("out"), "gtest");
    let pkg = package(work.path());

    let artifact = images.build_with_package(&ctx, &pkg).await.unwrap();
    assert!(artifact.exists());
    assert_eq!(images.record("gtest").unwrap().status, ImageStatus::Built);

    let listing = images.list(&ctx).await.unwrap();
    assert!(listing.warning.is_none());
    assert!(!listing.items.iter().any(|i| i.name == "gtest"));

    let image = images.publish(&ctx).await.unwrap();
    assert_eq!(image.name, "gtest");
    let listing = images.list(&ctx).await.unwrap();
    assert!(listing.items.iter().any(|i| i.name == "gtest"));

    let record = images.record("gtest").unwrap();
    let path: Vec<ImageStatus> = record.history.iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![
            ImageStatus::Building,
            ImageStatus::Built,
            ImageStatus::Staged,
            ImageStatus::Published
        ]
    );
    assert_eq!(record.image_id.as_deref(), Some(image.id.as_str()));
}

#[tokio::test]
async fn republish_is_rejected() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let mut images = ImageLifecycle::new(local_hypervisor(home.path()).await, Arc::new(FakeBuilder));
    let ctx = context(work.path(), "gtest");
    let pkg = package(work.path());

    images.build_and_publish(&ctx, Some(&pkg)).await.unwrap();
    let err = images.publish(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    // A second orchestrator on the same catalog hits the backend's check.
    let mut again = ImageLifecycle::new(local_hypervisor(home.path()).await, Arc::new(FakeBuilder));
    let err = again.build_and_publish(&ctx, Some(&pkg)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(again.record("gtest").unwrap().status, ImageStatus::Staged);
}

#[tokio::test]
async fn missing_package_fails_the_build() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let mut images = ImageLifecycle::new(local_hypervisor(home.path()).await, Arc::new(FakeBuilder));
    let ctx = context(work.path(), "gtest");

    let err = images
        .build_with_package(&ctx, &work.path().join("missing.tar"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PackageNotFound);
    assert_eq!(images.record("gtest").unwrap().status, ImageStatus::Failed);
    assert!(images.list(&ctx).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn delete_twice_succeeds() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let mut images = ImageLifecycle::new(local_hypervisor(home.path()).await, Arc::new(FakeBuilder));
    let mut ctx = context(work.path(), "gtest");
    ctx.config.source = Some(ImageSource::Program(work.path().join("app")));

    images.build_and_publish(&ctx, None).await.unwrap();
    images.delete(&ctx, "gtest").await.unwrap();
    images.delete(&ctx, "gtest").await.unwrap();
    assert_eq!(images.record("gtest").unwrap().status, ImageStatus::Deleted);
    assert!(images.list(&ctx).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn unreachable_backend_degrades_listing() {
    let mock = MockProvider::new();
    let mut provider = mock.clone();
    provider.initialize().await.unwrap();
    let images = ImageLifecycle::new(Box::new(provider), Arc::new(FakeBuilder));

    mock.fail_next(
        "list_images",
        ProviderError::BackendUnreachable("connection reset".into()),
    );
    let listing = images.list(&Context::default()).await.unwrap();
    assert!(listing.items.is_empty());
    assert_eq!(
        listing.warning.map(|w| w.kind()),
        Some(ErrorKind::BackendUnreachable)
    );
}

#[tokio::test]
async fn resize_capability_gap_is_distinguishable() {
    let mock = MockProvider::new();
    let mut provider = mock.clone();
    provider.initialize().await.unwrap();
    let mut images = ImageLifecycle::new(Box::new(provider), Arc::new(FakeBuilder));

    let err = images
        .resize(&Context::default(), "gtest", "1G")
        .await
        .unwrap_err();
    assert!(err.is_capability_gap());
    assert!(!err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
}

#[tokio::test]
async fn failed_publish_can_be_retried() {
    let mock = MockProvider::new();
    let mut provider = mock.clone();
    provider.initialize().await.unwrap();
    let mut images = ImageLifecycle::new(Box::new(provider), Arc::new(FakeBuilder));
    let work = tempfile::tempdir().unwrap();
    let ctx = context(work.path(), "gtest");
    let pkg = package(work.path());

    images.build_with_package(&ctx, &pkg).await.unwrap();
    let staged = images.stage(&ctx).await.unwrap();
    assert!(matches!(staged, StagedImage::Local(_)));

    mock.fail_next("create_image", ProviderError::QuotaExceeded("images: 10/10".into()));
    let err = images.publish(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert_eq!(images.record("gtest").unwrap().status, ImageStatus::Staged);

    images.publish(&ctx).await.unwrap();
    assert_eq!(images.record("gtest").unwrap().status, ImageStatus::Published);
}

#[tokio::test]
async fn rebuild_after_publish_starts_a_fresh_record() {
    let mock = MockProvider::new();
    let mut provider = mock.clone();
    provider.initialize().await.unwrap();
    let mut images = ImageLifecycle::new(Box::new(provider), Arc::new(FakeBuilder));
    let work = tempfile::tempdir().unwrap();
    let ctx = context(work.path(), "gtest");
    let pkg = package(work.path());

    images.build_and_publish(&ctx, Some(&pkg)).await.unwrap();
    let artifact = images.build_with_package(&ctx, &pkg).await.unwrap();
    assert!(artifact.exists());

    let record = images.record("gtest").unwrap();
    assert_eq!(record.status, ImageStatus::Built);
    let path: Vec<ImageStatus> = record.history.iter().map(|t| t.to).collect();
    assert_eq!(path, vec![ImageStatus::Building, ImageStatus::Built]);

    // The catalog still holds the first one.
    let err = images.publish(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(images.record("gtest").unwrap().status, ImageStatus::Staged);

    images.delete(&ctx, "gtest").await.unwrap();
    images.build_and_publish(&ctx, Some(&pkg)).await.unwrap();
    assert_eq!(images.record("gtest").unwrap().status, ImageStatus::Published);
}
