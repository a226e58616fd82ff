//! Sequences build, customize, stage and publish for images on one backend.
//!
//! Each image name handled by this orchestrator has an [`ImageRecord`] whose
//! status follows `none -> building -> built -> staged -> published`, with
//! `failed` as the terminal outcome of a failed build and `deleted` reachable
//! from any non-terminal state. Records are local to one invocation; the
//! backend catalog is the source of truth for published images.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uniprov_common::{Context, Image, ImageStatus, ProviderError, Result};
use uniprov_providers::{ImageBuilder, Provider, StagedImage};

use crate::logger::ActionLog;
use crate::state_machine::{self, Transition};
use crate::{with_deadline, Listing};

#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    pub name: String,
    pub status: ImageStatus,
    pub artifact: Option<PathBuf>,
    #[serde(skip)]
    pub staged: Option<StagedImage>,
    pub image_id: Option<String>,
    pub history: Vec<Transition<ImageStatus>>,
}

impl ImageRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ImageStatus::None,
            artifact: None,
            staged: None,
            image_id: None,
            history: Vec::new(),
        }
    }

    fn advance(&mut self, to: ImageStatus, reason: &str) -> Result<()> {
        state_machine::advance_image(&self.name, &mut self.status, &mut self.history, to, reason)
    }
}

pub struct ImageLifecycle {
    provider: Box<dyn Provider>,
    builder: Arc<dyn ImageBuilder>,
    records: HashMap<String, ImageRecord>,
    log: ActionLog,
    deadline: Option<Duration>,
}

impl ImageLifecycle {
    /// `provider` must already be initialized.
    pub fn new(provider: Box<dyn Provider>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            provider,
            builder,
            records: HashMap::new(),
            log: ActionLog::new(),
            deadline: None,
        }
    }

    /// Bound every backend call (not the build itself) by `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn record(&self, name: &str) -> Option<&ImageRecord> {
        self.records.get(name)
    }

    pub fn action_log(&self) -> &ActionLog {
        &self.log
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.deadline {
            Some(deadline) => with_deadline(deadline, fut).await,
            None => fut.await,
        }
    }

    /// Start a fresh record for a build, replacing any earlier one. A name
    /// already in the catalog is refused later by `publish`.
    fn begin_build(&mut self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(ProviderError::InvalidArgument("image name is empty".into()));
        }
        if let Some(previous) = self.records.get(name) {
            tracing::debug!("[image_lifecycle] rebuilding {} (was {})", name, previous.status);
        }
        let mut record = ImageRecord::new(name);
        record.advance(ImageStatus::Building, "build requested")?;
        self.records.insert(name.to_string(), record);
        Ok(())
    }

    fn finish_build(&mut self, name: &str, built: &Result<PathBuf>) -> Result<()> {
        let record = self.record_mut(name)?;
        match built {
            Ok(artifact) => {
                record.artifact = Some(artifact.clone());
                record.advance(ImageStatus::Built, "artifact produced")
            }
            Err(e) => record.advance(ImageStatus::Failed, &e.to_string()),
        }
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut ImageRecord> {
        self.records
            .get_mut(name)
            .ok_or_else(|| ProviderError::InvalidState(format!("image '{}' has not been built", name)))
    }

    /// Run the builder then the backend's customize hook. On failure the
    /// record is marked failed and nothing reaches the catalog.
    pub async fn build(&mut self, ctx: &Context) -> Result<PathBuf> {
        let name = ctx.config.name.clone();
        self.begin_build(&name)?;

        let log_id = self.log.log_event_with_metadata(
            "IMAGE_BUILD",
            "in_progress",
            &name,
            None,
            Some(json!({ "backend": self.provider.name(), "source": ctx.config.source })),
        );
        let started = Instant::now();
        let built = self.provider.build_image(self.builder.as_ref(), ctx).await;
        self.log.finish(log_id, started, &built);

        self.finish_build(&name, &built)?;
        built
    }

    pub async fn build_with_package(&mut self, ctx: &Context, package: &Path) -> Result<PathBuf> {
        let name = ctx.config.name.clone();
        self.begin_build(&name)?;

        let log_id = self.log.log_event_with_metadata(
            "IMAGE_BUILD",
            "in_progress",
            &name,
            None,
            Some(json!({ "backend": self.provider.name(), "package": package })),
        );
        let started = Instant::now();
        let built = self
            .provider
            .build_image_with_package(self.builder.as_ref(), ctx, package)
            .await;
        self.log.finish(log_id, started, &built);

        self.finish_build(&name, &built)?;
        built
    }

    /// Move the built artifact into backend storage. A failure leaves the
    /// record `built` so staging can be retried.
    pub async fn stage(&mut self, ctx: &Context) -> Result<StagedImage> {
        let name = ctx.config.name.clone();
        let artifact = {
            let record = self.record_mut(&name)?;
            match (&record.status, &record.artifact) {
                (ImageStatus::Built, Some(artifact)) => artifact.clone(),
                (status, _) => {
                    return Err(ProviderError::InvalidState(format!(
                        "image '{}' is {}, expected built",
                        name, status
                    )))
                }
            }
        };

        let log_id = self.log.log_event("IMAGE_STAGE", "in_progress", &name, None);
        let started = Instant::now();
        let staged = self.bounded(self.provider.stage_image(ctx, &artifact)).await;
        self.log.finish(log_id, started, &staged);
        let staged = staged?;

        let record = self.record_mut(&name)?;
        record.staged = Some(staged.clone());
        let reason = match &staged {
            StagedImage::Local(_) => "direct registration".to_string(),
            StagedImage::Object(object) => format!("uploaded to {}/{}", object.container, object.key),
        };
        record.advance(ImageStatus::Staged, &reason)?;
        Ok(staged)
    }

    /// Register the image in the backend catalog, staging first when the
    /// record is only built. Publishing twice is rejected with
    /// `AlreadyExists`.
    pub async fn publish(&mut self, ctx: &Context) -> Result<Image> {
        let name = ctx.config.name.clone();
        let status = self.record_mut(&name)?.status;
        match status {
            ImageStatus::Built => {
                self.stage(ctx).await?;
            }
            ImageStatus::Staged => {}
            ImageStatus::Published => {
                return Err(ProviderError::AlreadyExists(format!("image '{}'", name)))
            }
            other => {
                return Err(ProviderError::InvalidState(format!(
                    "image '{}' is {}, expected built or staged",
                    name, other
                )))
            }
        }

        let staged = self
            .record_mut(&name)?
            .staged
            .clone()
            .ok_or_else(|| ProviderError::InvalidState(format!("image '{}' is not staged", name)))?;

        let log_id = self.log.log_event_with_metadata(
            "IMAGE_PUBLISH",
            "in_progress",
            &name,
            None,
            Some(json!({
                "backend": self.provider.name(),
                "disk_format": ctx.config.disk_format.as_str(),
                "visibility": ctx.config.visibility.as_str(),
            })),
        );
        let started = Instant::now();
        let created = self.bounded(self.provider.create_image(ctx, &staged)).await;
        self.log.finish(log_id, started, &created);
        let image = created?;

        let record = self.record_mut(&name)?;
        record.image_id = Some(image.id.clone());
        record.advance(ImageStatus::Published, "registered in catalog")?;
        Ok(image)
    }

    /// Build (from `package` when given) then stage and publish.
    pub async fn build_and_publish(&mut self, ctx: &Context, package: Option<&Path>) -> Result<Image> {
        match package {
            Some(package) => self.build_with_package(ctx, package).await?,
            None => self.build(ctx).await?,
        };
        self.publish(ctx).await
    }

    pub async fn list(&self, ctx: &Context) -> Result<Listing<Image>> {
        let log_id = self.log.log_event("IMAGE_LIST", "in_progress", self.provider.name(), None);
        let started = Instant::now();
        let listed = self.bounded(self.provider.list_images(ctx)).await;
        self.log.finish(log_id, started, &listed);
        Listing::from_result(listed)
    }

    /// Remove `name` from the catalog. Deleting an absent image succeeds.
    pub async fn delete(&mut self, ctx: &Context, name: &str) -> Result<()> {
        let log_id = self.log.log_event("IMAGE_DELETE", "in_progress", name, None);
        let started = Instant::now();
        let deleted = self.bounded(self.provider.delete_image(ctx, name)).await;
        self.log.finish(log_id, started, &deleted);
        deleted?;

        if let Some(record) = self.records.get_mut(name) {
            if !record.status.is_terminal() {
                record.advance(ImageStatus::Deleted, "deleted")?;
            }
        }
        Ok(())
    }

    /// Pass-through; backends without in-place resize report
    /// `UnsupportedOperation`.
    pub async fn resize(&mut self, ctx: &Context, name: &str, size: &str) -> Result<()> {
        let log_id = self.log.log_event_with_metadata(
            "IMAGE_RESIZE",
            "in_progress",
            name,
            None,
            Some(json!({ "size": size })),
        );
        let started = Instant::now();
        let resized = self.bounded(self.provider.resize_image(ctx, name, size)).await;
        self.log.finish(log_id, started, &resized);
        resized
    }
}
