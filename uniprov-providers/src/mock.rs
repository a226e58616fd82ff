//! In-memory backend for tests and local dry runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uniprov_common::{
    Context, Image, ImageStatus, Instance, InstanceStatus, ProviderError, Result,
};

use crate::{InstanceLogs, LogTail, Provider, StagedImage};

pub const BACKEND_NAME: &str = "mock";

#[derive(Default)]
struct MockState {
    initialized: bool,
    // Keyed by name so listings come out ordered.
    images: BTreeMap<String, Image>,
    instances: BTreeMap<String, Instance>,
    ever_started: HashSet<String>,
    consoles: HashMap<String, String>,
    faults: HashMap<&'static str, ProviderError>,
    calls: Vec<String>,
}

/// Clones share one in-memory backend, like two sessions against one cloud.
#[derive(Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
    image_quota: Option<usize>,
    fail_initialize: Option<ProviderError>,
    boot_on_create: bool,
    log_poll_interval: Duration,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            image_quota: None,
            fail_initialize: None,
            boot_on_create: false,
            log_poll_interval: Duration::from_millis(20),
        }
    }

    /// Reject image creation once the catalog holds `max` images.
    pub fn with_image_quota(mut self, max: usize) -> Self {
        self.image_quota = Some(max);
        self
    }

    pub fn with_failing_initialize(mut self, err: ProviderError) -> Self {
        self.fail_initialize = Some(err);
        self
    }

    /// Boot instances as soon as they are created, the way Nova does. The
    /// create reply still reports `created`.
    pub fn with_boot_on_create(mut self) -> Self {
        self.boot_on_create = true;
        self
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    /// Make the next call to `operation` fail with `err`.
    pub fn fail_next(&self, operation: &'static str, err: ProviderError) {
        self.lock().faults.insert(operation, err);
    }

    /// Append text to an instance console.
    pub fn push_console(&self, name: &str, text: &str) {
        self.lock()
            .consoles
            .entry(name.to_string())
            .or_default()
            .push_str(text);
    }

    /// Operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call, then apply session and fault checks.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if !state.initialized {
            return Err(ProviderError::not_initialized(BACKEND_NAME));
        }
        if let Some(err) = state.faults.remove(operation) {
            tracing::debug!("[mock] injected failure for {}: {}", operation, err);
            return Err(err);
        }
        Ok(state)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn initialize(&mut self) -> Result<()> {
        if let Some(err) = self.fail_initialize.clone() {
            return Err(err);
        }
        self.lock().initialized = true;
        tracing::info!("✅ [mock] initialized");
        Ok(())
    }

    async fn create_image(&self, ctx: &Context, staged: &StagedImage) -> Result<Image> {
        let name = ctx.config.name.clone();
        if name.trim().is_empty() {
            return Err(ProviderError::InvalidArgument("image name is empty".into()));
        }
        let size_bytes = match staged {
            StagedImage::Local(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
            StagedImage::Object(object) => Some(object.size_bytes),
        };

        let mut state = self.enter("create_image")?;
        if state.images.contains_key(&name) {
            return Err(ProviderError::AlreadyExists(format!("image '{}'", name)));
        }
        if let Some(max) = self.image_quota {
            if state.images.len() >= max {
                return Err(ProviderError::QuotaExceeded(format!(
                    "image quota of {} reached",
                    max
                )));
            }
        }

        let image = Image {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.clone(),
            status: ImageStatus::Published,
            created_at: Some(Utc::now()),
            size_bytes,
            disk_format: ctx.config.disk_format,
            visibility: ctx.config.visibility,
        };
        state.images.insert(name, image.clone());
        Ok(image)
    }

    async fn list_images(&self, _ctx: &Context) -> Result<Vec<Image>> {
        let state = self.enter("list_images")?;
        Ok(state.images.values().cloned().collect())
    }

    async fn delete_image(&self, _ctx: &Context, name: &str) -> Result<()> {
        let mut state = self.enter("delete_image")?;
        let Some(image) = state.images.get(name) else {
            return Ok(());
        };
        let in_use = state
            .instances
            .values()
            .any(|i| i.image_id.as_deref() == Some(image.id.as_str()));
        if in_use {
            return Err(ProviderError::ImageInUse(name.to_string()));
        }
        state.images.remove(name);
        Ok(())
    }

    async fn create_instance(&self, ctx: &Context) -> Result<Instance> {
        let name = ctx.instance_name().to_string();
        if name.trim().is_empty() {
            return Err(ProviderError::InvalidArgument("instance name is empty".into()));
        }

        let mut state = self.enter("create_instance")?;
        if state.instances.contains_key(&name) {
            return Err(ProviderError::AlreadyExists(format!("instance '{}'", name)));
        }
        let image = state
            .images
            .get(ctx.image_name())
            .filter(|i| i.status == ImageStatus::Published)
            .ok_or_else(|| ProviderError::ImageNotFound(ctx.image_name().to_string()))?;

        let instance = Instance {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.clone(),
            status: InstanceStatus::Created,
            image_id: Some(image.id.clone()),
            flavor: ctx.run_config.flavor.clone(),
            ip_addresses: vec![format!("10.0.0.{}", state.instances.len() + 2)],
            created_at: Some(Utc::now()),
        };
        if self.boot_on_create {
            let mut booted = instance.clone();
            booted.status = InstanceStatus::Running;
            state.instances.insert(name.clone(), booted);
            state.ever_started.insert(name.clone());
            state
                .consoles
                .entry(name.clone())
                .or_default()
                .push_str(&format!("booting {}\n", name));
        } else {
            state.instances.insert(name, instance.clone());
        }
        Ok(instance)
    }

    async fn list_instances(&self, _ctx: &Context) -> Result<Vec<Instance>> {
        let state = self.enter("list_instances")?;
        Ok(state.instances.values().cloned().collect())
    }

    async fn delete_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let mut state = self.enter("delete_instance")?;
        state.instances.remove(name);
        state.ever_started.remove(name);
        state.consoles.remove(name);
        Ok(())
    }

    async fn start_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let mut state = self.enter("start_instance")?;
        let Some(instance) = state.instances.get_mut(name) else {
            return Err(ProviderError::InstanceNotFound(name.to_string()));
        };
        match instance.status {
            InstanceStatus::Running => return Ok(()),
            InstanceStatus::Failed | InstanceStatus::Deleted => {
                return Err(ProviderError::InvalidState(format!(
                    "instance '{}' is {}",
                    name, instance.status
                )))
            }
            _ => instance.status = InstanceStatus::Running,
        }
        state.ever_started.insert(name.to_string());
        state
            .consoles
            .entry(name.to_string())
            .or_default()
            .push_str(&format!("booting {}\n", name));
        Ok(())
    }

    async fn stop_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let mut state = self.enter("stop_instance")?;
        if let Some(instance) = state.instances.get_mut(name) {
            if instance.status == InstanceStatus::Running {
                instance.status = InstanceStatus::Stopped;
            }
        }
        Ok(())
    }

    async fn get_instance_logs(
        &self,
        _ctx: &Context,
        name: &str,
        watch: bool,
    ) -> Result<InstanceLogs> {
        let snapshot = {
            let state = self.enter("get_instance_logs")?;
            if !state.instances.contains_key(name) {
                return Err(ProviderError::InstanceNotFound(name.to_string()));
            }
            if !state.ever_started.contains(name) {
                return Err(ProviderError::LogsNotYetAvailable(format!(
                    "instance '{}' has never run",
                    name
                )));
            }
            state.consoles.get(name).cloned().unwrap_or_default()
        };

        if !watch {
            return Ok(InstanceLogs::Snapshot(snapshot));
        }
        let shared = self.state.clone();
        let name = name.to_string();
        let tail = LogTail::spawn(self.log_poll_interval, move || {
            let console = {
                let state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if state.instances.contains_key(&name) {
                    Ok(state.consoles.get(&name).cloned().unwrap_or_default())
                } else {
                    Err(ProviderError::InstanceNotFound(name.clone()))
                }
            };
            async move { console }
        });
        Ok(InstanceLogs::Follow(tail))
    }
}
