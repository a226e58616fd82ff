//! Sequences create, start/stop, logs and delete for instances on one backend.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use uniprov_common::{Context, ImageStatus, Instance, InstanceStatus, ProviderError, Result};
use uniprov_providers::{InstanceLogs, Provider};

use crate::logger::ActionLog;
use crate::state_machine::{self, Transition};
use crate::{with_deadline, Listing};

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub name: String,
    pub status: InstanceStatus,
    pub image: String,
    pub instance_id: Option<String>,
    /// Whether the instance reached `running` at least once.
    pub ever_running: bool,
    pub history: Vec<Transition<InstanceStatus>>,
}

impl InstanceRecord {
    fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            status: InstanceStatus::None,
            image: image.to_string(),
            instance_id: None,
            ever_running: false,
            history: Vec::new(),
        }
    }

    /// Record for an instance this orchestrator did not create.
    fn observed(instance: &Instance) -> Self {
        Self {
            name: instance.name.clone(),
            status: instance.status,
            image: instance.image_id.clone().unwrap_or_default(),
            instance_id: Some(instance.id.clone()),
            ever_running: matches!(instance.status, InstanceStatus::Running | InstanceStatus::Stopped),
            history: Vec::new(),
        }
    }

    fn advance(&mut self, to: InstanceStatus, reason: &str) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        state_machine::advance_instance(&self.name, &mut self.status, &mut self.history, to, reason)?;
        if to == InstanceStatus::Running {
            self.ever_running = true;
        }
        Ok(())
    }

    /// Take the status the backend reports. The backend may skip states
    /// this record never saw.
    fn observe(&mut self, status: InstanceStatus) {
        if let Err(e) = self.advance(status, "observed") {
            tracing::warn!("⚠️ [instance_lifecycle] {}", e);
            self.status = status;
            if status == InstanceStatus::Running {
                self.ever_running = true;
            }
        }
    }
}

pub struct InstanceLifecycle {
    provider: Box<dyn Provider>,
    records: HashMap<String, InstanceRecord>,
    log: ActionLog,
    deadline: Option<Duration>,
    poll_interval: Duration,
}

impl InstanceLifecycle {
    /// `provider` must already be initialized.
    pub fn new(provider: Box<dyn Provider>) -> Self {
        Self {
            provider,
            records: HashMap::new(),
            log: ActionLog::new(),
            deadline: None,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn record(&self, name: &str) -> Option<&InstanceRecord> {
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

    async fn find(&self, ctx: &Context, name: &str) -> Result<Option<Instance>> {
        let instances = self.bounded(self.provider.list_instances(ctx)).await?;
        Ok(instances.into_iter().find(|i| i.name == name))
    }

    /// Track `name`, adopting the backend's view when this orchestrator has
    /// no record yet.
    async fn ensure_record(&mut self, ctx: &Context, name: &str) -> Result<bool> {
        if self.records.contains_key(name) {
            return Ok(true);
        }
        match self.find(ctx, name).await? {
            Some(instance) => {
                self.records
                    .insert(name.to_string(), InstanceRecord::observed(&instance));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bring a tracked record in line with the backend before acting on it.
    /// Backends that boot on create report `running` without a start call.
    async fn reconcile(&mut self, ctx: &Context, name: &str) -> Result<()> {
        if !self.records.contains_key(name) {
            return Ok(());
        }
        if let Some(instance) = self.find(ctx, name).await? {
            if let Some(record) = self.records.get_mut(name) {
                record.observe(instance.status);
            }
        }
        Ok(())
    }

    /// Create the instance described by `ctx.run_config`. The image must be
    /// published on this backend, otherwise `ImageNotFound`.
    pub async fn create(&mut self, ctx: &Context) -> Result<Instance> {
        let name = ctx.instance_name().to_string();
        let image_name = ctx.image_name().to_string();

        let log_id = self.log.log_event_with_metadata(
            "INSTANCE_CREATE",
            "in_progress",
            &name,
            None,
            Some(json!({
                "backend": self.provider.name(),
                "image": image_name,
                "flavor": ctx.run_config.flavor,
            })),
        );
        let started = Instant::now();
        let created = self.create_checked(ctx, &image_name).await;
        self.log.finish(log_id, started, &created);
        let instance = created?;

        let mut record = InstanceRecord::new(&name, &image_name);
        record.instance_id = Some(instance.id.clone());
        record.advance(InstanceStatus::Created, "created")?;
        self.records.insert(name, record);
        Ok(instance)
    }

    async fn create_checked(&self, ctx: &Context, image_name: &str) -> Result<Instance> {
        let images = self.bounded(self.provider.list_images(ctx)).await?;
        let published = images
            .iter()
            .any(|i| i.name == image_name && i.status == ImageStatus::Published);
        if !published {
            return Err(ProviderError::ImageNotFound(format!(
                "no published image '{}' on backend '{}'",
                image_name,
                self.provider.name()
            )));
        }
        self.bounded(self.provider.create_instance(ctx)).await
    }

    pub async fn start(&mut self, ctx: &Context, name: &str) -> Result<()> {
        let log_id = self.log.log_event("INSTANCE_START", "in_progress", name, None);
        let started = Instant::now();
        let res = self.bounded(self.provider.start_instance(ctx, name)).await;
        self.log.finish(log_id, started, &res);
        res?;

        if self.ensure_record(ctx, name).await? {
            if let Some(record) = self.records.get_mut(name) {
                record.advance(InstanceStatus::Running, "start")?;
            }
        }
        Ok(())
    }

    /// Stopping an absent or already-stopped instance succeeds. A
    /// never-started instance stays `created`.
    pub async fn stop(&mut self, ctx: &Context, name: &str) -> Result<()> {
        self.reconcile(ctx, name).await?;
        let log_id = self.log.log_event("INSTANCE_STOP", "in_progress", name, None);
        let started = Instant::now();
        let res = self.bounded(self.provider.stop_instance(ctx, name)).await;
        self.log.finish(log_id, started, &res);
        res?;

        if self.ensure_record(ctx, name).await? {
            if let Some(record) = self.records.get_mut(name) {
                if record.status == InstanceStatus::Running {
                    record.advance(InstanceStatus::Stopped, "stop")?;
                }
            }
        }
        Ok(())
    }

    /// Console output. Before the instance first runs this is
    /// `LogsNotYetAvailable`; callers poll or use `watch`.
    pub async fn logs(&self, ctx: &Context, name: &str, watch: bool) -> Result<InstanceLogs> {
        let res = self
            .bounded(self.provider.get_instance_logs(ctx, name, watch))
            .await;
        match &res {
            Ok(_) => self.log.log_quick("INSTANCE_LOGS", name, watch.then_some("watch")),
            Err(e) if e.kind() == uniprov_common::ErrorKind::LogsNotYetAvailable => {
                tracing::info!("ℹ️ [instance_lifecycle] logs for {} not available yet", name);
            }
            Err(e) => {
                let message = e.to_string();
                let log_id = self.log.log_event("INSTANCE_LOGS", "in_progress", name, None);
                self.log.log_event_complete(log_id, "failed", 0, Some(&message));
            }
        }
        res
    }

    /// Deleting an absent instance succeeds.
    pub async fn delete(&mut self, ctx: &Context, name: &str) -> Result<()> {
        let log_id = self.log.log_event("INSTANCE_DELETE", "in_progress", name, None);
        let started = Instant::now();
        let res = self.bounded(self.provider.delete_instance(ctx, name)).await;
        self.log.finish(log_id, started, &res);
        res?;

        if let Some(record) = self.records.get_mut(name) {
            record.advance(InstanceStatus::Deleted, "deleted")?;
        }
        Ok(())
    }

    pub async fn list(&self, ctx: &Context) -> Result<Listing<Instance>> {
        let log_id = self.log.log_event("INSTANCE_LIST", "in_progress", self.provider.name(), None);
        let started = Instant::now();
        let listed = self.bounded(self.provider.list_instances(ctx)).await;
        self.log.finish(log_id, started, &listed);
        Listing::from_result(listed)
    }

    /// Poll the backend until `name` reports `target`. Elapsed `deadline` is
    /// `BackendUnreachable`; an instance that fails meanwhile is
    /// `InvalidState`.
    pub async fn wait_for_status(
        &mut self,
        ctx: &Context,
        name: &str,
        target: InstanceStatus,
        deadline: Duration,
    ) -> Result<Instance> {
        let poll_interval = self.poll_interval;
        let provider = self.provider.as_ref();
        let polled = with_deadline(deadline, async {
            loop {
                let found = provider
                    .list_instances(ctx)
                    .await?
                    .into_iter()
                    .find(|i| i.name == name);
                match found {
                    Some(instance) if instance.status == target => return Ok(instance),
                    Some(instance) if instance.status == InstanceStatus::Failed => {
                        return Err(ProviderError::InvalidState(format!(
                            "instance '{}' failed while waiting for {}",
                            name, target
                        )))
                    }
                    None if target == InstanceStatus::Deleted => {
                        return Ok(Instance {
                            id: String::new(),
                            name: name.to_string(),
                            status: InstanceStatus::Deleted,
                            image_id: None,
                            flavor: None,
                            ip_addresses: vec![],
                            created_at: None,
                        })
                    }
                    None => return Err(ProviderError::InstanceNotFound(name.to_string())),
                    Some(instance) => {
                        tracing::debug!(
                            "[instance_lifecycle] {} is {}, waiting for {}",
                            name,
                            instance.status,
                            target
                        );
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
        .await;

        let instance = polled?;
        match self.records.get_mut(name) {
            Some(record) => record.observe(instance.status),
            None => {
                self.records
                    .insert(name.to_string(), InstanceRecord::observed(&instance));
            }
        }
        Ok(instance)
    }
}
