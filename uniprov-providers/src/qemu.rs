//! Local hypervisor backend.
//!
//! State lives under a single root directory:
//!
//! ```text
//! <home>/images/<name>.img         catalog image
//! <home>/images/<name>.json        catalog entry
//! <home>/instances/<name>/instance.json
//! <home>/instances/<name>/serial.log
//! ```
//!
//! Staging is a no-op: the artifact is copied straight into the catalog on
//! publish. Guests boot the catalog image with `snapshot=on`, so an image
//! stays in use for as long as an instance references it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use uniprov_common::{
    Context, DiskFormat, Image, ImageStatus, Instance, InstanceStatus, NetworkAdapter,
    ProviderError, Result, Visibility,
};

use crate::hypervisor::{self, Hypervisor, LaunchSpec, QemuHypervisor, VmProcess};
use crate::{InstanceLogs, LogTail, Provider, StagedImage};

pub const BACKEND_NAME: &str = "local-hypervisor";

enum Session {
    Uninitialized,
    Ready { home: PathBuf },
    Failed(String),
}

pub struct QemuProvider {
    home_override: Option<PathBuf>,
    session: Session,
    hypervisor: Box<dyn Hypervisor>,
    log_poll_interval: Duration,
    processes: Mutex<HashMap<String, Box<dyn VmProcess>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageManifest {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    size_bytes: u64,
    disk_format: DiskFormat,
    visibility: Visibility,
    file: PathBuf,
}

impl ImageManifest {
    fn to_image(&self) -> Image {
        Image {
            id: self.id.clone(),
            name: self.name.clone(),
            status: ImageStatus::Published,
            created_at: Some(self.created_at),
            size_bytes: Some(self.size_bytes),
            disk_format: self.disk_format,
            visibility: self.visibility,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceManifest {
    id: String,
    name: String,
    image_id: String,
    image_name: String,
    image_file: PathBuf,
    disk_format: DiskFormat,
    status: InstanceStatus,
    ever_started: bool,
    pid: Option<u32>,
    flavor: Option<String>,
    memory_mb: u32,
    cpus: u32,
    adapter: NetworkAdapter,
    tap: Option<String>,
    created_at: DateTime<Utc>,
}

impl InstanceManifest {
    fn to_instance(&self) -> Instance {
        Instance {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            image_id: Some(self.image_id.clone()),
            flavor: self.flavor.clone(),
            ip_addresses: vec![],
            created_at: Some(self.created_at),
        }
    }
}

impl Default for QemuProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl QemuProvider {
    /// State root is resolved during `initialize` from `UNIPROV_HOME`, then
    /// `$HOME/.uniprov`.
    pub fn new() -> Self {
        Self {
            home_override: None,
            session: Session::Uninitialized,
            hypervisor: Box::new(QemuHypervisor::new(hypervisor::QEMU_X86_64)),
            log_poll_interval: Duration::from_secs(1),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_override = Some(home.into());
        self
    }

    pub fn with_hypervisor(mut self, hypervisor: Box<dyn Hypervisor>) -> Self {
        self.hypervisor = hypervisor;
        self
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    fn resolve_home(&self) -> Option<PathBuf> {
        if let Some(home) = &self.home_override {
            return Some(home.clone());
        }
        if let Ok(home) = std::env::var("UNIPROV_HOME") {
            if !home.trim().is_empty() {
                return Some(PathBuf::from(home.trim()));
            }
        }
        std::env::var("HOME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .map(|h| PathBuf::from(h).join(".uniprov"))
    }

    fn home(&self) -> Result<&Path> {
        match &self.session {
            Session::Ready { home } => Ok(home),
            Session::Failed(reason) => Err(ProviderError::Authentication(format!(
                "backend '{}' failed to initialize: {}",
                BACKEND_NAME, reason
            ))),
            Session::Uninitialized => Err(ProviderError::not_initialized(BACKEND_NAME)),
        }
    }

    async fn load_image(&self, home: &Path, name: &str) -> Result<Option<ImageManifest>> {
        validate_name("image", name)?;
        read_json(&image_manifest_path(home, name)).await
    }

    async fn load_instance(&self, home: &Path, name: &str) -> Result<Option<InstanceManifest>> {
        validate_name("instance", name)?;
        read_json(&instance_dir(home, name).join("instance.json")).await
    }

    async fn save_instance(&self, home: &Path, manifest: &InstanceManifest) -> Result<()> {
        write_json(&instance_dir(home, &manifest.name).join("instance.json"), manifest).await
    }

    async fn all_instances(&self, home: &Path) -> Result<Vec<InstanceManifest>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(home.join("instances")).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join("instance.json");
            if let Some(manifest) = read_json::<InstanceManifest>(&path).await? {
                out.push(manifest);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Downgrade a `running` manifest whose guest has exited.
    async fn refresh(&self, home: &Path, manifest: &mut InstanceManifest) -> Result<()> {
        if manifest.status != InstanceStatus::Running {
            return Ok(());
        }
        let tracked = self
            .processes
            .lock()
            .await
            .get_mut(&manifest.name)
            .map(|process| process.is_running());
        let alive = match (tracked, manifest.pid) {
            (Some(running), _) => running,
            (None, Some(pid)) => {
                hypervisor::pid_is_guest(pid, &serial_log(home, &manifest.name)).await
            }
            (None, None) => false,
        };
        if !alive {
            tracing::info!("ℹ️ [qemu] guest {} exited on its own", manifest.name);
            self.processes.lock().await.remove(&manifest.name);
            manifest.status = InstanceStatus::Stopped;
            manifest.pid = None;
            self.save_instance(home, manifest).await?;
        }
        Ok(())
    }

    async fn halt(&self, home: &Path, manifest: &mut InstanceManifest) -> Result<()> {
        let process = self.processes.lock().await.remove(&manifest.name);
        match process {
            Some(mut process) => process.stop().await?,
            None => {
                if let Some(pid) = manifest.pid {
                    hypervisor::terminate_pid(pid, &serial_log(home, &manifest.name)).await?;
                }
            }
        }
        manifest.status = InstanceStatus::Stopped;
        manifest.pid = None;
        Ok(())
    }
}

#[async_trait]
impl Provider for QemuProvider {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn initialize(&mut self) -> Result<()> {
        let Some(home) = self.resolve_home() else {
            let reason = "neither UNIPROV_HOME nor HOME is set".to_string();
            self.session = Session::Failed(reason.clone());
            return Err(ProviderError::Io(reason));
        };

        for dir in [home.join("images"), home.join("instances")] {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                let reason = format!("cannot create {}: {}", dir.display(), e);
                self.session = Session::Failed(reason.clone());
                return Err(ProviderError::Io(reason));
            }
        }

        tracing::info!("✅ [qemu] state root {}", home.display());
        self.session = Session::Ready { home };
        Ok(())
    }

    async fn create_image(&self, ctx: &Context, staged: &StagedImage) -> Result<Image> {
        let home = self.home()?;
        let name = ctx.config.name.as_str();
        validate_name("image", name)?;

        let StagedImage::Local(artifact) = staged else {
            return Err(ProviderError::PublishFailed(format!(
                "backend '{}' can only register local artifacts",
                BACKEND_NAME
            )));
        };

        if self.load_image(home, name).await?.is_some() {
            return Err(ProviderError::AlreadyExists(format!("image '{}'", name)));
        }

        let file = image_file_path(home, name);
        let size_bytes = match tokio::fs::copy(artifact, &file).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&file).await;
                return Err(ProviderError::PublishFailed(format!(
                    "copy {} into catalog: {}",
                    artifact.display(),
                    e
                )));
            }
        };

        let manifest = ImageManifest {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            size_bytes,
            disk_format: ctx.config.disk_format,
            visibility: ctx.config.visibility,
            file,
        };
        if let Err(e) = write_json(&image_manifest_path(home, name), &manifest).await {
            let _ = tokio::fs::remove_file(&manifest.file).await;
            return Err(ProviderError::PublishFailed(e.to_string()));
        }

        tracing::info!(
            "✅ [qemu] published image {} ({} bytes, id={})",
            name,
            size_bytes,
            manifest.id
        );
        Ok(manifest.to_image())
    }

    async fn list_images(&self, _ctx: &Context) -> Result<Vec<Image>> {
        let home = self.home()?;
        let mut entries = tokio::fs::read_dir(home.join("images")).await?;
        let mut images = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(manifest) = read_json::<ImageManifest>(&path).await? {
                images.push(manifest.to_image());
            }
        }
        images.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(images)
    }

    async fn delete_image(&self, _ctx: &Context, name: &str) -> Result<()> {
        let home = self.home()?;
        let Some(manifest) = self.load_image(home, name).await? else {
            tracing::debug!("[qemu] delete_image: {} already absent", name);
            return Ok(());
        };

        let users: Vec<String> = self
            .all_instances(home)
            .await?
            .into_iter()
            .filter(|i| i.image_name == name && i.status != InstanceStatus::Deleted)
            .map(|i| i.name)
            .collect();
        if !users.is_empty() {
            return Err(ProviderError::ImageInUse(format!(
                "image '{}' is used by {}",
                name,
                users.join(", ")
            )));
        }

        remove_if_present(&manifest.file).await?;
        remove_if_present(&image_manifest_path(home, name)).await?;
        tracing::info!("✅ [qemu] deleted image {}", name);
        Ok(())
    }

    async fn resize_image(&self, _ctx: &Context, name: &str, size: &str) -> Result<()> {
        let home = self.home()?;
        let new_size = parse_size(size)?;
        let Some(mut manifest) = self.load_image(home, name).await? else {
            return Err(ProviderError::ImageNotFound(name.to_string()));
        };
        if manifest.disk_format != DiskFormat::Raw {
            return Err(ProviderError::UnsupportedOperation(format!(
                "in-place resize of {} images on backend '{}'",
                manifest.disk_format.as_str(),
                BACKEND_NAME
            )));
        }

        let current = tokio::fs::metadata(&manifest.file).await?.len();
        if new_size < current {
            return Err(ProviderError::InvalidArgument(format!(
                "cannot shrink image '{}' from {} to {} bytes",
                name, current, new_size
            )));
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&manifest.file)
            .await?;
        file.set_len(new_size).await?;
        manifest.size_bytes = new_size;
        write_json(&image_manifest_path(home, name), &manifest).await?;
        tracing::info!("✅ [qemu] resized image {} to {} bytes", name, new_size);
        Ok(())
    }

    async fn create_instance(&self, ctx: &Context) -> Result<Instance> {
        let home = self.home()?;
        let name = ctx.instance_name();
        validate_name("instance", name)?;

        if self.load_instance(home, name).await?.is_some() {
            return Err(ProviderError::AlreadyExists(format!("instance '{}'", name)));
        }

        let image_name = ctx.image_name();
        let Some(image) = self.load_image(home, image_name).await? else {
            return Err(ProviderError::ImageNotFound(image_name.to_string()));
        };

        let rc = &ctx.run_config;
        let manifest = InstanceManifest {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            image_id: image.id.clone(),
            image_name: image.name.clone(),
            image_file: image.file.clone(),
            disk_format: image.disk_format,
            status: InstanceStatus::Created,
            ever_started: false,
            pid: None,
            flavor: rc.flavor.clone(),
            memory_mb: rc.memory_mb,
            cpus: rc.cpus,
            adapter: rc.adapter,
            tap: rc.network.clone(),
            created_at: Utc::now(),
        };
        tokio::fs::create_dir_all(instance_dir(home, name)).await?;
        self.save_instance(home, &manifest).await?;

        tracing::info!("✅ [qemu] created instance {} from image {}", name, image_name);
        Ok(manifest.to_instance())
    }

    async fn list_instances(&self, _ctx: &Context) -> Result<Vec<Instance>> {
        let home = self.home()?;
        let mut out = Vec::new();
        for mut manifest in self.all_instances(home).await? {
            self.refresh(home, &mut manifest).await?;
            out.push(manifest.to_instance());
        }
        Ok(out)
    }

    async fn delete_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let home = self.home()?;
        let Some(mut manifest) = self.load_instance(home, name).await? else {
            return Ok(());
        };
        self.refresh(home, &mut manifest).await?;
        if manifest.status == InstanceStatus::Running {
            self.halt(home, &mut manifest).await?;
        }
        match tokio::fs::remove_dir_all(instance_dir(home, name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("✅ [qemu] deleted instance {}", name);
        Ok(())
    }

    async fn start_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let home = self.home()?;
        let Some(mut manifest) = self.load_instance(home, name).await? else {
            return Err(ProviderError::InstanceNotFound(name.to_string()));
        };
        self.refresh(home, &mut manifest).await?;

        match manifest.status {
            InstanceStatus::Running => return Ok(()),
            InstanceStatus::Created | InstanceStatus::Stopped => {}
            other => {
                return Err(ProviderError::InvalidState(format!(
                    "instance '{}' is {}",
                    name, other
                )))
            }
        }

        if !tokio::fs::try_exists(&manifest.image_file).await.unwrap_or(false) {
            return Err(ProviderError::ImageNotFound(manifest.image_name.clone()));
        }

        let spec = LaunchSpec {
            instance_name: manifest.name.clone(),
            image: manifest.image_file.clone(),
            disk_format: manifest.disk_format,
            serial_log: serial_log(home, name),
            memory_mb: manifest.memory_mb,
            cpus: manifest.cpus,
            adapter: manifest.adapter,
            tap: manifest.tap.clone(),
        };
        let process = self.hypervisor.start(&spec).await?;

        manifest.pid = process.pid();
        manifest.status = InstanceStatus::Running;
        manifest.ever_started = true;
        self.processes.lock().await.insert(name.to_string(), process);
        self.save_instance(home, &manifest).await?;

        tracing::info!("✅ [qemu] started instance {} (pid={:?})", name, manifest.pid);
        Ok(())
    }

    async fn stop_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let home = self.home()?;
        let Some(mut manifest) = self.load_instance(home, name).await? else {
            return Ok(());
        };
        self.refresh(home, &mut manifest).await?;
        if manifest.status != InstanceStatus::Running {
            tracing::debug!("[qemu] stop_instance: {} is {}", name, manifest.status);
            return Ok(());
        }
        self.halt(home, &mut manifest).await?;
        self.save_instance(home, &manifest).await?;
        tracing::info!("✅ [qemu] stopped instance {}", name);
        Ok(())
    }

    async fn get_instance_logs(
        &self,
        _ctx: &Context,
        name: &str,
        watch: bool,
    ) -> Result<InstanceLogs> {
        let home = self.home()?;
        let Some(manifest) = self.load_instance(home, name).await? else {
            return Err(ProviderError::InstanceNotFound(name.to_string()));
        };
        if !manifest.ever_started {
            return Err(ProviderError::LogsNotYetAvailable(format!(
                "instance '{}' has never been started",
                name
            )));
        }

        let log = serial_log(home, name);
        if watch {
            let tail = LogTail::spawn(self.log_poll_interval, move || read_log(log.clone()));
            return Ok(InstanceLogs::Follow(tail));
        }
        let text = read_log(log).await?;
        if text.is_empty() {
            return Err(ProviderError::LogsNotYetAvailable(format!(
                "instance '{}' has not written any console output yet",
                name
            )));
        }
        Ok(InstanceLogs::Snapshot(text))
    }
}

async fn read_log(path: PathBuf) -> Result<String> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
            ProviderError::LogsNotYetAvailable(format!("{} not written yet", path.display())),
        ),
        Err(e) => Err(e.into()),
    }
}

fn image_file_path(home: &Path, name: &str) -> PathBuf {
    home.join("images").join(format!("{}.img", name))
}

fn image_manifest_path(home: &Path, name: &str) -> PathBuf {
    home.join("images").join(format!("{}.json", name))
}

fn instance_dir(home: &Path, name: &str) -> PathBuf {
    home.join("instances").join(name)
}

fn serial_log(home: &Path, name: &str) -> PathBuf {
    instance_dir(home, name).join("serial.log")
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.')
    {
        return Err(ProviderError::InvalidArgument(format!(
            "invalid {} name '{}'",
            kind, name
        )));
    }
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file so readers never see a torn manifest.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Parse a human size such as `512M`, `2G`, `2GiB` or a plain byte count.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(digits_end);
    let invalid = || ProviderError::InvalidArgument(format!("invalid size '{}'", input));

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(invalid()),
    };
    value.checked_mul(multiplier).ok_or_else(invalid)
}
