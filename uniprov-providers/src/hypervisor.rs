//! Local hypervisor launchers used by the `qemu` backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use uniprov_common::{DiskFormat, NetworkAdapter, ProviderError, Result};

/// Everything a hypervisor needs to boot one instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub instance_name: String,
    pub image: PathBuf,
    pub disk_format: DiskFormat,
    pub serial_log: PathBuf,
    pub memory_mb: u32,
    pub cpus: u32,
    pub adapter: NetworkAdapter,
    /// Host tap device. `None` uses user-mode networking.
    pub tap: Option<String>,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn VmProcess>>;
}

/// Handle on a running guest.
#[async_trait]
pub trait VmProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Whether the guest process is still alive.
    fn is_running(&mut self) -> bool;

    async fn stop(&mut self) -> Result<()>;
}

type HypervisorFactory = fn() -> Box<dyn Hypervisor>;

/// Available hypervisors, keyed by the binary they drive.
pub fn hypervisors() -> HashMap<&'static str, HypervisorFactory> {
    let mut table: HashMap<&'static str, HypervisorFactory> = HashMap::new();
    table.insert(QEMU_X86_64, || -> Box<dyn Hypervisor> {
        Box::new(QemuHypervisor::new(QEMU_X86_64))
    });
    table
}

pub fn resolve_hypervisor(name: &str) -> Option<Box<dyn Hypervisor>> {
    hypervisors().get(name).map(|factory| factory())
}

pub const QEMU_X86_64: &str = "qemu-system-x86_64";

pub struct QemuHypervisor {
    binary: String,
    kvm: bool,
}

impl QemuHypervisor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            kvm: Path::new("/dev/kvm").exists(),
        }
    }

    pub fn with_kvm(mut self, kvm: bool) -> Self {
        self.kvm = kvm;
        self
    }

    pub fn args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            format!("{}M", spec.memory_mb),
            "-smp".to_string(),
            spec.cpus.max(1).to_string(),
            "-drive".to_string(),
            format!(
                "file={},format={},if=virtio,snapshot=on",
                spec.image.display(),
                spec.disk_format.as_str()
            ),
            "-serial".to_string(),
            format!("file:{}", spec.serial_log.display()),
            "-display".to_string(),
            "none".to_string(),
            "-no-reboot".to_string(),
        ];

        let netdev = match &spec.tap {
            Some(tap) => format!("tap,id=n0,ifname={},script=no,downscript=no", tap),
            None => "user,id=n0".to_string(),
        };
        args.push("-netdev".to_string());
        args.push(netdev);
        args.push("-device".to_string());
        args.push(format!("{},netdev=n0", spec.adapter.device_model()));

        if self.kvm {
            args.push("-enable-kvm".to_string());
        }
        args
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    fn name(&self) -> &'static str {
        QEMU_X86_64
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn VmProcess>> {
        let args = self.args(spec);
        tracing::info!(
            "🔵 [qemu] starting {}: {} {}",
            spec.instance_name,
            self.binary,
            args.join(" ")
        );

        // The guest outlives this process; stop goes through the pid.
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| {
                ProviderError::Io(format!(
                    "failed to spawn '{}': {}. Make sure QEMU is installed.",
                    self.binary, e
                ))
            })?;

        Ok(Box::new(QemuProcess { child }))
    }
}

struct QemuProcess {
    child: Child,
}

#[async_trait]
impl VmProcess for QemuProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }
}

/// Whether `pid` is still the guest that writes `serial_log`. A bare pid
/// survives neither a host reboot nor pid reuse, so the command line has to
/// match too.
pub async fn pid_is_guest(pid: u32, serial_log: &Path) -> bool {
    match tokio::fs::read(format!("/proc/{}/cmdline", pid)).await {
        Ok(cmdline) => cmdline_matches(&cmdline, serial_log),
        Err(_) => false,
    }
}

/// `cmdline` is the NUL-separated argv from `/proc/<pid>/cmdline`.
pub fn cmdline_matches(cmdline: &[u8], serial_log: &Path) -> bool {
    let mut args = cmdline
        .split(|b| *b == 0)
        .filter(|a| !a.is_empty())
        .map(String::from_utf8_lossy);
    let Some(program) = args.next() else {
        return false;
    };
    let is_qemu = Path::new(program.as_ref())
        .file_name()
        .and_then(|f| f.to_str())
        .is_some_and(|f| f.starts_with("qemu-system-"));
    let serial = format!("file:{}", serial_log.display());
    is_qemu && args.any(|a| a == serial)
}

/// Stop a guest started by an earlier invocation. A pid that no longer
/// belongs to the guest is left alone.
pub async fn terminate_pid(pid: u32, serial_log: &Path) -> Result<()> {
    if !pid_is_guest(pid, serial_log).await {
        tracing::debug!("[qemu] pid {} is not the guest for {}", pid, serial_log.display());
        return Ok(());
    }
    let output = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .output()
        .await?;
    if !output.status.success() && pid_is_guest(pid, serial_log).await {
        return Err(ProviderError::Io(format!(
            "kill {} failed: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
