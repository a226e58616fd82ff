use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod context;
pub mod error;

pub use context::{Configuration, Context, Datastore, ImageSource, RunConfiguration};
pub use error::{ErrorKind, ProviderError, Result};

// --- Enums ---

/// Image lifecycle. Variants are declared in lifecycle order.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    None,
    Building, // Builder invoked
    Built,    // Local artifact exists
    Staged,   // Bytes are in backend-accessible storage
    Published, // Registered in the catalog, instantiable
    Failed,   // Build failed, terminal
    Deleted,  // Removed from the catalog, terminal
}

impl ImageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::None => "none",
            ImageStatus::Building => "building",
            ImageStatus::Built => "built",
            ImageStatus::Staged => "staged",
            ImageStatus::Published => "published",
            ImageStatus::Failed => "failed",
            ImageStatus::Deleted => "deleted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ImageStatus::Failed | ImageStatus::Deleted)
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    None,
    Created,  // Exists on the backend, never started
    Running,
    Stopped,
    Failed,   // Backend reports an error state
    Deleted,  // Destroyed
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::None => "none",
            InstanceStatus::Created => "created",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Raw,
    Qcow2,
    Vmdk,
    Vhd,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vhd => "vhd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Some(DiskFormat::Raw),
            "qcow2" => Some(DiskFormat::Qcow2),
            "vmdk" => Some(DiskFormat::Vmdk),
            "vhd" => Some(DiskFormat::Vhd),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
    Community,
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Community => "community",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "private" => Some(Visibility::Private),
            "shared" => Some(Visibility::Shared),
            "community" => Some(Visibility::Community),
            "public" => Some(Visibility::Public),
            _ => None,
        }
    }
}

/// Guest network device model.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkAdapter {
    #[default]
    Virtio,
    E1000,
    Vmxnet3,
}

impl NetworkAdapter {
    /// QEMU `-device` model name.
    pub fn device_model(self) -> &'static str {
        match self {
            NetworkAdapter::Virtio => "virtio-net-pci",
            NetworkAdapter::E1000 => "e1000",
            NetworkAdapter::Vmxnet3 => "vmxnet3",
        }
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: ImageStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
    pub disk_format: DiskFormat,
    pub visibility: Visibility,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub image_id: Option<String>,
    pub flavor: Option<String>,
    pub ip_addresses: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}
