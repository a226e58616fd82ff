use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{DiskFormat, NetworkAdapter, Visibility};

/// Where the builder takes its input from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum ImageSource {
    /// A compiled program to wrap into a boot image.
    Program(PathBuf),
    /// A prebuilt package archive.
    Package(PathBuf),
}

/// Object storage location used to stage raw image bytes before catalog
/// registration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Datastore {
    pub container: String,
    pub region: Option<String>,
}

/// Image build parameters.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Configuration {
    pub name: String,
    pub source: Option<ImageSource>,
    pub disk_format: DiskFormat,
    pub visibility: Visibility,
    /// Directory the builder writes artifacts into.
    pub output_dir: PathBuf,
    pub datastore: Option<Datastore>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: None,
            disk_format: DiskFormat::Raw,
            visibility: Visibility::Private,
            output_dir: std::env::temp_dir().join("uniprov"),
            datastore: None,
        }
    }
}

impl Configuration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Path the builder is expected to produce for this configuration.
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.name, artifact_extension(self.disk_format)))
    }
}

fn artifact_extension(format: DiskFormat) -> &'static str {
    match format {
        DiskFormat::Raw => "img",
        other => other.as_str(),
    }
}

/// Instance parameters.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfiguration {
    pub instance_name: String,
    /// Image to instantiate. Empty means the image named by [`Configuration::name`].
    pub image_name: String,
    pub flavor: Option<String>,
    pub network: Option<String>,
    pub adapter: NetworkAdapter,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub memory_mb: u32,
    pub cpus: u32,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            instance_name: String::new(),
            image_name: String::new(),
            flavor: None,
            network: None,
            adapter: NetworkAdapter::Virtio,
            region: None,
            zone: None,
            memory_mb: 512,
            cpus: 1,
        }
    }
}

/// Per-invocation bundle handed to every orchestration call. Backends only
/// ever receive `&Context`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Context {
    pub config: Configuration,
    pub run_config: RunConfiguration,
}

impl Context {
    pub fn new(config: Configuration, run_config: RunConfiguration) -> Self {
        Self { config, run_config }
    }

    pub fn image_name(&self) -> &str {
        if self.run_config.image_name.trim().is_empty() {
            &self.config.name
        } else {
            &self.run_config.image_name
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.run_config.instance_name
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }
}
