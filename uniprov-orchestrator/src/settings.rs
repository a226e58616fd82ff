use std::path::PathBuf;
use std::time::Duration;
use uniprov_common::{
    Configuration, Context, Datastore, DiskFormat, ImageSource, ProviderError, Result,
    RunConfiguration,
};
use uniprov_providers::CommandImageBuilder;

use crate::provider_manager::ProviderManager;

/// Invocation settings read from `UNIPROV_*` variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: String,
    pub home: Option<PathBuf>,
    pub builder_program: String,
    pub build_timeout: Duration,
    /// Builder input for `image build`/`image publish` without a package.
    pub source: Option<ImageSource>,
    pub image_name: String,
    pub instance_name: String,
    pub flavor: Option<String>,
    pub network: Option<String>,
    pub disk_format: DiskFormat,
    pub datastore: Option<Datastore>,
    pub timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let disk_format = match var("UNIPROV_DISK_FORMAT") {
            Some(raw) => DiskFormat::parse(&raw).ok_or_else(|| {
                ProviderError::InvalidArgument(format!("UNIPROV_DISK_FORMAT: unknown format '{}'", raw))
            })?,
            None => DiskFormat::default(),
        };
        let seconds = |key: &str, default: u64| -> Result<Duration> {
            match var(key) {
                Some(raw) => raw.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                    ProviderError::InvalidArgument(format!("{}: '{}' is not a number", key, raw))
                }),
                None => Ok(Duration::from_secs(default)),
            }
        };
        let timeout = seconds("UNIPROV_TIMEOUT_SECS", 300)?;
        let build_timeout = seconds("UNIPROV_BUILD_TIMEOUT_SECS", 600)?;

        // A program takes precedence over a package.
        let source = var("UNIPROV_PROGRAM")
            .map(|p| ImageSource::Program(PathBuf::from(p)))
            .or_else(|| var("UNIPROV_PACKAGE").map(|p| ImageSource::Package(PathBuf::from(p))));
        let datastore = var("UNIPROV_CONTAINER").map(|container| Datastore {
            container,
            region: var("UNIPROV_REGION"),
        });

        Ok(Self {
            backend: ProviderManager::provider_name(var("UNIPROV_BACKEND")),
            home: var("UNIPROV_HOME")
                .map(PathBuf::from)
                .or_else(|| var("HOME").map(|h| PathBuf::from(h).join(".uniprov"))),
            builder_program: var("UNIPROV_BUILDER").unwrap_or_else(|| "mkimage".to_string()),
            build_timeout,
            source,
            image_name: var("UNIPROV_IMAGE_NAME").unwrap_or_default(),
            instance_name: var("UNIPROV_INSTANCE_NAME").unwrap_or_default(),
            flavor: var("UNIPROV_FLAVOR"),
            network: var("UNIPROV_NETWORK"),
            disk_format,
            datastore,
            timeout,
        })
    }

    pub fn context(&self) -> Context {
        let mut config = Configuration::new(self.image_name.clone());
        config.disk_format = self.disk_format;
        config.datastore = self.datastore.clone();
        config.source = self.source.clone();
        if let Some(home) = &self.home {
            config.output_dir = home.join("build");
        }

        let run_config = RunConfiguration {
            instance_name: self.instance_name.clone(),
            flavor: self.flavor.clone(),
            network: self.network.clone(),
            region: self.datastore.as_ref().and_then(|d| d.region.clone()),
            ..RunConfiguration::default()
        };
        Context::new(config, run_config)
    }

    pub fn builder(&self) -> CommandImageBuilder {
        CommandImageBuilder::new(self.builder_program.clone()).with_timeout(self.build_timeout)
    }
}
