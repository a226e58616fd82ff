//! Boundary with the external unikernel image builder.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use uniprov_common::{Configuration, ImageSource, ProviderError, Result};

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build a boot image from `config.source`.
    async fn build(&self, config: &Configuration) -> Result<PathBuf>;

    /// Build a boot image from a package archive.
    async fn build_from_package(&self, package: &Path, config: &Configuration) -> Result<PathBuf>;
}

/// Runs an external builder program:
///
/// ```text
/// <program> build   <program-path> --name <name> --format <fmt> --output <artifact>
/// <program> package <package-path> --name <name> --format <fmt> --output <artifact>
/// ```
pub struct CommandImageBuilder {
    program: String,
    timeout: Duration,
}

impl CommandImageBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, verb: &str, input: &Path, config: &Configuration) -> Result<PathBuf> {
        let artifact = config.artifact_path();
        tokio::fs::create_dir_all(&config.output_dir).await?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(verb)
            .arg(input)
            .args(["--name", &config.name])
            .args(["--format", config.disk_format.as_str()])
            .arg("--output")
            .arg(&artifact)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            "🔵 [builder] {} {} {} -> {}",
            self.program,
            verb,
            input.display(),
            artifact.display()
        );

        let child = cmd.spawn().map_err(|e| {
            ProviderError::BuildFailed(format!("failed to spawn '{}': {}", self.program, e))
        })?;

        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ProviderError::BuildFailed(e.to_string())),
            Err(_) => {
                return Err(ProviderError::BuildFailed(format!(
                    "'{}' timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("❌ [builder] {} {} failed: {}", self.program, verb, stderr.trim());
            return Err(ProviderError::BuildFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            return Err(ProviderError::BuildFailed(format!(
                "builder reported success but {} is missing",
                artifact.display()
            )));
        }

        tracing::info!("✅ [builder] produced {}", artifact.display());
        Ok(artifact)
    }
}

#[async_trait]
impl ImageBuilder for CommandImageBuilder {
    async fn build(&self, config: &Configuration) -> Result<PathBuf> {
        match &config.source {
            Some(ImageSource::Program(path)) => self.run("build", path, config).await,
            Some(ImageSource::Package(path)) => self.build_from_package(path, config).await,
            None => Err(ProviderError::BuildFailed(format!(
                "no program or package configured for image '{}'",
                config.name
            ))),
        }
    }

    async fn build_from_package(&self, package: &Path, config: &Configuration) -> Result<PathBuf> {
        if !tokio::fs::try_exists(package).await.unwrap_or(false) {
            return Err(ProviderError::PackageNotFound(package.display().to_string()));
        }
        self.run("package", package, config).await
    }
}
