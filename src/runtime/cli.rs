//! docker/podman command line adapter

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::process;

use super::{parse_inspect, parse_top, ContainerInfo, ContainerRuntime, ExecOutput, ProcessEntry, RunSpec};

/// Container runtime driven through its CLI
pub struct CliRuntime {
    /// Path to docker or podman binary
    runtime_path: String,
}

impl CliRuntime {
    /// Locate the runtime binary and verify it responds
    pub async fn new(configured: Option<&str>) -> Result<Self> {
        let runtime_path = match configured {
            Some(path) => path.to_string(),
            None => which::which("docker")
                .or_else(|_| which::which("podman"))
                .map(|p| p.to_string_lossy().to_string())
                .context("Neither docker nor podman found in PATH")?,
        };

        let output = process::capture(&runtime_path, &["--version".to_string()])
            .await
            .context("Failed to run container runtime --version")?;

        if !output.success() {
            anyhow::bail!("Container runtime not available or not working");
        }

        info!(runtime_version = %output.stdout, "Container runtime initialized");

        Ok(Self { runtime_path })
    }

    pub fn path(&self) -> &str {
        &self.runtime_path
    }

    /// Build `run` arguments
    pub fn run_args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--cidfile={}", spec.cid_file.display()),
        ];

        for port in &spec.publish {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args
    }

    /// Build `exec` arguments
    pub fn exec_args(container_id: &str, user: Option<&str>, argv: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];

        if let Some(user) = user {
            args.push("--user".to_string());
            args.push(user.to_string());
        }

        args.push(container_id.to_string());
        args.extend(argv.iter().cloned());
        args
    }

    async fn run_cmd(&self, args: &[&str]) -> Result<ExecOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        process::capture(&self.runtime_path, &args).await
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self.run_cmd(&["image", "inspect", image]).await?;
        Ok(output.success())
    }

    async fn run(&self, spec: &RunSpec) -> Result<i32> {
        let args = Self::run_args(spec);
        debug!(args = ?args, "Starting container");
        process::stream(&self.runtime_path, &args, "container").await
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
        let output = self.run_cmd(&["inspect", "--type", "container", container_id]).await?;

        if !output.success() {
            debug!(container_id = %container_id, stderr = %output.stderr, "Container not found");
            return Ok(None);
        }

        parse_inspect(&output.stdout).context("Failed to parse inspect output")
    }

    async fn exec(
        &self,
        container_id: &str,
        user: Option<String>,
        argv: Vec<String>,
    ) -> Result<ExecOutput> {
        let args = Self::exec_args(container_id, user.as_deref(), &argv);
        process::capture(&self.runtime_path, &args).await
    }

    async fn top(&self, container_id: &str) -> Result<Vec<ProcessEntry>> {
        let output = self.run_cmd(&["top", container_id]).await?;

        if !output.success() {
            anyhow::bail!("Failed to list processes: {}", output.stderr);
        }

        Ok(parse_top(&output.stdout))
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let output = self.run_cmd(&["stop", container_id]).await?;

        if !output.success() {
            warn!(container_id = %container_id, stderr = %output.stderr, "Container stop failed");
            anyhow::bail!("Failed to stop container {}: {}", container_id, output.stderr);
        }

        info!(container_id = %container_id, "Container stopped");
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let output = self.run_cmd(&["rmi", image]).await?;

        if !output.success() {
            anyhow::bail!("Failed to remove image {}: {}", image, output.stderr);
        }

        info!(image = %image, "Image removed");
        Ok(())
    }
}
