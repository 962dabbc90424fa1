//! Source-to-image build tool invocation

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::VerifyConfig;
use crate::process;

/// One invocation of the build tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub source_url: String,
    pub context_dir: String,
    pub base_image: String,
    pub tag: String,
    pub incremental: bool,
    pub runtime_image: Option<String>,
    pub pull_policy: String,
    pub log_level: u8,
}

impl BuildRequest {
    /// Plain build of the test application on top of `base_image`
    pub fn app(config: &VerifyConfig) -> Self {
        Self {
            source_url: config.source_url(),
            context_dir: config.build.context_dir.clone(),
            base_image: config.image_name.clone(),
            tag: config.app_tag(),
            incremental: false,
            runtime_image: None,
            pull_policy: config.build.pull_policy.clone(),
            log_level: config.build.log_level,
        }
    }

    /// Same build reusing artifacts of the previous one
    pub fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }

    /// Build whose output is assembled on the runtime-only image
    pub fn runtime_app(config: &VerifyConfig) -> Self {
        Self {
            tag: config.runtime_app_tag(),
            runtime_image: Some(config.runtime_image_name()),
            ..Self::app(config)
        }
    }

    /// Command line arguments for the build tool
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            format!("--context-dir={}", self.context_dir),
        ];

        if self.incremental {
            args.push("--incremental=true".to_string());
        }

        if let Some(ref runtime) = self.runtime_image {
            args.push(format!("--runtime-image={}", runtime));
        }

        args.push(format!("--pull-policy={}", self.pull_policy));
        args.push(format!("--loglevel={}", self.log_level));
        args.push(self.source_url.clone());
        args.push(self.base_image.clone());
        args.push(self.tag.clone());
        args
    }
}

/// The image build tool
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Run a build synchronously; returns the tool's exit code
    async fn build(&self, request: &BuildRequest) -> Result<i32>;

    /// Run the image's usage script; returns the tool's exit code
    async fn usage(&self, image: &str) -> Result<i32>;
}

/// `s2i` command line adapter
pub struct S2iCli {
    /// Path to s2i binary
    s2i_path: String,
}

impl S2iCli {
    /// Locate the s2i binary
    pub fn new(configured: Option<&str>) -> Result<Self> {
        let s2i_path = match configured {
            Some(path) => path.to_string(),
            None => which::which("s2i")
                .map(|p| p.to_string_lossy().to_string())
                .context("s2i not found in PATH")?,
        };

        debug!(s2i_path = %s2i_path, "Build tool located");
        Ok(Self { s2i_path })
    }
}

#[async_trait]
impl ImageBuilder for S2iCli {
    async fn build(&self, request: &BuildRequest) -> Result<i32> {
        info!(
            base_image = %request.base_image,
            tag = %request.tag,
            incremental = request.incremental,
            runtime_image = ?request.runtime_image,
            "Building image"
        );

        process::stream(&self.s2i_path, &request.args(), "s2i").await
    }

    async fn usage(&self, image: &str) -> Result<i32> {
        let output = process::capture(&self.s2i_path, &["usage".to_string(), image.to_string()])
            .await?;

        debug!(image = %image, usage = %output.stdout, "Usage script output");
        Ok(output.exit_code)
    }
}
