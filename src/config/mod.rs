//! Configuration module for s2i-verify
//!
//! Supports configuration via:
//! - YAML/TOML/JSON config files
//! - Environment variables (with S2I_VERIFY_ prefix)
//! - `IMAGE_NAME` / `RUNTIME_IMAGE_NAME` and command line flags

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::poll::PollPolicy;

/// Main verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Base builder image under test
    #[serde(default = "default_image_name")]
    pub image_name: String,

    /// Runtime-only base image (defaults to `<image_name>-runtime`)
    #[serde(default)]
    pub runtime_image: Option<String>,

    /// Directory holding the test application source
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Explicit source URL (defaults to `file://<source_dir>`)
    #[serde(default)]
    pub source_url: Option<String>,

    /// Path to the s2i binary (looked up in PATH when unset)
    #[serde(default)]
    pub builder_path: Option<String>,

    /// Path to the docker/podman binary (looked up in PATH when unset)
    #[serde(default)]
    pub runtime_path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for the JSON log file (no file logging when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Leave built images in place after the run
    #[serde(default)]
    pub keep_images: bool,

    /// Build tool settings
    #[serde(default)]
    pub build: BuildConfig,

    /// Settings for containers started from the built images
    #[serde(default)]
    pub container: ContainerConfig,

    /// Readiness polling settings
    #[serde(default)]
    pub poll: PollConfig,

    /// Verification check settings
    #[serde(default)]
    pub checks: ChecksConfig,
}

/// Build tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Context directory inside the source
    #[serde(default = "default_context_dir")]
    pub context_dir: String,

    /// Value passed as `--loglevel`
    #[serde(default = "default_build_log_level")]
    pub log_level: u8,

    /// Value passed as `--pull-policy`
    #[serde(default = "default_pull_policy")]
    pub pull_policy: String,

    /// Rebuild the app image incrementally after the first build
    #[serde(default)]
    pub incremental_rebuild: bool,
}

/// Settings for started containers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Application port published by the container
    #[serde(default = "default_app_port")]
    pub port: u16,

    /// Port serving the health endpoint
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Health endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Name of the portal endpoint variable
    #[serde(default = "default_portal_env")]
    pub portal_env: String,

    /// Portal endpoint URL handed to the container
    #[serde(default = "default_portal_endpoint")]
    pub portal_endpoint: String,

    /// Extra `KEY=VALUE` pairs for the container environment
    #[serde(default)]
    pub extra_env: Vec<String>,
}

/// Readiness polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

/// Which checks run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    Http,
    SelfTest,
    WritableTemp,
    ProcessShape,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Http => "http",
            CheckKind::SelfTest => "self-test",
            CheckKind::WritableTemp => "writable-temp",
            CheckKind::ProcessShape => "process-shape",
        }
    }
}

/// Verification check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    /// Checks run against the application container
    #[serde(default = "default_suite")]
    pub app_suite: Vec<CheckKind>,

    /// Checks run against the runtime application container
    #[serde(default = "default_suite")]
    pub runtime_suite: Vec<CheckKind>,

    /// Timeout for a single HTTP attempt
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Entrypoint self-test command
    #[serde(default = "default_self_test_command")]
    pub self_test_command: Vec<String>,

    /// Non-default user for the writable temp probe
    #[serde(default = "default_probe_user")]
    pub probe_user: String,

    /// Directory that must be writable by the probe user
    #[serde(default = "default_probe_dir")]
    pub probe_dir: String,

    /// Pattern every process in the container must match
    #[serde(default = "default_process_pattern")]
    pub process_pattern: String,
}

/// Values that take precedence over every config source
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub image_name: Option<String>,
    pub runtime_image: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub keep_images: bool,
}

// Default value functions
fn default_image_name() -> String {
    "apicast-candidate".to_string()
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_context_dir() -> String {
    "test".to_string()
}

fn default_build_log_level() -> u8 {
    1
}

fn default_pull_policy() -> String {
    "never".to_string()
}

fn default_app_port() -> u16 {
    8080
}

fn default_health_port() -> u16 {
    8090
}

fn default_health_path() -> String {
    "/status/live".to_string()
}

fn default_portal_env() -> String {
    "THREESCALE_PORTAL_ENDPOINT".to_string()
}

fn default_portal_endpoint() -> String {
    "http://127.0.0.1:8081/config".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_suite() -> Vec<CheckKind> {
    vec![
        CheckKind::Http,
        CheckKind::SelfTest,
        CheckKind::WritableTemp,
        CheckKind::ProcessShape,
    ]
}

fn default_http_timeout_ms() -> u64 {
    1000
}

fn default_self_test_command() -> Vec<String> {
    vec!["bin/apicast".to_string(), "--test".to_string()]
}

fn default_probe_user() -> String {
    "12345".to_string()
}

fn default_probe_dir() -> String {
    "/tmp".to_string()
}

fn default_process_pattern() -> String {
    "^nginx: (master|worker) process".to_string()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            context_dir: default_context_dir(),
            log_level: default_build_log_level(),
            pull_policy: default_pull_policy(),
            incremental_rebuild: false,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            port: default_app_port(),
            health_port: default_health_port(),
            health_path: default_health_path(),
            portal_env: default_portal_env(),
            portal_endpoint: default_portal_endpoint(),
            extra_env: vec![],
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            app_suite: default_suite(),
            runtime_suite: default_suite(),
            http_timeout_ms: default_http_timeout_ms(),
            self_test_command: default_self_test_command(),
            probe_user: default_probe_user(),
            probe_dir: default_probe_dir(),
            process_pattern: default_process_pattern(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            image_name: default_image_name(),
            runtime_image: None,
            source_dir: default_source_dir(),
            source_url: None,
            builder_path: None,
            runtime_path: None,
            log_level: default_log_level(),
            log_dir: None,
            keep_images: false,
            build: BuildConfig::default(),
            container: ContainerConfig::default(),
            poll: PollConfig::default(),
            checks: ChecksConfig::default(),
        }
    }
}

impl VerifyConfig {
    /// Load configuration from files, environment variables and overrides
    pub fn load(config_file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&VerifyConfig::default())?)
            .add_source(config::File::with_name("config/s2i-verify").required(false))
            .add_source(config::File::with_name("/etc/s2i-verify/config").required(false));

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let builder = builder
            // Override with environment variables (S2I_VERIFY__ prefix)
            .add_source(
                config::Environment::with_prefix("S2I_VERIFY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("image_name", overrides.image_name.clone())?
            .set_override_option("runtime_image", overrides.runtime_image.clone())?
            .set_override_option(
                "source_dir",
                overrides
                    .source_dir
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
            )?
            .set_override_option("log_level", overrides.log_level.clone())?;

        let builder = if overrides.keep_images {
            builder.set_override("keep_images", true)?
        } else {
            builder
        };

        let verify_config: VerifyConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        verify_config.validate()?;

        Ok(verify_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.image_name.trim().is_empty() {
            anyhow::bail!("Image name cannot be empty");
        }

        if matches!(self.runtime_image.as_deref(), Some(name) if name.trim().is_empty()) {
            anyhow::bail!("Runtime image name cannot be empty");
        }

        if self.container.port == 0 || self.container.health_port == 0 {
            anyhow::bail!("Container ports cannot be 0");
        }

        if !self.container.health_path.starts_with('/') {
            anyhow::bail!("Health path must start with '/'");
        }

        if self.poll.max_attempts == 0 {
            anyhow::bail!("Poll attempts cannot be 0");
        }

        if self.checks.self_test_command.is_empty() {
            anyhow::bail!("Self-test command cannot be empty");
        }

        if let Some(bad) = self.container.extra_env.iter().find(|kv| !kv.contains('=')) {
            anyhow::bail!("Extra environment entry '{}' is not KEY=VALUE", bad);
        }

        regex::Regex::new(&self.checks.process_pattern)
            .with_context(|| format!("Invalid process pattern '{}'", self.checks.process_pattern))?;

        Ok(())
    }

    /// Runtime-only base image
    pub fn runtime_image_name(&self) -> String {
        self.runtime_image
            .clone()
            .unwrap_or_else(|| format!("{}-runtime", self.image_name))
    }

    /// Tag of the application image
    pub fn app_tag(&self) -> String {
        format!("{}-testapp", self.image_name)
    }

    /// Tag of the runtime application image
    pub fn runtime_app_tag(&self) -> String {
        format!("{}-runtime-testapp", self.image_name)
    }

    /// Source location handed to the build tool
    pub fn source_url(&self) -> String {
        if let Some(ref url) = self.source_url {
            return url.clone();
        }

        let dir = std::fs::canonicalize(&self.source_dir).unwrap_or_else(|_| self.source_dir.clone());
        format!("file://{}", dir.display())
    }

    /// Environment for containers started from the built images
    pub fn container_env(&self) -> Vec<(String, String)> {
        let mut env = vec![(
            self.container.portal_env.clone(),
            self.container.portal_endpoint.clone(),
        )];

        env.extend(self.container.extra_env.iter().filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        }));

        env
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.poll.max_attempts,
            Duration::from_millis(self.poll.interval_ms),
        )
    }
}
