//! Container lifecycle tracking through identifier files

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, VerifyError};
use crate::poll::{poll, PollPolicy};
use crate::runtime::{ContainerRuntime, ExecOutput, ProcessEntry, RunSpec};

/// How long a stopped container's foreground process may take to exit
const RUN_TASK_GRACE: Duration = Duration::from_secs(10);

/// Which of the built images a container runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    App,
    RuntimeApp,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::App => "app",
            Role::RuntimeApp => "runtime-app",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub role: Role,
    pub image: String,
    pub cid_file: PathBuf,
}

/// Bookkeeping for a running container
struct Tracked {
    /// Holds the identifier file; removed on drop
    dir: TempDir,
    /// Foreground `run` of the container
    task: JoinHandle<anyhow::Result<i32>>,
}

/// Starts, queries and stops containers
pub struct LifecycleTracker {
    runtime: Arc<dyn ContainerRuntime>,
    policy: PollPolicy,
    tracked: RwLock<HashMap<Role, Tracked>>,
}

impl LifecycleTracker {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, policy: PollPolicy) -> Self {
        Self {
            runtime,
            policy,
            tracked: RwLock::new(HashMap::new()),
        }
    }

    /// Launch a container in the background.
    ///
    /// Returns at once; the identifier file appears when the runtime has
    /// created the container (see [`LifecycleTracker::wait_ready`]).
    pub async fn start(
        &self,
        role: Role,
        image: &str,
        publish: Vec<u16>,
        env: Vec<(String, String)>,
    ) -> Result<ContainerHandle> {
        if self.is_tracked(role).await {
            warn!(role = %role, "Container already tracked, stopping it first");
            self.stop_role(role).await?;
        }

        let dir = tempfile::Builder::new()
            .prefix("s2i-verify-")
            .tempdir()
            .context("Failed to create identifier directory")?;
        let cid_file = dir.path().join(format!("{}.cid", role));

        let spec = RunSpec {
            image: image.to_string(),
            cid_file: cid_file.clone(),
            publish,
            env,
        };

        let runtime = self.runtime.clone();
        let task = tokio::spawn(async move {
            let code = runtime.run(&spec).await?;
            debug!(image = %spec.image, exit_code = code, "Container process exited");
            Ok::<_, anyhow::Error>(code)
        });

        self.tracked.write().await.insert(role, Tracked { dir, task });

        info!(role = %role, image = %image, cid_file = %cid_file.display(), "Container starting");

        Ok(ContainerHandle {
            role,
            image: image.to_string(),
            cid_file,
        })
    }

    /// Wait until the container's identifier file is written
    pub async fn wait_ready(&self, handle: &ContainerHandle) -> Result<String> {
        let path = handle.cid_file.clone();

        let attempt = poll(self.policy, || {
            let path = path.clone();
            async move { read_container_id(&path).await.is_some() }
        })
        .await
        .map_err(|timeout| VerifyError::ReadinessTimeout {
            what: format!("{} container id file", handle.role),
            attempts: timeout.attempts,
        })?;

        let container_id = self.container_id(handle).await?;
        info!(role = %handle.role, container_id = %container_id, attempt, "Container started");
        Ok(container_id)
    }

    /// Identifier recorded for a handle
    pub async fn container_id(&self, handle: &ContainerHandle) -> Result<String> {
        read_container_id(&handle.cid_file).await.ok_or_else(|| {
            VerifyError::Internal(anyhow::anyhow!("{} container not started", handle.role))
        })
    }

    /// Whether the tracked container still resolves to a known container
    pub async fn exists(&self, handle: &ContainerHandle) -> bool {
        let Some(container_id) = read_container_id(&handle.cid_file).await else {
            return false;
        };

        match self.runtime.inspect(&container_id).await {
            Ok(info) => info.is_some(),
            Err(e) => {
                debug!(container_id = %container_id, error = %e, "Inspect failed");
                false
            }
        }
    }

    /// Network address of the container
    pub async fn ip(&self, handle: &ContainerHandle) -> Result<IpAddr> {
        let container_id = self.container_id(handle).await?;

        self.runtime
            .inspect(&container_id)
            .await?
            .and_then(|info| info.ip)
            .ok_or_else(|| {
                VerifyError::Internal(anyhow::anyhow!(
                    "No address for {} container {}",
                    handle.role,
                    container_id
                ))
            })
    }

    /// Execute a command inside the container
    pub async fn exec(
        &self,
        handle: &ContainerHandle,
        user: Option<&str>,
        argv: &[String],
    ) -> Result<ExecOutput> {
        let container_id = self.container_id(handle).await?;
        let output = self
            .runtime
            .exec(&container_id, user.map(str::to_string), argv.to_vec())
            .await?;
        Ok(output)
    }

    /// Process table of the container
    pub async fn top(&self, handle: &ContainerHandle) -> Result<Vec<ProcessEntry>> {
        let container_id = self.container_id(handle).await?;
        Ok(self.runtime.top(&container_id).await?)
    }

    /// Stop the container if it exists and forget it. Safe to repeat.
    ///
    /// The container stays tracked until the runtime confirms the stop, so
    /// a failed or interrupted stop is retried by [`LifecycleTracker::stop_all`].
    pub async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        self.stop_role(handle.role).await
    }

    async fn stop_role(&self, role: Role) -> Result<()> {
        let cid_file = match self.tracked.read().await.get(&role) {
            Some(tracked) => tracked.dir.path().join(format!("{}.cid", role)),
            None => {
                debug!(role = %role, "Nothing tracked, stop is a no-op");
                return Ok(());
            }
        };

        if let Some(container_id) = read_container_id(&cid_file).await {
            if self.runtime.inspect(&container_id).await?.is_some() {
                self.runtime.stop(&container_id).await?;
            }
        }

        let Some(tracked) = self.tracked.write().await.remove(&role) else {
            return Ok(());
        };

        let mut task = tracked.task;
        match tokio::time::timeout(RUN_TASK_GRACE, &mut task).await {
            Ok(Ok(Ok(code))) => debug!(role = %role, exit_code = code, "Run task finished"),
            Ok(Ok(Err(e))) => debug!(role = %role, error = %e, "Run task failed"),
            Ok(Err(e)) => debug!(role = %role, error = %e, "Run task panicked"),
            Err(_) => {
                warn!(role = %role, "Run task did not exit, aborting");
                task.abort();
            }
        }

        // Removes the identifier file with its directory
        if let Err(e) = tracked.dir.close() {
            warn!(role = %role, error = %e, "Failed to remove identifier file");
        }

        info!(role = %role, "Container untracked");
        Ok(())
    }

    /// Stop every tracked container, reporting the first failure
    pub async fn stop_all(&self) -> Result<()> {
        let roles: Vec<Role> = self.tracked.read().await.keys().copied().collect();

        let results = futures::future::join_all(roles.into_iter().map(|r| self.stop_role(r))).await;
        results.into_iter().collect()
    }

    /// Delete an image if present. Safe to repeat.
    pub async fn remove_image(&self, image: &str) -> Result<()> {
        if !self.runtime.image_exists(image).await? {
            debug!(image = %image, "Image absent, nothing to remove");
            return Ok(());
        }

        self.runtime.remove_image(image).await?;
        Ok(())
    }

    pub async fn is_tracked(&self, role: Role) -> bool {
        self.tracked.read().await.contains_key(&role)
    }

    /// Roles with a live identifier file
    pub async fn tracked_roles(&self) -> Vec<Role> {
        self.tracked.read().await.keys().copied().collect()
    }
}

async fn read_container_id(path: &Path) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let id = contents.trim();
    (!id.is_empty()).then(|| id.to_string())
}
