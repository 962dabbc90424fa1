//! Verification checks run against a started container
//!
//! Each check is independent of the others. A suite runs them in order and
//! stops at the first failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CheckKind, VerifyConfig};
use crate::error::{Result, VerifyError};
use crate::poll::{poll, PollPolicy};
use crate::probe::HttpProbe;
use crate::tracker::{ContainerHandle, LifecycleTracker};

/// A single pass/fail verification
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, tracker: &LifecycleTracker, handle: &ContainerHandle) -> Result<()>;
}

/// Health endpoint answers 200
pub struct HttpCheck {
    probe: Arc<dyn HttpProbe>,
    port: u16,
    path: String,
    policy: PollPolicy,
    attempt_timeout: Duration,
}

impl HttpCheck {
    pub fn new(
        probe: Arc<dyn HttpProbe>,
        port: u16,
        path: impl Into<String>,
        policy: PollPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            port,
            path: path.into(),
            policy,
            attempt_timeout,
        }
    }
}

#[async_trait]
impl Check for HttpCheck {
    fn name(&self) -> &'static str {
        CheckKind::Http.as_str()
    }

    async fn run(&self, tracker: &LifecycleTracker, handle: &ContainerHandle) -> Result<()> {
        let ip = tracker.ip(handle).await?;
        let url = format!("http://{}:{}{}", ip, self.port, self.path);
        let url = url.as_str();

        let result = poll(self.policy, || async move {
            match self.probe.get_status(url, self.attempt_timeout).await {
                Ok(200) => true,
                Ok(status) => {
                    debug!(url = %url, status, "Endpoint not ready");
                    false
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Endpoint unreachable");
                    false
                }
            }
        })
        .await;

        match result {
            Ok(attempt) => {
                debug!(url = %url, attempt, "Endpoint returned 200");
                Ok(())
            }
            Err(timeout) => Err(VerifyError::check(
                self.name(),
                format!("no HTTP 200 from {} after {} attempts", url, timeout.attempts),
            )),
        }
    }
}

/// Entrypoint self-test exits 0
pub struct SelfTestCheck {
    command: Vec<String>,
}

impl SelfTestCheck {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Check for SelfTestCheck {
    fn name(&self) -> &'static str {
        CheckKind::SelfTest.as_str()
    }

    async fn run(&self, tracker: &LifecycleTracker, handle: &ContainerHandle) -> Result<()> {
        let output = tracker.exec(handle, None, &self.command).await?;

        if output.success() {
            return Ok(());
        }

        Err(VerifyError::CheckFailed {
            check: self.name().to_string(),
            reason: format!("`{}` exited with {}: {}", self.command.join(" "), output.exit_code, output.stderr),
            code: Some(output.exit_code),
        })
    }
}

/// A non-default user can create files in the temp directory
pub struct WritableTempCheck {
    user: String,
    dir: String,
}

impl WritableTempCheck {
    pub fn new(user: impl Into<String>, dir: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl Check for WritableTempCheck {
    fn name(&self) -> &'static str {
        CheckKind::WritableTemp.as_str()
    }

    async fn run(&self, tracker: &LifecycleTracker, handle: &ContainerHandle) -> Result<()> {
        let path = format!(
            "{}/s2i-verify-{}",
            self.dir.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );

        let output = tracker
            .exec(handle, Some(self.user.as_str()), &["touch".to_string(), path.clone()])
            .await?;

        if !output.success() {
            return Err(VerifyError::CheckFailed {
                check: self.name().to_string(),
                reason: format!("user {} cannot create {}: {}", self.user, path, output.stderr),
                code: Some(output.exit_code),
            });
        }

        let rm = ["rm".to_string(), "-f".to_string(), path.clone()];
        if let Err(e) = tracker.exec(handle, Some(self.user.as_str()), &rm).await {
            warn!(path = %path, error = %e, "Failed to remove probe file");
        }

        Ok(())
    }
}

/// Every process in the container matches the expected name pattern
pub struct ProcessShapeCheck {
    pattern: Regex,
}

impl ProcessShapeCheck {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("Invalid process pattern '{}'", pattern))?;
        Ok(Self { pattern })
    }
}

#[async_trait]
impl Check for ProcessShapeCheck {
    fn name(&self) -> &'static str {
        CheckKind::ProcessShape.as_str()
    }

    async fn run(&self, tracker: &LifecycleTracker, handle: &ContainerHandle) -> Result<()> {
        let processes = tracker.top(handle).await?;

        if processes.is_empty() {
            return Err(VerifyError::check(self.name(), "container lists no processes"));
        }

        if let Some(unexpected) = processes.iter().find(|p| !self.pattern.is_match(&p.command)) {
            return Err(VerifyError::check(
                self.name(),
                format!(
                    "unexpected process pid {} `{}` (expected /{}/)",
                    unexpected.pid,
                    unexpected.command,
                    self.pattern.as_str()
                ),
            ));
        }

        debug!(count = processes.len(), "Process table matches");
        Ok(())
    }
}

/// Ordered list of checks
pub struct CheckSuite {
    checks: Vec<Box<dyn Check>>,
}

impl CheckSuite {
    pub fn new(checks: Vec<Box<dyn Check>>) -> Self {
        Self { checks }
    }

    /// Build the checks named in `kinds` from configuration
    pub fn from_config(
        kinds: &[CheckKind],
        config: &VerifyConfig,
        probe: Arc<dyn HttpProbe>,
    ) -> anyhow::Result<Self> {
        let mut checks: Vec<Box<dyn Check>> = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let check: Box<dyn Check> = match kind {
                CheckKind::Http => Box::new(HttpCheck::new(
                    probe.clone(),
                    config.container.health_port,
                    config.container.health_path.clone(),
                    config.poll_policy(),
                    Duration::from_millis(config.checks.http_timeout_ms),
                )),
                CheckKind::SelfTest => {
                    Box::new(SelfTestCheck::new(config.checks.self_test_command.clone()))
                }
                CheckKind::WritableTemp => Box::new(WritableTempCheck::new(
                    config.checks.probe_user.clone(),
                    config.checks.probe_dir.clone(),
                )),
                CheckKind::ProcessShape => {
                    Box::new(ProcessShapeCheck::new(&config.checks.process_pattern)?)
                }
            };
            checks.push(check);
        }

        Ok(Self::new(checks))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check in order, stopping at the first failure
    pub async fn run(&self, tracker: &LifecycleTracker, handle: &ContainerHandle) -> Result<()> {
        for check in &self.checks {
            match check.run(tracker, handle).await {
                Ok(()) => info!(check = check.name(), role = %handle.role, "Check passed"),
                Err(e) => {
                    error!(check = check.name(), role = %handle.role, error = %e, "Check failed");
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockHttpProbe;
    use crate::runtime::{ContainerInfo, ExecOutput, MockContainerRuntime, ProcessEntry};
    use crate::tracker::Role;
    use pretty_assertions::assert_eq;

    fn process(pid: &str, command: &str) -> ProcessEntry {
        ProcessEntry {
            pid: pid.to_string(),
            user: "1001".to_string(),
            command: command.to_string(),
        }
    }

    /// Runtime with a started container "cid-1" at 10.0.0.7
    fn base_runtime() -> MockContainerRuntime {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_run().returning(|spec| {
            std::fs::write(&spec.cid_file, "cid-1").unwrap();
            Ok(0)
        });
        runtime.expect_inspect().returning(|id| {
            Ok(Some(ContainerInfo {
                id: id.to_string(),
                running: true,
                ip: Some("10.0.0.7".parse().unwrap()),
            }))
        });
        runtime.expect_stop().returning(|_| Ok(()));
        runtime
    }

    async fn started(runtime: MockContainerRuntime) -> (LifecycleTracker, ContainerHandle) {
        let policy = PollPolicy::new(10, Duration::from_millis(5));
        let tracker = LifecycleTracker::new(Arc::new(runtime), policy);
        let handle = tracker.start(Role::App, "img-testapp", vec![], vec![]).await.unwrap();
        tracker.wait_ready(&handle).await.unwrap();
        (tracker, handle)
    }

    #[tokio::test]
    async fn test_http_check_passes_on_200() {
        let mut probe = MockHttpProbe::new();
        probe
            .expect_get_status()
            .withf(|url, _| url == "http://10.0.0.7:8090/status/live")
            .times(1)
            .returning(|_, _| Ok(200));

        let (tracker, handle) = started(base_runtime()).await;
        let check = HttpCheck::new(
            Arc::new(probe),
            8090,
            "/status/live",
            PollPolicy::new(10, Duration::from_millis(1)),
            Duration::from_secs(1),
        );

        check.run(&tracker, &handle).await.unwrap();
        tracker.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_check_retries_until_200() {
        let mut probe = MockHttpProbe::new();
        let mut calls = 0;
        probe.expect_get_status().times(3).returning(move |_, _| {
            calls += 1;
            match calls {
                1 => Err(anyhow::anyhow!("connection refused")),
                2 => Ok(503),
                _ => Ok(200),
            }
        });

        let (tracker, handle) = started(base_runtime()).await;
        let check = HttpCheck::new(
            Arc::new(probe),
            8090,
            "/status/live",
            PollPolicy::new(10, Duration::from_millis(1)),
            Duration::from_secs(1),
        );

        check.run(&tracker, &handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_check_fails_after_attempts() {
        let mut probe = MockHttpProbe::new();
        probe.expect_get_status().times(10).returning(|_, _| Ok(404));

        let (tracker, handle) = started(base_runtime()).await;
        let check = HttpCheck::new(
            Arc::new(probe),
            8090,
            "/status/live",
            PollPolicy::new(10, Duration::from_millis(1)),
            Duration::from_secs(1),
        );

        let err = check.run(&tracker, &handle).await.unwrap_err();
        assert!(matches!(err, VerifyError::CheckFailed { ref check, .. } if check == "http"));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_self_test_propagates_exit_code() {
        let mut runtime = base_runtime();
        runtime
            .expect_exec()
            .withf(|id, user, argv| id == "cid-1" && user.is_none() && *argv == ["bin/apicast", "--test"])
            .returning(|_, _, _| {
                Ok(ExecOutput {
                    exit_code: 4,
                    stdout: String::new(),
                    stderr: "nginx: configuration file test failed".to_string(),
                })
            });

        let (tracker, handle) = started(runtime).await;
        let check = SelfTestCheck::new(vec!["bin/apicast".to_string(), "--test".to_string()]);

        let err = check.run(&tracker, &handle).await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_writable_temp_runs_as_probe_user() {
        let mut runtime = base_runtime();
        runtime
            .expect_exec()
            .withf(|_, user, argv| {
                user.as_deref() == Some("12345") && argv[0] == "touch" && argv[1].starts_with("/tmp/s2i-verify-")
            })
            .times(1)
            .returning(|_, _, _| Ok(ExecOutput::default()));
        runtime
            .expect_exec()
            .withf(|_, _, argv| argv[0] == "rm")
            .times(1)
            .returning(|_, _, _| Ok(ExecOutput::default()));

        let (tracker, handle) = started(runtime).await;
        WritableTempCheck::new("12345", "/tmp/")
            .run(&tracker, &handle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_writable_temp_denied() {
        let mut runtime = base_runtime();
        runtime.expect_exec().times(1).returning(|_, _, _| {
            Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "touch: cannot touch '/tmp/x': Permission denied".to_string(),
            })
        });

        let (tracker, handle) = started(runtime).await;
        let err = WritableTempCheck::new("12345", "/tmp")
            .run(&tracker, &handle)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_process_shape_passes() {
        let mut runtime = base_runtime();
        runtime.expect_top().returning(|_| {
            Ok(vec![
                process("1", "nginx: master process /opt/app/bin/nginx"),
                process("17", "nginx: worker process"),
            ])
        });

        let (tracker, handle) = started(runtime).await;
        ProcessShapeCheck::new("^nginx: (master|worker) process")
            .unwrap()
            .run(&tracker, &handle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_suite_stops_at_unexpected_process() {
        let mut runtime = base_runtime();
        runtime.expect_top().returning(|_| {
            Ok(vec![
                process("1", "nginx: master process"),
                process("9", "/bin/sh -c sleep 1000"),
                process("17", "nginx: worker process"),
            ])
        });
        // The self-test after the process check must never run
        runtime.expect_exec().never();

        let (tracker, handle) = started(runtime).await;
        let checks: Vec<Box<dyn Check>> = vec![
            Box::new(ProcessShapeCheck::new("^nginx: (master|worker) process").unwrap()),
            Box::new(SelfTestCheck::new(vec!["bin/apicast".to_string(), "--test".to_string()])),
        ];
        let suite = CheckSuite::new(checks);

        let err = suite.run(&tracker, &handle).await.unwrap_err();
        match err {
            VerifyError::CheckFailed { check, reason, .. } => {
                assert_eq!(check, "process-shape");
                assert!(reason.contains("pid 9"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_process_table_fails() {
        let mut runtime = base_runtime();
        runtime.expect_top().returning(|_| Ok(vec![]));

        let (tracker, handle) = started(runtime).await;
        let result = ProcessShapeCheck::new(".*").unwrap().run(&tracker, &handle).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_suite_from_config_keeps_order() {
        let mut config = VerifyConfig::default();
        config.checks.app_suite = vec![CheckKind::ProcessShape, CheckKind::Http];

        let suite =
            CheckSuite::from_config(&config.checks.app_suite, &config, Arc::new(MockHttpProbe::new()))
                .unwrap();
        assert_eq!(suite.names(), vec!["process-shape", "http"]);
    }
}
