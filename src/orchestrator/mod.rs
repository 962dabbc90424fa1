//! Build-and-verify driver
//!
//! Runs the phases strictly in order. Every phase must succeed before the
//! next one starts; the first failure ends the run. Cleanup of containers
//! and built images happens once at the end of every run that got past the
//! preflight checks.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, info_span, warn, Instrument};

use crate::builder::{BuildRequest, ImageBuilder};
use crate::checks::CheckSuite;
use crate::config::VerifyConfig;
use crate::error::{Result, VerifyError};
use crate::probe::HttpProbe;
use crate::report::{Phase, RunReport};
use crate::runtime::ContainerRuntime;
use crate::tracker::{ContainerHandle, LifecycleTracker, Role};

/// Sequential driver for a verification run
pub struct Orchestrator {
    config: VerifyConfig,
    builder: Arc<dyn ImageBuilder>,
    runtime: Arc<dyn ContainerRuntime>,
    tracker: LifecycleTracker,
    app_suite: CheckSuite,
    runtime_suite: CheckSuite,
}

impl Orchestrator {
    pub fn new(
        config: VerifyConfig,
        builder: Arc<dyn ImageBuilder>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HttpProbe>,
    ) -> anyhow::Result<Self> {
        let app_suite = CheckSuite::from_config(&config.checks.app_suite, &config, probe.clone())?;
        let runtime_suite = CheckSuite::from_config(&config.checks.runtime_suite, &config, probe)?;
        let tracker = LifecycleTracker::new(runtime.clone(), config.poll_policy());

        Ok(Self {
            config,
            builder,
            runtime,
            tracker,
            app_suite,
            runtime_suite,
        })
    }

    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    /// Run every phase to completion
    pub async fn run(&self) -> RunReport {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run every phase, abandoning the current one when `shutdown` resolves
    pub async fn run_with_shutdown<S>(&self, shutdown: S) -> RunReport
    where
        S: Future<Output = ()>,
    {
        let mut report = RunReport::new(&self.config.image_name);
        let span = info_span!("run", run_id = %report.run_id, image = %self.config.image_name);

        async {
            info!("Verification started");

            if let Err(e) = self.preflight().await {
                error!(error = %e, "Preflight failed");
                report.fail(Phase::Init, &e);
                report.finish();
                return;
            }

            let mut current = Phase::Init;
            let outcome = tokio::select! {
                result = self.run_phases(&mut report, &mut current) => result,
                _ = shutdown => Err(VerifyError::Interrupted),
            };

            if let Err(ref e) = outcome {
                error!(phase = %current, error = %e, "Verification failed");
                report.fail(current, e);
            }

            self.cleanup().await;
            report.cleaned_up = true;
            report.finish();

            if report.success() {
                info!(phases = report.phases.len(), "Verification succeeded");
            }
        }
        .instrument(span)
        .await;

        report
    }

    /// Checks run before anything is created; failures skip cleanup
    async fn preflight(&self) -> Result<()> {
        if self.config.source_url.is_none() && !self.config.source_dir.is_dir() {
            return Err(VerifyError::Precondition(format!(
                "Source directory {} does not exist",
                self.config.source_dir.display()
            )));
        }

        let needs_runtime_image = !self.config.checks.runtime_suite.is_empty();
        let mut required = vec![self.config.image_name.clone()];
        if needs_runtime_image {
            required.push(self.config.runtime_image_name());
        }

        for image in required {
            let present = self
                .runtime
                .image_exists(&image)
                .await
                .map_err(|e| VerifyError::Precondition(format!("Cannot query image {}: {}", image, e)))?;

            if !present {
                return Err(VerifyError::Precondition(format!(
                    "Image {} does not exist",
                    image
                )));
            }
        }

        Ok(())
    }

    async fn run_phases(&self, report: &mut RunReport, current: &mut Phase) -> Result<()> {
        self.step(report, current, Phase::Building, self.build_app()).await?;
        self.step(report, current, Phase::UsageChecked, self.check_usage()).await?;
        self.step(report, current, Phase::RuntimeBuilt, self.build_runtime_app()).await?;

        let app = self
            .step(report, current, Phase::AppRunning, self.start(Role::App, self.config.app_tag()))
            .await?;
        self.step(report, current, Phase::Verified, self.verify(&app, &self.app_suite))
            .await?;

        if self.config.checks.runtime_suite.is_empty() {
            info!("No runtime checks configured, skipping runtime application");
            return Ok(());
        }

        let runtime_app = self
            .step(
                report,
                current,
                Phase::RuntimeAppRunning,
                self.start(Role::RuntimeApp, self.config.runtime_app_tag()),
            )
            .await?;
        self.step(
            report,
            current,
            Phase::RuntimeVerified,
            self.verify(&runtime_app, &self.runtime_suite),
        )
        .await?;

        Ok(())
    }

    /// Run one phase, recording its timing on success
    async fn step<T, F>(
        &self,
        report: &mut RunReport,
        current: &mut Phase,
        phase: Phase,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        *current = phase;
        let started = Instant::now();
        info!(phase = %phase, "Phase started");

        let value = fut.await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        report.complete(phase, duration_ms);
        info!(phase = %phase, duration_ms, "Phase completed");
        Ok(value)
    }

    async fn build_app(&self) -> Result<()> {
        let request = BuildRequest::app(&self.config);
        self.build(&request, "build").await?;

        if self.config.build.incremental_rebuild {
            self.build(&request.incremental(), "incremental build").await?;
        }

        Ok(())
    }

    async fn build_runtime_app(&self) -> Result<()> {
        self.build(&BuildRequest::runtime_app(&self.config), "runtime build")
            .await
    }

    async fn build(&self, request: &BuildRequest, phase: &str) -> Result<()> {
        let code = self.builder.build(request).await?;
        tool_result("s2i", phase, code)
    }

    async fn check_usage(&self) -> Result<()> {
        let code = self.builder.usage(&self.config.image_name).await?;
        tool_result("s2i", "usage", code)
    }

    async fn start(&self, role: Role, image: String) -> Result<ContainerHandle> {
        let publish = vec![self.config.container.port, self.config.container.health_port];
        let handle = self
            .tracker
            .start(role, &image, publish, self.config.container_env())
            .await?;
        self.tracker.wait_ready(&handle).await?;
        Ok(handle)
    }

    async fn verify(&self, handle: &ContainerHandle, suite: &CheckSuite) -> Result<()> {
        suite.run(&self.tracker, handle).await?;
        self.tracker.stop(handle).await
    }

    /// Stop tracked containers and remove built images
    async fn cleanup(&self) {
        info!("Cleaning up");

        if let Err(e) = self.tracker.stop_all().await {
            warn!(error = %e, "Failed to stop containers");
        }

        if self.config.keep_images {
            info!("Keeping built images");
            return;
        }

        for image in [self.config.app_tag(), self.config.runtime_app_tag()] {
            if let Err(e) = self.tracker.remove_image(&image).await {
                warn!(image = %image, error = %e, "Failed to remove image");
            }
        }
    }
}

fn tool_result(tool: &str, phase: &str, code: i32) -> Result<()> {
    if code == 0 {
        return Ok(());
    }

    Err(VerifyError::ToolFailed {
        tool: tool.to_string(),
        phase: phase.to_string(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MockImageBuilder;
    use crate::probe::MockHttpProbe;
    use crate::runtime::MockContainerRuntime;
    use mockall::Sequence;

    fn config() -> VerifyConfig {
        VerifyConfig {
            image_name: "apicast".to_string(),
            source_url: Some("file:///src".to_string()),
            ..VerifyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_image_skips_cleanup() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_image_exists().returning(|_| Ok(false));
        runtime.expect_remove_image().never();

        let mut builder = MockImageBuilder::new();
        builder.expect_build().never();

        let orchestrator = Orchestrator::new(
            config(),
            Arc::new(builder),
            Arc::new(runtime),
            Arc::new(MockHttpProbe::new()),
        )
        .unwrap();

        let report = orchestrator.run().await;
        assert_eq!(report.exit_code, crate::error::EXIT_PRECONDITION);
        assert!(!report.cleaned_up);
        assert_eq!(report.failed_during, Some(Phase::Init));
    }

    #[tokio::test]
    async fn test_usage_failure_stops_before_runtime_build() {
        let mut seq = Sequence::new();
        let mut builder = MockImageBuilder::new();
        builder
            .expect_build()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|r| r.runtime_image.is_none())
            .returning(|_| Ok(0));
        builder
            .expect_usage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(3));

        let mut runtime = MockContainerRuntime::new();
        // Preflight finds both base images; cleanup finds no built images
        runtime
            .expect_image_exists()
            .returning(|image| Ok(!image.ends_with("testapp")));
        runtime.expect_run().never();

        let orchestrator = Orchestrator::new(
            config(),
            Arc::new(builder),
            Arc::new(runtime),
            Arc::new(MockHttpProbe::new()),
        )
        .unwrap();

        let report = orchestrator.run().await;
        assert_eq!(report.exit_code, 3);
        assert_eq!(report.last_completed, Phase::Building);
        assert_eq!(report.failed_during, Some(Phase::UsageChecked));
        assert!(report.cleaned_up);
    }

    #[tokio::test]
    async fn test_incremental_rebuild() {
        let mut cfg = config();
        cfg.build.incremental_rebuild = true;
        cfg.checks.runtime_suite = vec![];

        let mut seq = Sequence::new();
        let mut builder = MockImageBuilder::new();
        builder
            .expect_build()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|r| !r.incremental)
            .returning(|_| Ok(0));
        builder
            .expect_build()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|r| r.incremental && r.tag == "apicast-testapp")
            .returning(|_| Ok(1));

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_image_exists()
            .returning(|image| Ok(image == "apicast" || image == "apicast-testapp"));
        runtime
            .expect_remove_image()
            .withf(|image| image == "apicast-testapp")
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator = Orchestrator::new(
            cfg,
            Arc::new(builder),
            Arc::new(runtime),
            Arc::new(MockHttpProbe::new()),
        )
        .unwrap();

        let report = orchestrator.run().await;
        assert_eq!(report.exit_code, 1);
        assert_eq!(report.failed_during, Some(Phase::Building));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_and_cleans_up() {
        let mut builder = MockImageBuilder::new();
        builder.expect_build().returning(|_| Ok(0));
        builder.expect_usage().returning(|_| Ok(0));

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_image_exists()
            .returning(|image| Ok(!image.ends_with("testapp")));
        // Container never writes its id; the run hangs in readiness polling
        runtime.expect_run().returning(|_| Ok(0));

        let orchestrator = Orchestrator::new(
            config(),
            Arc::new(builder),
            Arc::new(runtime),
            Arc::new(MockHttpProbe::new()),
        )
        .unwrap();

        let report = orchestrator
            .run_with_shutdown(tokio::time::sleep(std::time::Duration::from_millis(50)))
            .await;

        assert_eq!(report.exit_code, crate::error::EXIT_INTERRUPTED);
        assert_eq!(report.failed_during, Some(Phase::AppRunning));
        assert!(report.cleaned_up);
        assert!(orchestrator.tracker().tracked_roles().await.is_empty());
    }
}
