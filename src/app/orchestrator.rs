use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::apps::{app_manager_for, AppManager};
use crate::app::config::FarmConfig;
use crate::app::device::device_manager_for;
use crate::app::error::RunError;
use crate::app::locks::DeviceLockRegistry;
use crate::app::models::{
    DeviceSpec, ElementQuery, ExecutionStep, RunReport, RunRequest,
};
use crate::app::tools::Toolchain;
use crate::app::watcher::ElementWatcher;

pub const METRIC_APP_STARTUP: &str = "App Startup Time";
pub const METRIC_LAUNCH_DURATION: &str = "launchDuration";

const ACTION_START_DEVICE: &str = "start_device";
const ACTION_INSTALL_APP: &str = "install_app";
const ACTION_LAUNCH_APP: &str = "launch_app";
const ACTION_MEASURE: &str = "measure_metric";
const ACTION_UNINSTALL_APP: &str = "uninstall_app";
const ACTION_SHUTDOWN_DEVICE: &str = "shutdown_device";

fn step(action: &str, target: Option<String>) -> ExecutionStep {
    ExecutionStep {
        action: action.to_string(),
        target,
        value: None,
        metric: None,
        success: true,
        error: None,
        timestamp: Utc::now().to_rfc3339(),
    }
}

fn failed_step(action: &str, target: Option<String>, error: String) -> ExecutionStep {
    ExecutionStep {
        success: false,
        error: Some(error),
        ..step(action, target)
    }
}

/// Runs one end-to-end measurement: start the device, install the build,
/// measure, then tear down. One run at a time per orchestrator, and the
/// per-device lock keeps two orchestrators off the same device.
pub struct TestOrchestrator {
    toolchain: Arc<dyn Toolchain>,
    config: FarmConfig,
    locks: Arc<DeviceLockRegistry>,
}

impl TestOrchestrator {
    pub fn new(toolchain: Arc<dyn Toolchain>, config: FarmConfig) -> Self {
        Self::with_locks(toolchain, config, Arc::new(DeviceLockRegistry::new()))
    }

    /// Orchestrators that share a lock registry serialize runs against the
    /// same device.
    pub fn with_locks(
        toolchain: Arc<dyn Toolchain>,
        config: FarmConfig,
        locks: Arc<DeviceLockRegistry>,
    ) -> Self {
        Self {
            toolchain,
            config,
            locks,
        }
    }

    pub fn run(&self, request: &RunRequest) -> RunReport {
        let trace_id = Uuid::new_v4().to_string();
        self.run_with_trace(request, &trace_id)
    }

    pub fn run_with_trace(&self, request: &RunRequest, trace_id: &str) -> RunReport {
        let spec = DeviceSpec::from_request(request);
        let lock = self.locks.lock_for(spec.lock_key());
        let _guard = lock.lock().expect("device lock poisoned");

        info!(
            trace_id = %trace_id,
            platform = %spec.platform.as_str(),
            device = %spec.name,
            app_id = %request.app_id,
            metric = %request.metric_name,
            "test run started"
        );

        let devices = device_manager_for(
            spec.platform,
            Arc::clone(&self.toolchain),
            self.config.device.clone(),
        );
        let apps = app_manager_for(spec.platform, Arc::clone(&self.toolchain));

        let mut steps: Vec<ExecutionStep> = Vec::new();

        // Nothing was started if boot fails, so there is nothing to tear down.
        if let Err(err) = devices.start_device(&spec, trace_id) {
            steps.push(failed_step(
                ACTION_START_DEVICE,
                Some(spec.name.clone()),
                err.to_string(),
            ));
            return self.finish(request, trace_id, steps, Some(err));
        }
        steps.push(step(ACTION_START_DEVICE, Some(spec.name.clone())));

        // From here on the device is up: shutdown is always attempted, even
        // when install or the measurement fails.
        let fatal = match apps.install(&spec, &request.app_path, trace_id) {
            Err(err) => {
                steps.push(failed_step(
                    ACTION_INSTALL_APP,
                    Some(request.app_path.clone()),
                    err.to_string(),
                ));
                // Nothing was installed; uninstall is skipped.
                Some(err)
            }
            Ok(()) => {
                steps.push(step(ACTION_INSTALL_APP, Some(request.app_path.clone())));

                let fatal = self.measure(request, &spec, apps.as_ref(), trace_id, &mut steps);

                let clean = apps.uninstall(&spec, &request.app_id, trace_id);
                steps.push(if clean {
                    step(ACTION_UNINSTALL_APP, Some(request.app_id.clone()))
                } else {
                    failed_step(
                        ACTION_UNINSTALL_APP,
                        Some(request.app_id.clone()),
                        "Uninstall failed; ignored".to_string(),
                    )
                });
                fatal
            }
        };

        let clean = devices.shutdown_device(&spec, trace_id);
        steps.push(if clean {
            step(ACTION_SHUTDOWN_DEVICE, Some(spec.name.clone()))
        } else {
            failed_step(
                ACTION_SHUTDOWN_DEVICE,
                Some(spec.name.clone()),
                "Shutdown failed; ignored".to_string(),
            )
        });

        self.finish(request, trace_id, steps, fatal)
    }

    /// Dispatches on the metric name. Only the app-startup metric maps to the
    /// element watcher; anything else records an empty result.
    fn measure(
        &self,
        request: &RunRequest,
        spec: &DeviceSpec,
        apps: &dyn AppManager,
        trace_id: &str,
        steps: &mut Vec<ExecutionStep>,
    ) -> Option<RunError> {
        if !matches!(
            request.metric_name.as_str(),
            METRIC_APP_STARTUP | METRIC_LAUNCH_DURATION
        ) {
            warn!(
                trace_id = %trace_id,
                metric = %request.metric_name,
                "unknown metric; nothing measured"
            );
            let mut empty = step(ACTION_MEASURE, Some(request.target_identifier.clone()));
            empty.metric = Some(HashMap::new());
            steps.push(empty);
            return None;
        }

        // The pipeline start is the measurement origin, so the app must be
        // launched immediately before the watcher spins up.
        if let Err(err) = apps.launch(spec, &request.app_id, trace_id) {
            steps.push(failed_step(
                ACTION_LAUNCH_APP,
                Some(request.app_id.clone()),
                err.to_string(),
            ));
            return Some(err);
        }
        steps.push(step(ACTION_LAUNCH_APP, Some(request.app_id.clone())));

        let budget_ms = request
            .timeout_budget_ms
            .unwrap_or(self.config.watcher.default_timeout_ms);
        let query = ElementQuery {
            target_identifier: request.target_identifier.clone(),
            timeout_budget: Duration::from_millis(budget_ms),
        };
        let watcher = ElementWatcher::new(Arc::clone(&self.toolchain), self.config.watcher.clone());

        match watcher.watch(spec, &query, trace_id) {
            Ok(result) => {
                let mut measured = step(ACTION_MEASURE, Some(request.target_identifier.clone()));
                measured.value = Some(result.elapsed_ms.to_string());
                measured.metric = Some(HashMap::from([(
                    request.metric_name.clone(),
                    serde_json::json!(result.elapsed_ms),
                )]));
                steps.push(measured);
                None
            }
            Err(err) => {
                let mut missed = failed_step(
                    ACTION_MEASURE,
                    Some(request.target_identifier.clone()),
                    err.to_string(),
                );
                missed.metric = Some(HashMap::new());
                steps.push(missed);
                Some(err)
            }
        }
    }

    fn finish(
        &self,
        request: &RunRequest,
        trace_id: &str,
        steps: Vec<ExecutionStep>,
        error: Option<RunError>,
    ) -> RunReport {
        match &error {
            Some(err) => warn!(
                trace_id = %trace_id,
                app_id = %request.app_id,
                error = %err,
                steps = steps.len(),
                "test run failed"
            ),
            None => info!(
                trace_id = %trace_id,
                app_id = %request.app_id,
                steps = steps.len(),
                "test run finished"
            ),
        }
        RunReport {
            trace_id: trace_id.to_string(),
            steps,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::{DeviceSettings, WatcherSettings};
    use crate::app::models::Platform;
    use crate::app::tools::process::CommandOutput;
    use crate::app::tools::BootProcess;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;

    const TARGET: &str = "com.example:id/home";

    struct NoopBoot;

    impl BootProcess for NoopBoot {
        fn poll_exit(&mut self) -> Option<i32> {
            None
        }

        fn terminate(&mut self) {}
    }

    /// Full scripted device: boots instantly, install/uninstall/shutdown are
    /// switchable, and the target element starts matching a fixed delay
    /// after launch.
    struct FarmToolchain {
        install_ok: bool,
        uninstall_ok: bool,
        shutdown_ok: bool,
        element_appears_after: Option<Duration>,
        launched_at: Mutex<Option<Instant>>,
        boots: AtomicUsize,
        installs: AtomicUsize,
        launches: AtomicUsize,
        uninstalls: AtomicUsize,
        shutdowns: AtomicUsize,
        captures: AtomicUsize,
    }

    impl Default for FarmToolchain {
        fn default() -> Self {
            Self {
                install_ok: true,
                uninstall_ok: true,
                shutdown_ok: true,
                element_appears_after: Some(Duration::from_millis(150)),
                launched_at: Mutex::new(None),
                boots: AtomicUsize::new(0),
                installs: AtomicUsize::new(0),
                launches: AtomicUsize::new(0),
                uninstalls: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                captures: AtomicUsize::new(0),
            }
        }
    }

    fn output(exit_code: i32) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(exit_code),
        }
    }

    impl Toolchain for FarmToolchain {
        fn boot(&self, _spec: &DeviceSpec, _trace_id: &str) -> Result<Box<dyn BootProcess>, RunError> {
            self.boots.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NoopBoot))
        }

        fn boot_indicator(&self, _spec: &DeviceSpec, _trace_id: &str) -> Result<String, RunError> {
            Ok("1".to_string())
        }

        fn open_ui_shell(&self, _spec: &DeviceSpec, _trace_id: &str) -> Result<CommandOutput, RunError> {
            Ok(output(0))
        }

        fn shutdown(&self, _spec: &DeviceSpec, trace_id: &str) -> Result<CommandOutput, RunError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.shutdown_ok {
                Ok(output(0))
            } else {
                Err(RunError::system("emulator console unreachable", trace_id))
            }
        }

        fn install(&self, _spec: &DeviceSpec, _path: &str, _trace_id: &str) -> Result<CommandOutput, RunError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self.install_ok {
                Ok(CommandOutput {
                    stdout: "Success".to_string(),
                    stderr: String::new(),
                    exit_code: Some(0),
                })
            } else {
                Ok(CommandOutput {
                    stdout: "Failure [INSTALL_FAILED_INVALID_APK]".to_string(),
                    stderr: String::new(),
                    exit_code: Some(1),
                })
            }
        }

        fn uninstall(&self, _spec: &DeviceSpec, _id: &str, trace_id: &str) -> Result<CommandOutput, RunError> {
            self.uninstalls.fetch_add(1, Ordering::SeqCst);
            if self.uninstall_ok {
                Ok(output(0))
            } else {
                Err(RunError::system("package service gone", trace_id))
            }
        }

        fn launch(&self, _spec: &DeviceSpec, _id: &str, _trace_id: &str) -> Result<CommandOutput, RunError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            *self.launched_at.lock().expect("launched_at") = Some(Instant::now());
            Ok(output(0))
        }

        fn capture_ui_tree(&self, _spec: &DeviceSpec, _trace_id: &str) -> Result<String, RunError> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            let launched = *self.launched_at.lock().expect("launched_at");
            let visible = match (launched, self.element_appears_after) {
                (Some(at), Some(delay)) => at.elapsed() >= delay,
                _ => false,
            };
            if visible {
                Ok(format!(
                    "<hierarchy><node resource-id=\"{TARGET}\" clickable=\"true\" enabled=\"true\" bounds=\"[0,0][1080,210]\" /></hierarchy>"
                ))
            } else {
                Ok("<hierarchy><node resource-id=\"\" clickable=\"false\" enabled=\"true\" bounds=\"[0,0][1080,1920]\" /></hierarchy>".to_string())
            }
        }
    }

    fn fast_config() -> FarmConfig {
        FarmConfig {
            device: DeviceSettings {
                boot_timeout_ms: 2_000,
                boot_poll_interval_ms: 20,
            },
            watcher: WatcherSettings {
                producers: 2,
                analyzers: 2,
                queue_capacity: 10,
                poll_interval_ms: 20,
                default_timeout_ms: 3_000,
                shutdown_grace_ms: 300,
            },
            ..FarmConfig::default()
        }
    }

    fn request(metric_name: &str, app_path: &str) -> RunRequest {
        RunRequest {
            platform: Platform::Android,
            device_name: "pixel_6_api_34".to_string(),
            device_serial: Some("emulator-5554".to_string()),
            app_path: app_path.to_string(),
            app_id: "com.example.app".to_string(),
            metric_name: metric_name.to_string(),
            target_identifier: TARGET.to_string(),
            timeout_budget_ms: None,
        }
    }

    fn write_fake_apk(dir: &TempDir) -> String {
        let path = dir.path().join("app.apk");
        let file = std::fs::File::create(&path).expect("create apk");
        let mut archive = zip::ZipWriter::new(file);
        archive
            .start_file("AndroidManifest.xml", zip::write::FileOptions::<()>::default())
            .expect("start file");
        archive.write_all(b"<manifest/>").expect("write manifest");
        archive.finish().expect("finish apk");
        path.to_string_lossy().to_string()
    }

    fn find_step<'a>(report: &'a RunReport, action: &str) -> Option<&'a ExecutionStep> {
        report.steps.iter().find(|s| s.action == action)
    }

    #[test]
    fn startup_time_run_measures_close_to_the_appearance_delay() {
        let tmp = TempDir::new().expect("tmp");
        let apk = write_fake_apk(&tmp);
        let toolchain = Arc::new(FarmToolchain::default());
        let orchestrator =
            TestOrchestrator::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_config());

        let report = orchestrator.run(&request(METRIC_APP_STARTUP, &apk));

        assert!(report.succeeded(), "unexpected error: {:?}", report.error);
        let measured = find_step(&report, ACTION_MEASURE).expect("measure step");
        assert!(measured.success);
        let metric = measured.metric.as_ref().expect("metric map");
        let elapsed = metric
            .get(METRIC_APP_STARTUP)
            .and_then(|v| v.as_u64())
            .expect("elapsed value");
        // The element appears 150ms after launch; with two producers the
        // reported value must trail that by at most one sampling period.
        assert!((140..=600).contains(&elapsed), "elapsed {elapsed}ms");

        assert_eq!(toolchain.launches.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.uninstalls.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.shutdowns.load(Ordering::SeqCst), 1);
        assert!(find_step(&report, ACTION_UNINSTALL_APP).expect("uninstall step").success);
        assert!(find_step(&report, ACTION_SHUTDOWN_DEVICE).expect("shutdown step").success);
    }

    #[test]
    fn unknown_metric_still_installs_and_uninstalls() {
        let tmp = TempDir::new().expect("tmp");
        let apk = write_fake_apk(&tmp);
        let toolchain = Arc::new(FarmToolchain::default());
        let orchestrator =
            TestOrchestrator::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_config());

        let report = orchestrator.run(&request("Unknown Metric", &apk));

        assert!(report.succeeded(), "unexpected error: {:?}", report.error);
        assert_eq!(toolchain.installs.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.uninstalls.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.launches.load(Ordering::SeqCst), 0);

        let measured = find_step(&report, ACTION_MEASURE).expect("measure step");
        assert!(measured.success);
        assert_eq!(measured.metric.as_ref().map(|m| m.len()), Some(0));
    }

    #[test]
    fn failed_install_skips_uninstall_but_still_shuts_down() {
        let tmp = TempDir::new().expect("tmp");
        let apk = write_fake_apk(&tmp);
        let toolchain = Arc::new(FarmToolchain {
            install_ok: false,
            ..FarmToolchain::default()
        });
        let orchestrator =
            TestOrchestrator::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_config());

        let report = orchestrator.run(&request(METRIC_APP_STARTUP, &apk));

        let err = report.error.as_ref().expect("install error");
        assert!(err.is("ERR_INSTALL"));
        assert_eq!(toolchain.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.uninstalls.load(Ordering::SeqCst), 0);
        assert_eq!(toolchain.launches.load(Ordering::SeqCst), 0);
        assert!(!find_step(&report, ACTION_INSTALL_APP).expect("install step").success);
    }

    #[test]
    fn element_timeout_still_tears_down() {
        let tmp = TempDir::new().expect("tmp");
        let apk = write_fake_apk(&tmp);
        let toolchain = Arc::new(FarmToolchain {
            element_appears_after: None,
            ..FarmToolchain::default()
        });
        let mut config = fast_config();
        config.watcher.default_timeout_ms = 400;
        let orchestrator =
            TestOrchestrator::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, config);

        let report = orchestrator.run(&request(METRIC_LAUNCH_DURATION, &apk));

        let err = report.error.as_ref().expect("timeout error");
        assert!(err.is("ERR_ELEMENT_TIMEOUT"));
        let missed = find_step(&report, ACTION_MEASURE).expect("measure step");
        assert!(!missed.success);
        assert!(missed.error.as_ref().expect("error detail").contains(TARGET));
        // Teardown still ran.
        assert_eq!(toolchain.uninstalls.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_failures_never_become_the_run_error() {
        let tmp = TempDir::new().expect("tmp");
        let apk = write_fake_apk(&tmp);
        let toolchain = Arc::new(FarmToolchain {
            uninstall_ok: false,
            shutdown_ok: false,
            ..FarmToolchain::default()
        });
        let orchestrator =
            TestOrchestrator::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_config());

        let report = orchestrator.run(&request(METRIC_APP_STARTUP, &apk));

        assert!(report.succeeded(), "teardown failure escalated: {:?}", report.error);
        assert!(!find_step(&report, ACTION_UNINSTALL_APP).expect("uninstall step").success);
        assert!(!find_step(&report, ACTION_SHUTDOWN_DEVICE).expect("shutdown step").success);
    }

    #[test]
    fn boot_failure_attempts_nothing_else() {
        struct DeadBoot;

        impl BootProcess for DeadBoot {
            fn poll_exit(&mut self) -> Option<i32> {
                Some(1)
            }

            fn terminate(&mut self) {}
        }

        struct DeadBootToolchain {
            inner: FarmToolchain,
        }

        impl Toolchain for DeadBootToolchain {
            fn boot(&self, spec: &DeviceSpec, trace_id: &str) -> Result<Box<dyn BootProcess>, RunError> {
                self.inner.boot(spec, trace_id)?;
                Ok(Box::new(DeadBoot))
            }

            fn boot_indicator(&self, _spec: &DeviceSpec, _trace_id: &str) -> Result<String, RunError> {
                Ok("0".to_string())
            }

            fn open_ui_shell(&self, spec: &DeviceSpec, trace_id: &str) -> Result<CommandOutput, RunError> {
                self.inner.open_ui_shell(spec, trace_id)
            }

            fn shutdown(&self, spec: &DeviceSpec, trace_id: &str) -> Result<CommandOutput, RunError> {
                self.inner.shutdown(spec, trace_id)
            }

            fn install(&self, spec: &DeviceSpec, path: &str, trace_id: &str) -> Result<CommandOutput, RunError> {
                self.inner.install(spec, path, trace_id)
            }

            fn uninstall(&self, spec: &DeviceSpec, id: &str, trace_id: &str) -> Result<CommandOutput, RunError> {
                self.inner.uninstall(spec, id, trace_id)
            }

            fn launch(&self, spec: &DeviceSpec, id: &str, trace_id: &str) -> Result<CommandOutput, RunError> {
                self.inner.launch(spec, id, trace_id)
            }

            fn capture_ui_tree(&self, spec: &DeviceSpec, trace_id: &str) -> Result<String, RunError> {
                self.inner.capture_ui_tree(spec, trace_id)
            }
        }

        let tmp = TempDir::new().expect("tmp");
        let apk = write_fake_apk(&tmp);
        let toolchain = Arc::new(DeadBootToolchain {
            inner: FarmToolchain::default(),
        });
        let orchestrator =
            TestOrchestrator::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_config());

        let report = orchestrator.run(&request(METRIC_APP_STARTUP, &apk));

        let err = report.error.as_ref().expect("boot error");
        assert!(err.is("ERR_PROCESS"));
        assert_eq!(report.steps.len(), 1);
        assert_eq!(toolchain.inner.installs.load(Ordering::SeqCst), 0);
        assert_eq!(toolchain.inner.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn report_serializes_with_step_document_fields() {
        let tmp = TempDir::new().expect("tmp");
        let apk = write_fake_apk(&tmp);
        let toolchain = Arc::new(FarmToolchain::default());
        let orchestrator =
            TestOrchestrator::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_config());

        let report = orchestrator.run(&request(METRIC_APP_STARTUP, &apk));
        let json = serde_json::to_value(&report).expect("serialize report");

        let steps = json["steps"].as_array().expect("steps array");
        assert!(!steps.is_empty());
        for step in steps {
            assert!(step.get("action").is_some());
            assert!(step.get("success").is_some());
            assert!(step.get("timestamp").is_some());
        }
        assert!(json.get("error").is_none());
    }
}
