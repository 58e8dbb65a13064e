use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::app::config::DeviceSettings;
use crate::app::error::RunError;
use crate::app::models::{DeviceSpec, Platform};
use crate::app::tools::Toolchain;

/// Boot progress of a single `start_device` call. Lives on the stack of that
/// call only; nothing persists it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Booting,
    WaitingForCompletion,
    Ready,
    Failed,
    TimedOut,
}

pub trait DeviceManager: Send + Sync {
    fn start_device(&self, spec: &DeviceSpec, trace_id: &str) -> Result<(), RunError>;

    /// Best-effort. Failures are logged, never propagated; the return value
    /// only feeds the step log.
    fn shutdown_device(&self, spec: &DeviceSpec, trace_id: &str) -> bool;
}

/// Picks the stateless strategy for the platform at call time.
pub fn device_manager_for(
    platform: Platform,
    toolchain: Arc<dyn Toolchain>,
    settings: DeviceSettings,
) -> Box<dyn DeviceManager> {
    match platform {
        Platform::Android => Box::new(AndroidDeviceManager::new(toolchain, settings)),
        Platform::Ios => Box::new(IosDeviceManager::new(toolchain, settings)),
    }
}

fn shutdown_best_effort(toolchain: &dyn Toolchain, spec: &DeviceSpec, trace_id: &str) -> bool {
    match toolchain.shutdown(spec, trace_id) {
        Ok(output) if output.ok() => {
            info!(trace_id = %trace_id, device = %spec.name, "device shut down");
            true
        }
        Ok(output) => {
            warn!(
                trace_id = %trace_id,
                device = %spec.name,
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "device shutdown reported failure; ignoring"
            );
            false
        }
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                device = %spec.name,
                error = %err,
                "device shutdown failed; ignoring"
            );
            false
        }
    }
}

pub struct AndroidDeviceManager {
    toolchain: Arc<dyn Toolchain>,
    settings: DeviceSettings,
}

impl AndroidDeviceManager {
    pub fn new(toolchain: Arc<dyn Toolchain>, settings: DeviceSettings) -> Self {
        Self { toolchain, settings }
    }
}

impl DeviceManager for AndroidDeviceManager {
    /// Spawns the emulator, then polls the boot-completion indicator at a
    /// fixed interval until it reads "1", the process dies, or the boot
    /// timeout elapses. The first read happens immediately so an
    /// already-booted device is Ready without waiting an interval.
    fn start_device(&self, spec: &DeviceSpec, trace_id: &str) -> Result<(), RunError> {
        let mut state = BootState::Booting;
        info!(trace_id = %trace_id, device = %spec.name, state = ?state, "starting device");

        let started = Instant::now();
        let mut boot = self.toolchain.boot(spec, trace_id)?;
        state = BootState::WaitingForCompletion;
        info!(trace_id = %trace_id, device = %spec.name, state = ?state, "boot issued");

        let deadline = started + self.settings.boot_timeout();
        loop {
            if let Some(code) = boot.poll_exit() {
                state = BootState::Failed;
                warn!(trace_id = %trace_id, device = %spec.name, state = ?state, exit_code = code, "boot process exited early");
                return Err(RunError::process(
                    format!("Boot process for {} exited early with status {code}", spec.name),
                    trace_id,
                ));
            }

            match self.toolchain.boot_indicator(spec, trace_id) {
                Ok(value) if value.trim() == "1" => {
                    state = BootState::Ready;
                    info!(
                        trace_id = %trace_id,
                        device = %spec.name,
                        state = ?state,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "device ready"
                    );
                    return Ok(());
                }
                Ok(_) => {}
                // A device mid-boot rejects shell queries; that reads as
                // "not yet", the same as an explicit "0".
                Err(err) => {
                    warn!(trace_id = %trace_id, device = %spec.name, error = %err, "boot indicator query failed; treating as not ready");
                }
            }

            if Instant::now() >= deadline {
                state = BootState::TimedOut;
                warn!(trace_id = %trace_id, device = %spec.name, state = ?state, "boot timed out; terminating boot process");
                boot.terminate();
                return Err(RunError::boot_timeout(
                    format!(
                        "Device {} did not finish booting within {}ms",
                        spec.name, self.settings.boot_timeout_ms
                    ),
                    trace_id,
                ));
            }
            std::thread::sleep(self.settings.boot_poll_interval());
        }
    }

    fn shutdown_device(&self, spec: &DeviceSpec, trace_id: &str) -> bool {
        shutdown_best_effort(self.toolchain.as_ref(), spec, trace_id)
    }
}

pub struct IosDeviceManager {
    toolchain: Arc<dyn Toolchain>,
    #[allow(dead_code)]
    settings: DeviceSettings,
}

impl IosDeviceManager {
    pub fn new(toolchain: Arc<dyn Toolchain>, settings: DeviceSettings) -> Self {
        Self { toolchain, settings }
    }
}

impl DeviceManager for IosDeviceManager {
    /// The simulator boot tool blocks until the device is up, so one exit
    /// check replaces indicator polling. The UI shell must be opened before
    /// installs are accepted.
    fn start_device(&self, spec: &DeviceSpec, trace_id: &str) -> Result<(), RunError> {
        let state = BootState::Booting;
        info!(trace_id = %trace_id, device = %spec.name, state = ?state, "starting device");

        let mut boot = self.toolchain.boot(spec, trace_id)?;
        match boot.poll_exit() {
            Some(0) => {}
            Some(code) => {
                warn!(trace_id = %trace_id, device = %spec.name, state = ?BootState::Failed, exit_code = code, "boot failed");
                return Err(RunError::process(
                    format!("Boot of {} failed with status {code}", spec.name),
                    trace_id,
                ));
            }
            None => {
                boot.terminate();
                return Err(RunError::process(
                    format!("Boot tool for {} still running after blocking boot", spec.name),
                    trace_id,
                ));
            }
        }

        let shell = self.toolchain.open_ui_shell(spec, trace_id)?;
        if !shell.ok() {
            warn!(trace_id = %trace_id, device = %spec.name, state = ?BootState::Failed, exit_code = ?shell.exit_code, "opening UI shell failed");
            return Err(RunError::process(
                format!("Opening the UI shell for {} failed: {}", spec.name, shell.stderr.trim()),
                trace_id,
            ));
        }

        info!(trace_id = %trace_id, device = %spec.name, state = ?BootState::Ready, "device ready");
        Ok(())
    }

    fn shutdown_device(&self, spec: &DeviceSpec, trace_id: &str) -> bool {
        shutdown_best_effort(self.toolchain.as_ref(), spec, trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tools::process::CommandOutput;
    use crate::app::tools::BootProcess;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeBoot {
        exit_code: Option<i32>,
        terminated: Arc<AtomicBool>,
    }

    impl BootProcess for FakeBoot {
        fn poll_exit(&mut self) -> Option<i32> {
            self.exit_code
        }

        fn terminate(&mut self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedToolchain {
        boot_exit: Option<i32>,
        boot_terminated: Arc<AtomicBool>,
        indicator_script: Mutex<Vec<String>>,
        indicator_reads: AtomicUsize,
        shell_exit: i32,
        shutdown_fails: bool,
        shutdown_calls: AtomicUsize,
    }

    fn output(exit_code: i32) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(exit_code),
        }
    }

    impl Toolchain for ScriptedToolchain {
        fn boot(
            &self,
            _spec: &DeviceSpec,
            _trace_id: &str,
        ) -> Result<Box<dyn BootProcess>, RunError> {
            Ok(Box::new(FakeBoot {
                exit_code: self.boot_exit,
                terminated: Arc::clone(&self.boot_terminated),
            }))
        }

        fn boot_indicator(&self, _spec: &DeviceSpec, _trace_id: &str) -> Result<String, RunError> {
            let index = self.indicator_reads.fetch_add(1, Ordering::SeqCst);
            let script = self.indicator_script.lock().expect("script");
            Ok(script
                .get(index)
                .cloned()
                .unwrap_or_else(|| script.last().cloned().unwrap_or_else(|| "0".to_string())))
        }

        fn open_ui_shell(&self, _spec: &DeviceSpec, _trace_id: &str) -> Result<CommandOutput, RunError> {
            Ok(output(self.shell_exit))
        }

        fn shutdown(&self, _spec: &DeviceSpec, trace_id: &str) -> Result<CommandOutput, RunError> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            if self.shutdown_fails {
                Err(RunError::system("no emulator console", trace_id))
            } else {
                Ok(output(0))
            }
        }

        fn install(&self, _spec: &DeviceSpec, _path: &str, _trace_id: &str) -> Result<CommandOutput, RunError> {
            Ok(output(0))
        }

        fn uninstall(&self, _spec: &DeviceSpec, _id: &str, _trace_id: &str) -> Result<CommandOutput, RunError> {
            Ok(output(0))
        }

        fn launch(&self, _spec: &DeviceSpec, _id: &str, _trace_id: &str) -> Result<CommandOutput, RunError> {
            Ok(output(0))
        }

        fn capture_ui_tree(&self, _spec: &DeviceSpec, _trace_id: &str) -> Result<String, RunError> {
            Ok("<hierarchy/>".to_string())
        }
    }

    fn android_spec() -> DeviceSpec {
        DeviceSpec {
            platform: Platform::Android,
            name: "pixel_6_api_34".to_string(),
            serial: Some("emulator-5554".to_string()),
        }
    }

    fn ios_spec() -> DeviceSpec {
        DeviceSpec {
            platform: Platform::Ios,
            name: "iPhone 15".to_string(),
            serial: None,
        }
    }

    fn fast_settings() -> DeviceSettings {
        DeviceSettings {
            boot_timeout_ms: 2_000,
            boot_poll_interval_ms: 40,
        }
    }

    #[test]
    fn android_ready_only_after_third_indicator_read() {
        let toolchain = Arc::new(ScriptedToolchain {
            indicator_script: Mutex::new(vec!["0".into(), "0".into(), "1".into()]),
            ..ScriptedToolchain::default()
        });
        let manager = AndroidDeviceManager::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_settings());

        let started = Instant::now();
        manager
            .start_device(&android_spec(), "trace-boot")
            .expect("boot should succeed");
        let elapsed = started.elapsed();

        assert_eq!(toolchain.indicator_reads.load(Ordering::SeqCst), 3);
        // Two full poll intervals must pass before the third read.
        assert!(elapsed >= Duration::from_millis(80), "ready too early: {elapsed:?}");
    }

    #[test]
    fn android_early_process_exit_is_a_process_error() {
        let toolchain = Arc::new(ScriptedToolchain {
            boot_exit: Some(1),
            indicator_script: Mutex::new(vec!["0".into()]),
            ..ScriptedToolchain::default()
        });
        let manager = AndroidDeviceManager::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_settings());

        let err = manager
            .start_device(&android_spec(), "trace-early-exit")
            .expect_err("boot should fail");
        assert!(err.is("ERR_PROCESS"));
    }

    #[test]
    fn android_boot_timeout_terminates_the_boot_process() {
        let toolchain = Arc::new(ScriptedToolchain {
            indicator_script: Mutex::new(vec!["0".into()]),
            ..ScriptedToolchain::default()
        });
        let settings = DeviceSettings {
            boot_timeout_ms: 150,
            boot_poll_interval_ms: 30,
        };
        let manager = AndroidDeviceManager::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, settings);

        let err = manager
            .start_device(&android_spec(), "trace-timeout")
            .expect_err("boot should time out");
        assert!(err.is("ERR_BOOT_TIMEOUT"));
        assert!(toolchain.boot_terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn ios_boot_and_shell_succeed() {
        let toolchain = Arc::new(ScriptedToolchain {
            boot_exit: Some(0),
            ..ScriptedToolchain::default()
        });
        let manager = IosDeviceManager::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_settings());
        manager
            .start_device(&ios_spec(), "trace-ios")
            .expect("boot should succeed");
    }

    #[test]
    fn ios_shell_failure_is_a_process_error() {
        let toolchain = Arc::new(ScriptedToolchain {
            boot_exit: Some(0),
            shell_exit: 1,
            ..ScriptedToolchain::default()
        });
        let manager = IosDeviceManager::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_settings());
        let err = manager
            .start_device(&ios_spec(), "trace-ios-shell")
            .expect_err("shell step should fail");
        assert!(err.is("ERR_PROCESS"));
    }

    #[test]
    fn shutdown_failures_are_swallowed_and_idempotent() {
        let toolchain = Arc::new(ScriptedToolchain {
            shutdown_fails: true,
            ..ScriptedToolchain::default()
        });
        let manager = AndroidDeviceManager::new(Arc::clone(&toolchain) as Arc<dyn Toolchain>, fast_settings());

        assert!(!manager.shutdown_device(&android_spec(), "trace-shutdown"));
        // Second shutdown of an already-stopped device: still swallowed.
        assert!(!manager.shutdown_device(&android_spec(), "trace-shutdown"));
        assert_eq!(toolchain.shutdown_calls.load(Ordering::SeqCst), 2);
    }
}
