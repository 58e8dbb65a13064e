pub mod android;
pub mod ios;
pub mod process;

use crate::app::config::{DeviceSettings, FarmConfig, InstallSettings, ToolSettings};
use crate::app::error::RunError;
use crate::app::models::{DeviceSpec, Platform};

use process::{CommandOutput, SpawnedTool};

/// Handle on an issued boot. Android hands back the live emulator process;
/// iOS boots synchronously, so its handle is already exited when returned.
pub trait BootProcess: Send {
    /// `Some(code)` once the process has exited.
    fn poll_exit(&mut self) -> Option<i32>;
    fn terminate(&mut self);
}

impl BootProcess for SpawnedTool {
    fn poll_exit(&mut self) -> Option<i32> {
        self.try_exit()
    }

    fn terminate(&mut self) {
        self.kill();
    }
}

struct CompletedBoot {
    exit_code: Option<i32>,
}

impl BootProcess for CompletedBoot {
    fn poll_exit(&mut self) -> Option<i32> {
        Some(self.exit_code.unwrap_or(-1))
    }

    fn terminate(&mut self) {}
}

/// The platform capability the core consumes. One implementation shells out
/// to the real host tools; tests substitute scripted doubles.
pub trait Toolchain: Send + Sync {
    fn boot(&self, spec: &DeviceSpec, trace_id: &str) -> Result<Box<dyn BootProcess>, RunError>;
    fn boot_indicator(&self, spec: &DeviceSpec, trace_id: &str) -> Result<String, RunError>;
    fn open_ui_shell(&self, spec: &DeviceSpec, trace_id: &str) -> Result<CommandOutput, RunError>;
    fn shutdown(&self, spec: &DeviceSpec, trace_id: &str) -> Result<CommandOutput, RunError>;
    fn install(
        &self,
        spec: &DeviceSpec,
        app_path: &str,
        trace_id: &str,
    ) -> Result<CommandOutput, RunError>;
    fn uninstall(
        &self,
        spec: &DeviceSpec,
        app_id: &str,
        trace_id: &str,
    ) -> Result<CommandOutput, RunError>;
    fn launch(
        &self,
        spec: &DeviceSpec,
        app_id: &str,
        trace_id: &str,
    ) -> Result<CommandOutput, RunError>;
    fn capture_ui_tree(&self, spec: &DeviceSpec, trace_id: &str) -> Result<String, RunError>;
}

/// Shells out to `adb`/`emulator` for Android and `xcrun simctl` (plus the
/// configured accessibility-dump tool) for iOS. Stateless; programs and
/// flags come from settings.
pub struct HostToolchain {
    tools: ToolSettings,
    install: InstallSettings,
    device: DeviceSettings,
}

impl HostToolchain {
    pub fn new(config: &FarmConfig) -> Self {
        Self {
            tools: config.tools.clone(),
            install: config.install.clone(),
            device: config.device.clone(),
        }
    }
}

impl Toolchain for HostToolchain {
    fn boot(&self, spec: &DeviceSpec, trace_id: &str) -> Result<Box<dyn BootProcess>, RunError> {
        match spec.platform {
            Platform::Android => {
                let process = android::boot(&self.tools, spec, trace_id)?;
                Ok(Box::new(process))
            }
            Platform::Ios => {
                let output = ios::boot(&self.tools, spec, self.device.boot_timeout(), trace_id)?;
                Ok(Box::new(CompletedBoot {
                    exit_code: output.exit_code,
                }))
            }
        }
    }

    fn boot_indicator(&self, spec: &DeviceSpec, trace_id: &str) -> Result<String, RunError> {
        match spec.platform {
            Platform::Android => android::boot_indicator(&self.tools, spec, trace_id),
            Platform::Ios => Err(RunError::system(
                "Boot indicator polling is Android-only",
                trace_id,
            )),
        }
    }

    fn open_ui_shell(&self, spec: &DeviceSpec, trace_id: &str) -> Result<CommandOutput, RunError> {
        match spec.platform {
            Platform::Android => Err(RunError::system(
                "The UI shell step is iOS-only",
                trace_id,
            )),
            Platform::Ios => ios::open_ui_shell(&self.tools, trace_id),
        }
    }

    fn shutdown(&self, spec: &DeviceSpec, trace_id: &str) -> Result<CommandOutput, RunError> {
        match spec.platform {
            Platform::Android => android::shutdown(&self.tools, spec, trace_id),
            Platform::Ios => ios::shutdown(&self.tools, spec, trace_id),
        }
    }

    fn install(
        &self,
        spec: &DeviceSpec,
        app_path: &str,
        trace_id: &str,
    ) -> Result<CommandOutput, RunError> {
        match spec.platform {
            Platform::Android => {
                android::install(&self.tools, &self.install, spec, app_path, trace_id)
            }
            Platform::Ios => ios::install(
                &self.tools,
                spec,
                app_path,
                self.install.install_timeout(),
                trace_id,
            ),
        }
    }

    fn uninstall(
        &self,
        spec: &DeviceSpec,
        app_id: &str,
        trace_id: &str,
    ) -> Result<CommandOutput, RunError> {
        match spec.platform {
            Platform::Android => android::uninstall(&self.tools, spec, app_id, trace_id),
            Platform::Ios => ios::uninstall(&self.tools, spec, app_id, trace_id),
        }
    }

    fn launch(
        &self,
        spec: &DeviceSpec,
        app_id: &str,
        trace_id: &str,
    ) -> Result<CommandOutput, RunError> {
        match spec.platform {
            Platform::Android => android::launch(&self.tools, spec, app_id, trace_id),
            Platform::Ios => ios::launch(&self.tools, spec, app_id, trace_id),
        }
    }

    fn capture_ui_tree(&self, spec: &DeviceSpec, trace_id: &str) -> Result<String, RunError> {
        match spec.platform {
            Platform::Android => android::capture_ui_tree(&self.tools, spec, trace_id),
            Platform::Ios => ios::capture_ui_tree(&self.tools, spec, trace_id),
        }
    }
}
