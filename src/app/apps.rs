use std::fs::File;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::app::error::RunError;
use crate::app::models::{DeviceSpec, Platform};
use crate::app::tools::process::CommandOutput;
use crate::app::tools::Toolchain;

pub trait AppManager: Send + Sync {
    /// Fatal on failure: there is no point running a measurement against a
    /// build that did not install.
    fn install(&self, spec: &DeviceSpec, app_path: &str, trace_id: &str) -> Result<(), RunError>;

    /// Best-effort. A failed uninstall must not block handing the device
    /// back; the return value only feeds the step log.
    fn uninstall(&self, spec: &DeviceSpec, app_id: &str, trace_id: &str) -> bool;

    fn launch(&self, spec: &DeviceSpec, app_id: &str, trace_id: &str) -> Result<(), RunError>;
}

pub fn app_manager_for(platform: Platform, toolchain: Arc<dyn Toolchain>) -> Box<dyn AppManager> {
    match platform {
        Platform::Android => Box::new(AndroidAppManager::new(toolchain)),
        Platform::Ios => Box::new(IosAppManager::new(toolchain)),
    }
}

/// Pulls the `INSTALL_FAILED_…`/`INSTALL_PARSE_FAILED_…` code out of
/// installer output, if one is present.
pub fn install_failure_code(output: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"INSTALL(?:_PARSE)?_FAILED_[A-Z_]+").expect("install code pattern"));
    pattern.find(output).map(|m| m.as_str().to_string())
}

fn install_error(output: &CommandOutput, trace_id: &str) -> RunError {
    let combined = format!("{}\n{}", output.stdout, output.stderr);
    let detail = match install_failure_code(&combined) {
        Some(code) => code,
        None => {
            let stderr = output.stderr.trim();
            if stderr.is_empty() {
                format!("exit status {:?}", output.exit_code)
            } else {
                stderr.to_string()
            }
        }
    };
    RunError::install(format!("Install failed: {detail}"), trace_id)
}

fn uninstall_best_effort(
    toolchain: &dyn Toolchain,
    spec: &DeviceSpec,
    app_id: &str,
    trace_id: &str,
) -> bool {
    match toolchain.uninstall(spec, app_id, trace_id) {
        Ok(output) if output.ok() => {
            info!(trace_id = %trace_id, app_id = %app_id, "app uninstalled");
            true
        }
        Ok(output) => {
            warn!(
                trace_id = %trace_id,
                app_id = %app_id,
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "uninstall reported failure; ignoring"
            );
            false
        }
        Err(err) => {
            warn!(trace_id = %trace_id, app_id = %app_id, error = %err, "uninstall failed; ignoring");
            false
        }
    }
}

fn launch_via(
    toolchain: &dyn Toolchain,
    spec: &DeviceSpec,
    app_id: &str,
    trace_id: &str,
) -> Result<(), RunError> {
    let output = toolchain.launch(spec, app_id, trace_id)?;
    if !output.ok() {
        return Err(RunError::process(
            format!("Launching {app_id} failed: {}", output.stderr.trim()),
            trace_id,
        ));
    }
    info!(trace_id = %trace_id, app_id = %app_id, "app launched");
    Ok(())
}

pub struct AndroidAppManager {
    toolchain: Arc<dyn Toolchain>,
}

impl AndroidAppManager {
    pub fn new(toolchain: Arc<dyn Toolchain>) -> Self {
        Self { toolchain }
    }

    /// An APK is a ZIP archive; a missing or unreadable one fails the run
    /// before any device traffic happens.
    fn validate_build(app_path: &str, trace_id: &str) -> Result<(), RunError> {
        let path = Path::new(app_path);
        if !path.is_file() {
            return Err(RunError::install(
                format!("Build not found: {app_path}"),
                trace_id,
            ));
        }
        let file = File::open(path).map_err(|err| {
            RunError::install(format!("Failed to open build {app_path}: {err}"), trace_id)
        })?;
        ZipArchive::new(file).map_err(|err| {
            RunError::install(format!("Build {app_path} is not a valid APK: {err}"), trace_id)
        })?;
        Ok(())
    }
}

impl AppManager for AndroidAppManager {
    fn install(&self, spec: &DeviceSpec, app_path: &str, trace_id: &str) -> Result<(), RunError> {
        Self::validate_build(app_path, trace_id)?;
        let output = self.toolchain.install(spec, app_path, trace_id)?;
        if !output.ok() || install_failure_code(&output.stdout).is_some() {
            return Err(install_error(&output, trace_id));
        }
        info!(trace_id = %trace_id, app_path = %app_path, "app installed");
        Ok(())
    }

    fn uninstall(&self, spec: &DeviceSpec, app_id: &str, trace_id: &str) -> bool {
        uninstall_best_effort(self.toolchain.as_ref(), spec, app_id, trace_id)
    }

    fn launch(&self, spec: &DeviceSpec, app_id: &str, trace_id: &str) -> Result<(), RunError> {
        launch_via(self.toolchain.as_ref(), spec, app_id, trace_id)
    }
}

pub struct IosAppManager {
    toolchain: Arc<dyn Toolchain>,
}

impl IosAppManager {
    pub fn new(toolchain: Arc<dyn Toolchain>) -> Self {
        Self { toolchain }
    }
}

impl AppManager for IosAppManager {
    fn install(&self, spec: &DeviceSpec, app_path: &str, trace_id: &str) -> Result<(), RunError> {
        // App bundles are directories; only existence can be checked here.
        if !Path::new(app_path).exists() {
            return Err(RunError::install(
                format!("Build not found: {app_path}"),
                trace_id,
            ));
        }
        let output = self.toolchain.install(spec, app_path, trace_id)?;
        if !output.ok() {
            return Err(install_error(&output, trace_id));
        }
        info!(trace_id = %trace_id, app_path = %app_path, "app installed");
        Ok(())
    }

    fn uninstall(&self, spec: &DeviceSpec, app_id: &str, trace_id: &str) -> bool {
        uninstall_best_effort(self.toolchain.as_ref(), spec, app_id, trace_id)
    }

    fn launch(&self, spec: &DeviceSpec, app_id: &str, trace_id: &str) -> Result<(), RunError> {
        launch_via(self.toolchain.as_ref(), spec, app_id, trace_id)
    }
}
