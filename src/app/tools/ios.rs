use std::time::Duration;

use crate::app::config::ToolSettings;
use crate::app::error::RunError;
use crate::app::models::DeviceSpec;

use super::process::{run_tool, CommandOutput};

/// simctl accepts either a device name or a UDID; the UDID is unambiguous
/// when the run request carries one.
fn target(spec: &DeviceSpec) -> &str {
    spec.serial.as_deref().unwrap_or(&spec.name)
}

fn simctl(verb: &str, spec: &DeviceSpec, tail: &[&str]) -> Vec<String> {
    let mut args = vec!["simctl".to_string(), verb.to_string(), target(spec).to_string()];
    args.extend(tail.iter().map(|s| s.to_string()));
    args
}

/// `simctl boot` blocks until the simulator finished booting, so the caller
/// gets a completed process to inspect rather than something to poll.
pub fn boot(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    run_tool(&tools.xcrun_program, &simctl("boot", spec, &[]), timeout, trace_id)
}

/// Brings up the Simulator frontend. Installs are rejected until the UI
/// shell is attached to the booted device.
pub fn open_ui_shell(tools: &ToolSettings, trace_id: &str) -> Result<CommandOutput, RunError> {
    let args = vec!["-a".to_string(), "Simulator".to_string()];
    run_tool("open", &args, tools.command_timeout(), trace_id)
}

pub fn shutdown(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    run_tool(
        &tools.xcrun_program,
        &simctl("shutdown", spec, &[]),
        tools.command_timeout(),
        trace_id,
    )
}

pub fn install(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    app_path: &str,
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    run_tool(
        &tools.xcrun_program,
        &simctl("install", spec, &[app_path]),
        timeout,
        trace_id,
    )
}

pub fn uninstall(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    app_id: &str,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    run_tool(
        &tools.xcrun_program,
        &simctl("uninstall", spec, &[app_id]),
        tools.command_timeout(),
        trace_id,
    )
}

pub fn launch(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    app_id: &str,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    run_tool(
        &tools.xcrun_program,
        &simctl("launch", spec, &[app_id]),
        tools.command_timeout(),
        trace_id,
    )
}

pub fn capture_ui_tree(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    trace_id: &str,
) -> Result<String, RunError> {
    let args = vec![
        "ui".to_string(),
        "describe-all".to_string(),
        "--udid".to_string(),
        target(spec).to_string(),
    ];
    let output = run_tool(&tools.ios_dump_program, &args, tools.capture_timeout(), trace_id)?;
    if !output.ok() {
        return Err(RunError::system(
            format!("Accessibility dump failed: {}", output.stderr.trim()),
            trace_id,
        ));
    }
    if output.stdout.trim().is_empty() {
        return Err(RunError::system("Accessibility dump is empty", trace_id));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::Platform;

    #[test]
    fn target_prefers_udid_over_name() {
        let spec = DeviceSpec {
            platform: Platform::Ios,
            name: "iPhone 15".to_string(),
            serial: Some("AAAA-BBBB".to_string()),
        };
        assert_eq!(target(&spec), "AAAA-BBBB");
        assert_eq!(
            simctl("boot", &spec, &[]),
            vec!["simctl", "boot", "AAAA-BBBB"]
        );
    }
}
