use uuid::Uuid;

use crate::app::config::{InstallSettings, ToolSettings};
use crate::app::error::RunError;
use crate::app::models::DeviceSpec;

use super::process::{run_tool, spawn_tool, CommandOutput, SpawnedTool};

fn adb_args(spec: &DeviceSpec) -> Vec<String> {
    match &spec.serial {
        Some(serial) => vec!["-s".to_string(), serial.clone()],
        None => Vec::new(),
    }
}

pub fn boot(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    trace_id: &str,
) -> Result<SpawnedTool, RunError> {
    let args = vec![
        "-avd".to_string(),
        spec.name.clone(),
        "-no-boot-anim".to_string(),
    ];
    spawn_tool(&tools.emulator_program, &args, trace_id)
}

/// Reads the boot-completion property. The property service answers with an
/// empty string until it is up; that reads as "0" so callers only ever see
/// the two indicator values.
pub fn boot_indicator(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    trace_id: &str,
) -> Result<String, RunError> {
    let mut args = adb_args(spec);
    args.extend([
        "shell".to_string(),
        "getprop".to_string(),
        "sys.boot_completed".to_string(),
    ]);
    let output = run_tool(&tools.adb_program, &args, tools.command_timeout(), trace_id)?;
    let value = output.stdout.trim();
    if value.is_empty() {
        Ok("0".to_string())
    } else {
        Ok(value.to_string())
    }
}

pub fn shutdown(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    let mut args = adb_args(spec);
    args.extend(["emu".to_string(), "kill".to_string()]);
    run_tool(&tools.adb_program, &args, tools.command_timeout(), trace_id)
}

pub fn install(
    tools: &ToolSettings,
    install: &InstallSettings,
    spec: &DeviceSpec,
    app_path: &str,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    let mut args = adb_args(spec);
    args.push("install".to_string());
    if install.replace_existing {
        args.push("-r".to_string());
    }
    if install.allow_downgrade {
        args.push("-d".to_string());
    }
    if install.grant_permissions {
        args.push("-g".to_string());
    }
    args.extend(install.extra_args.split_whitespace().map(String::from));
    args.push(app_path.to_string());
    run_tool(&tools.adb_program, &args, install.install_timeout(), trace_id)
}

pub fn uninstall(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    app_id: &str,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    let mut args = adb_args(spec);
    args.extend(["uninstall".to_string(), app_id.to_string()]);
    run_tool(&tools.adb_program, &args, tools.command_timeout(), trace_id)
}

pub fn launch(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    app_id: &str,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    let mut args = adb_args(spec);
    args.extend([
        "shell".to_string(),
        "monkey".to_string(),
        "-p".to_string(),
        app_id.to_string(),
        "-c".to_string(),
        "android.intent.category.LAUNCHER".to_string(),
        "1".to_string(),
    ]);
    run_tool(&tools.adb_program, &args, tools.command_timeout(), trace_id)
}

/// Dumps the current UI hierarchy with uiautomator and reads it back. The
/// remote file name is unique per capture: concurrent producers on the same
/// device must not clobber each other's dumps.
pub fn capture_ui_tree(
    tools: &ToolSettings,
    spec: &DeviceSpec,
    trace_id: &str,
) -> Result<String, RunError> {
    let remote = format!("/sdcard/coldbrew_dump_{}.xml", Uuid::new_v4().simple());

    let mut dump_args = adb_args(spec);
    dump_args.extend([
        "shell".to_string(),
        "uiautomator".to_string(),
        "dump".to_string(),
        remote.clone(),
    ]);
    let dump = run_tool(&tools.adb_program, &dump_args, tools.capture_timeout(), trace_id)?;
    if !dump.ok() {
        return Err(RunError::system(
            format!("uiautomator dump failed: {}", dump.stderr.trim()),
            trace_id,
        ));
    }

    let mut cat_args = adb_args(spec);
    cat_args.extend(["shell".to_string(), "cat".to_string(), remote.clone()]);
    let cat = run_tool(&tools.adb_program, &cat_args, tools.capture_timeout(), trace_id);

    let mut rm_args = adb_args(spec);
    rm_args.extend([
        "shell".to_string(),
        "rm".to_string(),
        "-f".to_string(),
        remote,
    ]);
    let _ = run_tool(&tools.adb_program, &rm_args, tools.command_timeout(), trace_id);

    let cat = cat?;
    if !cat.ok() {
        return Err(RunError::system(
            format!("Failed to read UI dump: {}", cat.stderr.trim()),
            trace_id,
        ));
    }
    if cat.stdout.trim().is_empty() {
        return Err(RunError::system("UI dump is empty", trace_id));
    }
    Ok(cat.stdout)
}
