use std::process::ExitCode;
use std::sync::Arc;

use coldbrew::app::config::load_config;
use coldbrew::app::logging::init_logging;
use coldbrew::app::models::{Platform, RunRequest};
use coldbrew::app::orchestrator::TestOrchestrator;
use coldbrew::app::tools::HostToolchain;

#[derive(Debug, Clone)]
struct Args {
    platform: Platform,
    device_name: String,
    device_serial: Option<String>,
    app_path: String,
    app_id: String,
    metric_name: String,
    target_identifier: String,
    timeout_budget_ms: Option<u64>,
}

fn usage() -> &'static str {
    "usage: smoke --platform android|ios --device <name> --app <path> --app-id <id> --target <resource-id>\n\
     \n\
     options:\n\
       --serial <serial>      device serial / simulator UDID\n\
       --metric <name>        metric to measure (default: \"App Startup Time\")\n\
       --timeout-ms <n>       element wait budget in milliseconds\n"
}

fn parse_args() -> Result<Args, String> {
    let mut platform: Option<Platform> = None;
    let mut device_name: Option<String> = None;
    let mut device_serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut app_path: Option<String> = None;
    let mut app_id: Option<String> = None;
    let mut metric_name = "App Startup Time".to_string();
    let mut target_identifier: Option<String> = None;
    let mut timeout_budget_ms: Option<u64> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value_for = |flag: &str| -> Result<String, String> {
            args.next().ok_or_else(|| format!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--platform" => {
                platform = Some(match value_for("--platform")?.to_lowercase().as_str() {
                    "android" => Platform::Android,
                    "ios" => Platform::Ios,
                    other => return Err(format!("unknown platform: {other}")),
                });
            }
            "--device" => device_name = Some(value_for("--device")?),
            "--serial" => device_serial = Some(value_for("--serial")?),
            "--app" => app_path = Some(value_for("--app")?),
            "--app-id" => app_id = Some(value_for("--app-id")?),
            "--metric" => metric_name = value_for("--metric")?,
            "--target" => target_identifier = Some(value_for("--target")?),
            "--timeout-ms" => {
                let raw = value_for("--timeout-ms")?;
                timeout_budget_ms = Some(
                    raw.parse::<u64>()
                        .map_err(|_| format!("invalid --timeout-ms value: {raw}"))?,
                );
            }
            "--help" | "-h" => return Err(usage().to_string()),
            other => return Err(format!("unknown argument: {other}\n\n{}", usage())),
        }
    }

    Ok(Args {
        platform: platform.ok_or("--platform is required")?,
        device_name: device_name.ok_or("--device is required")?,
        device_serial,
        app_path: app_path.ok_or("--app is required")?,
        app_id: app_id.ok_or("--app-id is required")?,
        metric_name,
        target_identifier: target_identifier.ok_or("--target is required")?,
        timeout_budget_ms,
    })
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging.log_level);

    let request = RunRequest {
        platform: args.platform,
        device_name: args.device_name,
        device_serial: args.device_serial,
        app_path: args.app_path,
        app_id: args.app_id,
        metric_name: args.metric_name,
        target_identifier: args.target_identifier,
        timeout_budget_ms: args.timeout_budget_ms,
    };

    let toolchain = Arc::new(HostToolchain::new(&config));
    let orchestrator = TestOrchestrator::new(toolchain, config);
    let report = orchestrator.run(&request);

    match serde_json::to_string_pretty(&report) {
        Ok(payload) => println!("{payload}"),
        Err(err) => {
            eprintln!("failed to serialize report: {err}");
            return ExitCode::FAILURE;
        }
    }

    if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
