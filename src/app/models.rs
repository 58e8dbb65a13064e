use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::app::error::RunError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

/// The device a run targets. Built once from the run request and passed by
/// reference everywhere; never mutated after that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSpec {
    pub platform: Platform,
    pub name: String,
    pub serial: Option<String>,
}

impl DeviceSpec {
    pub fn from_request(request: &RunRequest) -> Self {
        Self {
            platform: request.platform,
            name: request.device_name.clone(),
            serial: request.device_serial.clone(),
        }
    }

    /// Key used for the per-device advisory lock. The serial wins when
    /// present since two differently named configs can address one device.
    pub fn lock_key(&self) -> &str {
        self.serial.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementQuery {
    pub target_identifier: String,
    pub timeout_budget: Duration,
}

/// One captured UI-tree dump. Owned by the snapshot queue until exactly one
/// analyzer consumes it, then dropped.
#[derive(Debug, Clone)]
pub struct DumpSnapshot {
    pub sequence_id: u64,
    pub captured_at_ms: u64,
    pub raw_content: String,
    pub producer_id: usize,
}

/// Terminal value of one ElementWatcher invocation. `discovered_at_ms` is the
/// detection instant, not the capture instant: matching runs asynchronously
/// relative to capture and only the moment a test script could have acted on
/// the element is operationally meaningful.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DetectionResult {
    pub found: bool,
    pub discovered_at_ms: u64,
    pub elapsed_ms: u64,
}

/// One entry of the ordered run log, the only artifact external callers
/// consume. Field names match the externally serialized document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStep {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<HashMap<String, serde_json::Value>>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

/// Input record handed over by the external request/configuration layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRequest {
    pub platform: Platform,
    pub device_name: String,
    #[serde(default)]
    pub device_serial: Option<String>,
    pub app_path: String,
    pub app_id: String,
    pub metric_name: String,
    pub target_identifier: String,
    #[serde(default)]
    pub timeout_budget_ms: Option<u64>,
}

/// What one orchestrated run hands back: the ordered step log plus the fatal
/// error of the run, if any. Teardown failures never show up in `error`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub trace_id: String,
    pub steps: Vec<ExecutionStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
