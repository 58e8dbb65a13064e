use serde::Serialize;
use std::fmt;

/// Error for a single orchestrated run. The `code` is stable and is what the
/// orchestrator and external reporting key off; `trace_id` ties the error to
/// the run's log lines.
#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl RunError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn boot_timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_BOOT_TIMEOUT", message, trace_id)
    }

    pub fn process(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_PROCESS", message, trace_id)
    }

    pub fn install(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_INSTALL", message, trace_id)
    }

    pub fn element_timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_ELEMENT_TIMEOUT", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for RunError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_code_and_trace_id() {
        let err = RunError::install("adb install failed", "trace-1");
        assert!(err.is("ERR_INSTALL"));
        assert_eq!(err.trace_id, "trace-1");
        assert_eq!(err.to_string(), "adb install failed (ERR_INSTALL)");
    }
}
