use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::app::error::RunError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn drain(mut reader: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&chunk[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

/// Runs an external tool to completion with a hard timeout. Stdout and stderr
/// are drained on their own threads; a chatty child would otherwise block on
/// a full pipe buffer and get misreported as a timeout.
pub fn run_tool(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, RunError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            RunError::system(format!("Failed to spawn {program}: {err}"), trace_id)
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain(stdout);
    let stderr_handle = drain(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(RunError::system(
                        format!("{program} timed out after {}ms", timeout.as_millis()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(RunError::system(
                    format!("Failed to poll {program}: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

/// A long-running external tool, like an emulator boot process. The caller
/// polls for early exit and terminates it on timeout.
pub struct SpawnedTool {
    child: Child,
}

impl SpawnedTool {
    pub fn try_exit(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(_) => Some(-1),
        }
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn spawn_tool(program: &str, args: &[String], trace_id: &str) -> Result<SpawnedTool, RunError> {
    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            RunError::system(format!("Failed to spawn {program}: {err}"), trace_id)
        })?;
    Ok(SpawnedTool { child })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn run_tool_does_not_deadlock_on_large_stdout() {
        // If stdout is piped but not drained, the child blocks once the pipe
        // buffer fills and an otherwise-fast command hits the timeout.
        let output = run_tool(
            "sh",
            &sh("i=0; while [ $i -lt 50000 ]; do echo 1234567890; i=$((i+1)); done"),
            Duration::from_secs(10),
            "trace-large-output",
        )
        .expect("large-output command should complete");

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 500_000);
    }

    #[test]
    fn run_tool_kills_on_timeout() {
        let err = run_tool(
            "sh",
            &sh("sleep 5"),
            Duration::from_millis(100),
            "trace-timeout",
        )
        .expect_err("should time out");
        assert!(err.is("ERR_SYSTEM"));
        assert!(err.error.contains("timed out"));
    }

    #[test]
    fn run_tool_reports_nonzero_exit() {
        let output = run_tool("sh", &sh("exit 3"), Duration::from_secs(5), "trace-exit")
            .expect("should run");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.ok());
    }

    #[test]
    fn spawned_tool_polls_and_terminates() {
        let mut tool = spawn_tool("sh", &sh("sleep 10"), "trace-spawn").expect("spawn");
        assert!(tool.try_exit().is_none());
        tool.kill();
        assert!(tool.try_exit().is_some());

        let mut quick = spawn_tool("sh", &sh("exit 7"), "trace-spawn-exit").expect("spawn");
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(code) = quick.try_exit() {
                assert_eq!(code, 7);
                break;
            }
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
