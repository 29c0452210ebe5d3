//! Host side of the sandbox.
//!
//! Executes untrusted strategy code in a separate OS process: the crate's own
//! binary re-invoked with the `sandbox-worker` subcommand. The child gets
//! `RLIMIT_CPU` and `RLIMIT_AS` installed before exec, a wall-clock kill at
//! `timeout_seconds`, a scrubbed environment, and a single JSON result file
//! under the per-run artifact directory. The temporary sandbox working
//! directory is removed on every exit path.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::code_strategy::worker::{
    ARTIFACT_DIR_ENV, INPUT_PATH_ENV, STRATEGY_PATH_ENV, WRITE_BLOCKED_MARKER,
};
use crate::error::{FinError, FinResult};
use crate::storage::RuntimePaths;

/// Env var tests use to point the runner at a prebuilt worker binary.
pub const WORKER_BIN_ENV: &str = "FIN_AGENT_SANDBOX_WORKER_BIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout_seconds: u64,
    pub memory_mb: u64,
    pub cpu_seconds: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: 5,
            memory_mb: 512,
            cpu_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SandboxOutcome {
    pub status: String,
    pub run_id: String,
    pub result_path: String,
    pub outputs: Value,
}

fn worker_binary() -> FinResult<PathBuf> {
    if let Ok(explicit) = std::env::var(WORKER_BIN_ENV) {
        if !explicit.trim().is_empty() {
            return Ok(PathBuf::from(explicit));
        }
    }
    std::env::current_exe()
        .map_err(|e| FinError::internal(format!("failed to resolve worker binary: {}", e)))
}

#[cfg(unix)]
fn install_rlimits(cmd: &mut tokio::process::Command, cpu_seconds: u64, memory_mb: u64) {
    let memory_bytes = memory_mb * 1024 * 1024;
    unsafe {
        cmd.pre_exec(move || {
            let cpu = libc::rlimit {
                rlim_cur: cpu_seconds,
                rlim_max: cpu_seconds,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let mem = libc::rlimit {
                rlim_cur: memory_bytes,
                rlim_max: memory_bytes,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &mem) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn install_rlimits(_cmd: &mut tokio::process::Command, _cpu_seconds: u64, _memory_mb: u64) {}

#[cfg(unix)]
fn killed_by_signal(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: &std::process::ExitStatus) -> bool {
    false
}

/// Run strategy code against a JSON bundle inside the sandbox.
pub async fn run_code_strategy_sandbox(
    paths: &RuntimePaths,
    source_code: &str,
    limits: &SandboxLimits,
    data_bundle: &Value,
    frame: &Value,
    context: &Value,
) -> FinResult<SandboxOutcome> {
    if limits.timeout_seconds == 0 {
        return Err(FinError::invalid("timeout_seconds must be positive"));
    }
    if limits.memory_mb == 0 {
        return Err(FinError::invalid("memory_mb must be positive"));
    }
    if limits.cpu_seconds == 0 {
        return Err(FinError::invalid("cpu_seconds must be positive"));
    }
    if source_code.trim().is_empty() {
        return Err(FinError::invalid("source_code is required"));
    }

    paths.ensure()?;
    let run_id = Uuid::new_v4().simple().to_string();
    let artifact_dir = paths.artifacts_dir().join("code-runs").join(&run_id);
    std::fs::create_dir_all(&artifact_dir)?;
    let result_path = artifact_dir.join("result.json");

    // Dropped on every exit path, which removes the directory tree.
    let sandbox_dir = tempfile::Builder::new()
        .prefix("finagent-code-sandbox-")
        .tempdir()?;
    let strategy_path = sandbox_dir.path().join("strategy.rhai");
    let input_path = sandbox_dir.path().join("input.json");
    std::fs::write(&strategy_path, source_code)?;
    std::fs::write(
        &input_path,
        serde_json::to_string(&json!({
            "data_bundle": data_bundle,
            "frame": frame,
            "context": context,
        }))?,
    )?;

    let mut cmd = tokio::process::Command::new(worker_binary()?);
    cmd.arg("sandbox-worker")
        .current_dir(sandbox_dir.path())
        .env_remove("FIN_AGENT_HOME")
        .env_remove("LD_PRELOAD")
        .env_remove("LD_LIBRARY_PATH")
        .env(ARTIFACT_DIR_ENV, &artifact_dir)
        .env(STRATEGY_PATH_ENV, &strategy_path)
        .env(INPUT_PATH_ENV, &input_path)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    install_rlimits(&mut cmd, limits.cpu_seconds, limits.memory_mb);

    let child = cmd
        .spawn()
        .map_err(|e| FinError::Io(format!("failed to spawn sandbox worker: {}", e)))?;
    let waited = tokio::time::timeout(
        Duration::from_secs(limits.timeout_seconds),
        child.wait_with_output(),
    )
    .await;

    let output = match waited {
        Err(_) => {
            return Err(FinError::SandboxTimeout(format!(
                "sandbox timeout exceeded after {}s; remediation: optimize strategy or increase timeout",
                limits.timeout_seconds
            )));
        }
        Ok(Err(e)) => {
            return Err(FinError::Io(format!("sandbox worker wait failed: {}", e)));
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("exit_code={:?}", output.status.code())
        } else {
            stderr
        };
        if killed_by_signal(&output.status) {
            return Err(FinError::SandboxResourceExceeded(format!(
                "sandbox timeout or resource limit exceeded: {}; remediation: optimize strategy or increase limits",
                detail
            )));
        }
        if detail.contains(WRITE_BLOCKED_MARKER) {
            return Err(FinError::SandboxPolicy(format!(
                "sandbox blocked write outside artifact dir: {}; remediation: write outputs only under artifact dir",
                detail
            )));
        }
        return Err(FinError::invalid(format!(
            "sandbox execution failed: {}",
            detail
        )));
    }

    if !result_path.exists() {
        return Err(FinError::invalid(
            "sandbox execution failed: result artifact missing",
        ));
    }
    let outputs: Value = serde_json::from_str(&std::fs::read_to_string(&result_path)?)?;

    Ok(SandboxOutcome {
        status: "completed".to_string(),
        run_id,
        result_path: result_path.to_string_lossy().to_string(),
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_positive_limits() {
        let paths = RuntimePaths::new(tempfile::tempdir().unwrap().path());
        let limits = SandboxLimits {
            timeout_seconds: 0,
            ..SandboxLimits::default()
        };
        let err = run_code_strategy_sandbox(
            &paths,
            "fn prepare(a, b) { #{} }",
            &limits,
            &json!({}),
            &json!([]),
            &json!({}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timeout_seconds must be positive"));
    }

    #[tokio::test]
    async fn test_rejects_empty_source() {
        let paths = RuntimePaths::new(tempfile::tempdir().unwrap().path());
        let err = run_code_strategy_sandbox(
            &paths,
            "  ",
            &SandboxLimits::default(),
            &json!({}),
            &json!([]),
            &json!({}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("source_code is required"));
    }
}
