use std::io::ErrorKind;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ExecError;

/// Run `cmd` to completion, capturing stdout/stderr, killing it if it is still
/// running after `limit`. A non-zero exit is not an error here; inspect
/// `Output::status`.
pub async fn run_with_timeout(cmd: &mut Command, limit: Duration) -> Result<Output, ExecError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.kill_on_drop(true);
    debug!(%program, timeout_s = limit.as_secs(), "spawning");

    let child = cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ExecError::NotFound(program.clone()),
            _ => ExecError::Io { program: program.clone(), source: e },
        })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(e)) => Err(ExecError::Io { program, source: e }),
        Err(_) => Err(ExecError::Timeout { program, secs: limit.as_secs() }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = run_with_timeout(Command::new("sh").args(["-c", "echo hi; echo oops >&2; exit 3"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hi");
        assert_eq!(String::from_utf8_lossy(&out.stderr).trim(), "oops");
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let err = run_with_timeout(&mut Command::new("definitely-not-a-real-binary-xyz"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NotFound(_)));
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let err = run_with_timeout(Command::new("sleep").arg("5"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }
}
