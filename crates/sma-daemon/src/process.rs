//! Bounded external process invocation shared by the collaborator drivers.

use std::process::Stdio;
use std::time::Duration;

use tracing::debug;

use crate::error::CallError;

/// Output of a process that exited successfully.
#[derive(Debug, Clone)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// Runs programs with a fixed upper bound on wall time.
#[derive(Debug, Clone)]
pub struct Runner {
    timeout: Duration,
}

impl Runner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `program args…`; a non-zero exit is an error.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<Output, CallError> {
        self.run_with_env(program, args, &[]).await
    }

    pub async fn run_with_env(
        &self,
        program: &str,
        args: &[&str],
        envs: &[(&str, &str)],
    ) -> Result<Output, CallError> {
        let (status, output) = self.exec(program, args, envs).await?;
        if status != 0 {
            return Err(CallError::Exit {
                program: program.to_string(),
                status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Run and hand back the exit status instead of failing on non-zero.
    pub async fn run_status(&self, program: &str, args: &[&str]) -> Result<(i32, Output), CallError> {
        self.exec(program, args, &[]).await
    }

    async fn exec(
        &self,
        program: &str,
        args: &[&str],
        envs: &[(&str, &str)],
    ) -> Result<(i32, Output), CallError> {
        debug!("exec: {} {}", program, args.join(" "));
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(envs.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout must not leave the child behind
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| CallError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CallError::Timeout {
                what: program.to_string(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|source| CallError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok((
            output.status.code().unwrap_or(-1),
            Output {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
        ))
    }
}
