//! Argument-vector command execution.
//!
//! Every external program (container CLI, host `sudo ip`, in-sandbox helpers
//! reached through `docker exec`) is run through a [`CommandRunner`]. Nothing
//! is ever passed through a host shell.

use std::{fmt, path::PathBuf, process::Stdio, time::Duration};

use {
    async_trait::async_trait,
    tokio::{io::AsyncWriteExt, process::Command},
    tracing::{debug, warn},
};

use crate::error::{Context, Error, Result};

/// A program invocation: binary, arguments, optional stdin payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Space-joined rendering used in logs and test assertions.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`Error::Transport`] naming `operation`.
    pub fn into_result(self, operation: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            let stderr = match self.stderr.trim() {
                "" => format!("exit status {}", self.exit_code),
                text => text.to_string(),
            };
            Err(Error::Transport {
                operation: operation.to_string(),
                stderr,
            })
        }
    }
}

/// Seam between the control plane and the processes it drives.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion with stdout and stderr captured.
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run attached to the caller's terminal; returns the exit code.
    async fn interactive(&self, spec: &CommandSpec) -> Result<i32>;
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, "run command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", spec.program))?;
        if let Some(ref input) = spec.stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes())
                .await
                .with_context(|| format!("write stdin of {}", spec.program))?;
            pipe.shutdown().await?;
        }

        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result.with_context(|| format!("wait for {}", spec.program))?,
                Err(_) => {
                    warn!(command = %spec, timeout_secs = limit.as_secs(), "command timed out");
                    return Err(Error::Timeout {
                        what: spec.command_line(),
                        waited: limit,
                        log_tail: String::new(),
                    });
                },
            },
            None => child
                .wait_with_output()
                .await
                .with_context(|| format!("wait for {}", spec.program))?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(exit_code, stdout_len = output.stdout.len(), "command done");

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn interactive(&self, spec: &CommandSpec) -> Result<i32> {
        debug!(command = %spec, "run interactive command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        let status = cmd
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .with_context(|| format!("run {}", spec.program))?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_arguments() {
        let spec = CommandSpec::new("docker").args(["ps", "-a"]).arg("--format");
        assert_eq!(spec.command_line(), "docker ps -a --format");
        assert_eq!(spec.to_string(), "docker ps -a --format");
    }

    #[test]
    fn into_result_maps_failure_to_transport() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "  no such container\n".into(),
        };
        match out.into_result("docker stop") {
            Err(Error::Transport { operation, stderr }) => {
                assert_eq!(operation, "docker stop");
                assert_eq!(stderr, "no such container");
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn into_result_without_stderr_names_exit_status() {
        let out = CommandOutput {
            exit_code: 125,
            ..CommandOutput::default()
        };
        let err = out.into_result("docker run").unwrap_err();
        assert_eq!(err.to_string(), "docker run failed: exit status 125");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_captures_output_and_stdin() {
        let spec = CommandSpec::new("cat").stdin("info snapshots\n");
        let out = ProcessRunner.output(&spec).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "info snapshots\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_reports_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]);
        let out = ProcessRunner.output(&spec).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn missing_program_names_itself() {
        let spec = CommandSpec::new("firmbox-no-such-runtime").arg("ps");
        let err = ProcessRunner.output(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Message(_)));
        assert!(
            err.to_string().starts_with("spawn firmbox-no-such-runtime: "),
            "{err}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_times_out() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50));
        let err = ProcessRunner.output(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
