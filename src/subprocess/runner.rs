use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::trace;

use super::error::ProcessError;

/// One invocation of an external tool
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl ProcessCommand {
    /// The command line as it would be typed, for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "exit 0"),
            ExitStatus::Error(code) => write!(f, "exit {code}"),
            ExitStatus::Signal(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return ExitStatus::Success;
        }
        if let Some(code) = status.code() {
            return ExitStatus::Error(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }
        ExitStatus::Error(-1)
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands as real child processes
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        trace!(command = %command.display(), "spawning");

        let started = Instant::now();
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // dropping the future on timeout must reap the child
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ProcessError::CommandNotFound(command.program.clone()),
                _ => ProcessError::Io(e),
            })?;

        let output = match command.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ProcessError::Timeout(limit))??,
            None => child.wait_with_output().await?,
        };

        let output = ProcessOutput {
            status: output.status.into(),
            stdout: String::from_utf8(output.stdout)?,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };
        trace!(
            program = %command.program,
            status = %output.status,
            elapsed = ?output.duration,
            "finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(program: &str, args: &[&str]) -> ProcessCommand {
        ProcessCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: None,
        }
    }

    #[test]
    fn test_display_includes_args() {
        assert_eq!(command("crictl", &["rmi", "sha256:abc"]).display(), "crictl rmi sha256:abc");
        assert_eq!(command("kubectl", &[]).display(), "kubectl");
    }

    #[test]
    fn test_exit_status_rendering() {
        assert!(ExitStatus::Success.success());
        assert!(!ExitStatus::Signal(9).success());
        assert_eq!(ExitStatus::Error(2).to_string(), "exit 2");
        assert_eq!(ExitStatus::Signal(9).to_string(), "killed by signal 9");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_is_command_not_found() {
        let err = TokioProcessRunner
            .run(command("definitely-not-a-real-binary-eraser", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::CommandNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let output = TokioProcessRunner.run(command("sh", &["-c", "echo no >&2; exit 3"])).await.unwrap();
        assert_eq!(output.status, ExitStatus::Error(3));
        assert_eq!(output.stderr.trim(), "no");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_the_child() {
        let mut slow = command("sleep", &["5"]);
        slow.timeout = Some(Duration::from_millis(50));
        let err = TokioProcessRunner.run(slow).await.unwrap_err();
        assert!(matches!(err, ProcessError::Timeout(_)));
    }
}
