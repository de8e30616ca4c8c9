//! Execution wrapper for invoking host tools with a time budget.
//!
//! Raw exit codes and diagnostics are classified here once, so provider
//! logic only ever matches on `ToolStatus`.

use log::{debug, warn};
use storechain_core::error::{StorechainError, StorechainResult};
use storechain_provider::ToolStatus;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

impl Output {
    /// Prefer stderr, fall back to stdout.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// How an invocation ended.
#[derive(Debug)]
pub(crate) enum Execution {
    Finished(Output),
    /// Killed after exceeding the time budget.
    TimedOut(Duration),
    /// The binary could not be spawned because it does not exist.
    Missing,
}

impl Execution {
    /// Collapse into a `ToolStatus`, classifying non-zero exits.
    pub(crate) fn into_status(self) -> ToolStatus {
        match self {
            Execution::Finished(out) if out.status == 0 => ToolStatus::Ok,
            Execution::Finished(out) => classify_failure(out.status, &out.diagnostic()),
            Execution::TimedOut(after) => ToolStatus::Timeout(after),
            Execution::Missing => ToolStatus::NotFound,
        }
    }
}

impl ToolCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Same binary with a different time budget.
    pub(crate) fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            binary: self.binary.clone(),
            timeout,
        }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run and classify in one step.
    pub(crate) fn status(&self, args: &[&str]) -> StorechainResult<ToolStatus> {
        Ok(self.run(args)?.into_status())
    }

    pub(crate) fn run(&self, args: &[&str]) -> StorechainResult<Execution> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        debug!("running {} {}", self.binary.display(), args.join(" "));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Execution::Missing),
            Err(err) => return Err(err.into()),
        };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> StorechainResult<Execution> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            warn!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            );
            return Ok(Execution::TimedOut(self.timeout));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| StorechainError::System("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| StorechainError::System("stderr reader thread panicked".into()))??;

        Ok(Execution::Finished(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        }))
    }
}

/// Map a non-zero exit to `Conflict`, `NotFound` or a plain `ToolError`.
pub(crate) fn classify_failure(exit_code: i32, diagnostic: &str) -> ToolStatus {
    let lower = diagnostic.to_ascii_lowercase();
    if lower.contains("already exists")
        || lower.contains("in use")
        || lower.contains("busy")
        || lower.contains("exclusively")
    {
        return ToolStatus::Conflict(diagnostic.trim().to_string());
    }
    if lower.contains("not found")
        || lower.contains("failed to find")
        || lower.contains("no such file")
        || lower.contains("does not exist")
    {
        return ToolStatus::NotFound;
    }
    ToolStatus::ToolError {
        exit_code,
        stderr: diagnostic.trim().to_string(),
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<StorechainResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> StorechainResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_failure_recognises_conflicts_and_missing_objects() {
        assert!(matches!(
            classify_failure(5, "  A volume group called data_vg already exists.\n"),
            ToolStatus::Conflict(reason) if reason == "A volume group called data_vg already exists."
        ));
        assert!(matches!(
            classify_failure(5, "Can't open /dev/nbd0 exclusively.  Mounted filesystem?"),
            ToolStatus::Conflict(_)
        ));
        assert_eq!(
            classify_failure(5, "Volume group \"data_vg\" not found"),
            ToolStatus::NotFound
        );
        assert_eq!(
            classify_failure(3, "unexpected"),
            ToolStatus::ToolError {
                exit_code: 3,
                stderr: "unexpected".into()
            }
        );
    }

    #[test]
    fn missing_binary_is_reported_as_not_found() {
        let command = ToolCommand::new(
            PathBuf::from("/nonexistent/storechain-tool"),
            Duration::from_secs(1),
        );
        assert_eq!(command.status(&["--version"]).unwrap(), ToolStatus::NotFound);
    }

    #[test]
    fn finished_output_prefers_stderr_diagnostic() {
        let output = Output {
            stdout: "partial\n".into(),
            stderr: "  boom \n".into(),
            status: 1,
        };
        assert_eq!(output.diagnostic(), "boom");

        let quiet = Output {
            stdout: " only stdout ".into(),
            stderr: String::new(),
            status: 1,
        };
        assert_eq!(quiet.diagnostic(), "only stdout");
    }
}
