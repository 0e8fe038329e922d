//! Execution wrapper for the external tools.
//!
//! Keeps process handling in one place so the providers only build argument
//! lists and interpret output (fake binaries, deterministic stdout parsing).

use autounlock_core::error::{AutounlockError, AutounlockResult};
use log::debug;
use std::io::{Read, Write};
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
    /// Prefer stderr, fall back to stdout, for use in error messages.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        let text = if !stderr.is_empty() { stderr } else { stdout };
        if text.is_empty() {
            "no additional output".to_string()
        } else {
            text.to_string()
        }
    }
}

impl ToolCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run and return the output whatever the exit status.
    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> AutounlockResult<Output> {
        debug!("running {} {}", self.binary.display(), args.join(" "));
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            AutounlockError::Provider(format!("failed to start {}: {err}", self.binary.display()))
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A tool that exits before reading closes the pipe; its status
                // and stderr still say what went wrong.
                if let Err(err) = stdin.write_all(payload).and_then(|()| stdin.flush()) {
                    debug!("{} did not read its input: {err}", self.binary.display());
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    /// Run and turn a non-zero exit into a provider error naming the tool.
    pub(crate) fn run_checked(&self, args: &[&str]) -> AutounlockResult<Output> {
        let out = self.run(args, None)?;
        if out.status == 0 {
            return Ok(out);
        }
        Err(AutounlockError::Provider(format!(
            "{} {} failed: {} (exit code {})",
            self.binary.display(),
            args.join(" "),
            out.diagnostic(),
            out.status
        )))
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> AutounlockResult<Output> {
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
            return Err(AutounlockError::Provider(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| AutounlockError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| AutounlockError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<AutounlockResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> AutounlockResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

/// Case-insensitive substring test over a diagnostic.
pub(crate) fn mentions(diagnostic: &str, needles: &[&str]) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    needles.iter().any(|needle| lower.contains(needle))
}

pub(crate) const PERMISSION_HINTS: &[&str] =
    &["permission denied", "operation not permitted", "not permitted"];
