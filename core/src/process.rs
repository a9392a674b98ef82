//! Launching external utilities and capturing what they print.
//!
//! A non-zero exit status is data, not an error: callers decide what a
//! failing tool means for them. Only a failure to launch becomes
//! [`DmgError::Spawn`].

use crate::DmgError;
use async_trait::async_trait;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ProcessResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, status: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            status,
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into a [`DmgError::ProcessFailure`].
    pub fn check(self, program: &str) -> Result<Self, DmgError> {
        if self.success() {
            Ok(self)
        } else {
            Err(DmgError::ProcessFailure {
                program: program.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// One command line, plus optional bytes for its standard input.
#[derive(Clone)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// File name of the program, e.g. `hdiutil`.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Shell-style rendering for logs. Arguments containing a space are
    /// quoted; standard input is never shown.
    pub fn printable(&self) -> String {
        let mut line = self.program_name();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    fn spawn_error(&self, source: std::io::Error) -> DmgError {
        DmgError::Spawn {
            program: self.program.display().to_string(),
            source,
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run to completion without blocking the calling task.
    async fn run(&self, invocation: &Invocation) -> Result<ProcessResult, DmgError>;

    /// Run to completion on the current thread.
    fn run_blocking(&self, invocation: &Invocation) -> Result<ProcessResult, DmgError>;
}

/// Executor backed by real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

fn finish(output: std::process::Output) -> ProcessResult {
    ProcessResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        // Killed by a signal: no code to report
        status: output.status.code().unwrap_or(-1),
    }
}

fn ignore_broken_pipe(result: std::io::Result<()>) -> Result<(), DmgError> {
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(DmgError::Io(e)),
        _ => Ok(()),
    }
}

#[async_trait]
impl ProcessExecutor for SystemExecutor {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessResult, DmgError> {
        tracing::debug!(command = %invocation.printable(), "spawning");

        let mut command = tokio::process::Command::new(invocation.program());
        command
            .args(invocation.arg_list())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().map_err(|e| invocation.spawn_error(e))?;

        // Input is written and closed before waiting, so a child reading
        // stdin to EOF cannot hang. Inputs are a passphrase or a small plist.
        if let (Some(bytes), Some(mut pipe)) = (invocation.stdin_bytes(), child.stdin.take()) {
            ignore_broken_pipe(pipe.write_all(bytes).await)?;
            ignore_broken_pipe(pipe.shutdown().await)?;
        }

        // Drains stdout and stderr concurrently.
        let output = child.wait_with_output().await?;
        let result = finish(output);
        tracing::debug!(program = %invocation.program_name(), status = result.status, "finished");
        Ok(result)
    }

    fn run_blocking(&self, invocation: &Invocation) -> Result<ProcessResult, DmgError> {
        tracing::debug!(command = %invocation.printable(), "spawning (blocking)");

        let mut child = std::process::Command::new(invocation.program())
            .args(invocation.arg_list())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .spawn()
            .map_err(|e| invocation.spawn_error(e))?;

        if let (Some(bytes), Some(mut pipe)) = (invocation.stdin_bytes(), child.stdin.take()) {
            ignore_broken_pipe(pipe.write_all(bytes))?;
        }

        let output = child.wait_with_output()?;
        Ok(finish(output))
    }
}
