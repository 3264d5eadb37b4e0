// Process Runner
// Executes external commands with captured output and an optional wall-clock bound

use crate::error::{ServiceError, ServiceResult};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// How long to wait for output pipes to close after the process is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// A command to execute
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Kill the process once this much wall-clock time has passed
    pub timeout: Option<Duration>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            env: BTreeMap::new(),
            timeout: None,
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line as typed in a shell, for logs
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| {
            if a.contains(' ') || a.is_empty() {
                format!("'{}'", a)
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }
}

/// Output collected from a finished (or killed) process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The process was killed after exceeding its timeout
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Short description of a failure for error messages
    pub fn failure_summary(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let code = match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("{}: {}", code, line.trim()),
            None => code,
        }
    }
}

/// The only effectful primitive the matrix core uses
#[async_trait::async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command to completion. Non-zero exits and timeouts are reported
    /// in the output; only failing to start the process is an error.
    async fn run(&self, command: &ProcessCommand) -> ServiceResult<ProcessOutput>;
}

/// Runs commands as local child processes
#[derive(Debug, Clone, Default)]
pub struct LocalProcessRunner;

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn run(&self, command: &ProcessCommand) -> ServiceResult<ProcessOutput> {
        tracing::debug!(
            command = %command.display(),
            dir = %command.working_dir.display(),
            "spawning process"
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        cmd.current_dir(&command.working_dir);
        cmd.envs(&command.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own process group, so a timeout also reaches grandchildren
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ServiceError::command(command.display(), format!("failed to spawn: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServiceError::command(command.display(), "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ServiceError::command(command.display(), "stderr not captured"))?;

        // Read output streams concurrently
        let mut stdout_handle = tokio::spawn(collect_lines(stdout));
        let mut stderr_handle = tokio::spawn(collect_lines(stderr));

        let (status, timed_out) = match command.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => (status, false),
                Err(_) => {
                    tracing::warn!(command = %command.display(), ?timeout, "process timed out");
                    kill_process_group(&child);
                    let _ = child.kill().await;
                    (child.wait().await, true)
                }
            },
            None => (child.wait().await, false),
        };

        let exit_code = if timed_out {
            None
        } else {
            status?.code()
        };
        let stdout = join_reader(&mut stdout_handle).await;
        let mut stderr = join_reader(&mut stderr_handle).await;
        if timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            if let Some(timeout) = command.timeout {
                stderr.push_str(&format!("Process timed out after {:?}", timeout));
            }
        }

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}

/// Output of a reader task. If a descendant still holds the pipe open past
/// the grace period, the stream is dropped and reads as empty.
async fn join_reader(handle: &mut tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(READER_GRACE, &mut *handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            tracing::warn!("output pipe still open after process exit");
            handle.abort();
            String::new()
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: killpg takes no pointers. The group id is the child's pid,
    // set by process_group(0) at spawn.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Locate an executable on `PATH`
pub fn require_tool(name: &str) -> ServiceResult<PathBuf> {
    which::which(name).map_err(|_| ServiceError::ToolMissing(name.to_string()))
}
