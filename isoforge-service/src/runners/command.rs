// Command Runner
// Executes external tools with captured output, optional timeout and bounded retries

use crate::config::{CommandConfig, InvocationLogLevel};

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;

/// A structured process invocation: executable, argument list and working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    /// Build an invocation from a whitespace-separated command line.
    ///
    /// The first token is the executable. No quoting is interpreted, so this is
    /// only suitable for fixed templates whose substitutions contain no spaces.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_whitespace();
        let program = tokens.next().ok_or(CommandError::EmptyCommand)?;
        Ok(Self::new(program).args(tokens))
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

    /// Path arguments are passed lossily; non-UTF-8 paths are not expected here
    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        let arg = path.as_ref().to_string_lossy().into_owned();
        self.arg(arg)
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// The invocation rendered as a single command line, for logs and errors
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a successful invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Default::default()
        }
    }
}

/// Errors that can occur while running an external command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command string")]
    EmptyCommand,

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {}", exit_label(.exit_code))]
    Failed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("failed to execute command after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<CommandError>,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

impl CommandError {
    /// Standard error of the failing invocation, if one ran to completion
    pub fn stderr(&self) -> Option<&str> {
        match self {
            CommandError::Failed { stderr, .. } => Some(stderr),
            CommandError::Exhausted { last, .. } => last.stderr(),
            _ => None,
        }
    }

    /// Standard output of the failing invocation, if one ran to completion
    pub fn stdout(&self) -> Option<&str> {
        match self {
            CommandError::Failed { stdout, .. } => Some(stdout),
            CommandError::Exhausted { last, .. } => last.stdout(),
            _ => None,
        }
    }
}

/// Trait for anything that can execute an [`Invocation`]
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute once. Errors exactly when the process cannot be started,
    /// exits non-zero, or exceeds the runner's timeout.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;

    /// Execute up to `attempts` times, sleeping `delay` between attempts.
    ///
    /// Returns the first success. An empty command is rejected immediately
    /// since retrying cannot fix it.
    async fn run_with_retries(
        &self,
        invocation: &Invocation,
        attempts: u32,
        delay: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run(invocation).await {
                Ok(output) => return Ok(output),
                Err(CommandError::EmptyCommand) => return Err(CommandError::EmptyCommand),
                Err(err) if attempt >= attempts => {
                    return Err(CommandError::Exhausted {
                        attempts,
                        last: Box::new(err),
                    })
                }
                Err(err) => {
                    tracing::warn!(
                        command = %invocation,
                        attempt,
                        attempts,
                        error = %err,
                        "command attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Resolve an executable on `PATH`
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Runs invocations as child processes of this service
#[derive(Debug, Clone)]
pub struct SystemRunner {
    log_invocations: bool,
    log_level: InvocationLogLevel,
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self {
            log_invocations: false,
            log_level: InvocationLogLevel::Debug,
            timeout: None,
        }
    }

    pub fn from_config(config: &CommandConfig) -> Self {
        Self {
            log_invocations: config.log_invocations,
            log_level: config.log_level,
            timeout: config.timeout(),
        }
    }

    /// Kill each attempt that runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_invocation_logging(mut self, level: InvocationLogLevel) -> Self {
        self.log_invocations = true;
        self.log_level = level;
        self
    }

    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        if invocation.program.trim().is_empty() {
            return Err(CommandError::EmptyCommand);
        }

        let command_line = invocation.command_line();
        let start = Instant::now();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.current_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        // Dropping the pending future on timeout drops the child, which kills it
        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(CommandError::TimedOut {
                        command: command_line,
                        timeout: limit,
                    })
                }
            },
            None => child.wait_with_output().await,
        };

        let output = waited.map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command_line,
                exit_code,
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            duration: start.elapsed(),
        })
    }

    fn log_result(
        &self,
        invocation: &Invocation,
        elapsed: Duration,
        result: &Result<CommandOutput, CommandError>,
    ) {
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                tracing::error!(command = %invocation, ?elapsed, error = %err, "command failed");
                return;
            }
        };

        // stderr on success is informational, not a failure signal
        let (stdout, stderr) = (output.stdout.trim_end(), output.stderr.trim_end());
        match self.log_level {
            InvocationLogLevel::Trace => {
                tracing::trace!(command = %invocation, ?elapsed, stdout, stderr, "command succeeded")
            }
            InvocationLogLevel::Debug => {
                tracing::debug!(command = %invocation, ?elapsed, stdout, stderr, "command succeeded")
            }
            InvocationLogLevel::Info => {
                tracing::info!(command = %invocation, ?elapsed, stdout, stderr, "command succeeded")
            }
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let start = Instant::now();
        let result = self.execute(invocation).await;
        if self.log_invocations {
            self.log_result(invocation, start.elapsed(), &result);
        }
        result
    }
}
