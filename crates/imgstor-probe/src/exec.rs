//! Structured process execution.
//!
//! An [`Invocation`] is either a local [`Command`] or a [`RemoteCommand`]
//! that runs a command on a peer over ssh, optionally as another user. The
//! shell rendering needed for the remote case happens in one place,
//! [`Invocation::argv`], after every argument has been checked.

use std::fmt;
use std::io::Read;
use std::process::Stdio;

use thiserror::Error;
use tracing::debug;

/// ssh client used for remote invocations.
pub const SSH: &str = "/usr/bin/ssh";

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: String,
    args: Vec<String>,
}

impl Command {
    /// Starts a command for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program name or path.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, without the program.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A command to run on another host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Host to ssh into.
    pub host: String,
    /// Local user whose ssh identity is used (`su <user> -c ...`).
    pub run_as: Option<String>,
    /// Command run on the remote host.
    pub command: Command,
}

/// Something a [`CommandRunner`] can execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Run on this host.
    Local(Command),
    /// Run on a peer over ssh.
    Remote(RemoteCommand),
}

impl Invocation {
    /// Wraps a local command.
    pub fn local(command: Command) -> Self {
        Invocation::Local(command)
    }

    /// Wraps a command for `host`, run with the ssh identity of `run_as`.
    pub fn remote(host: impl Into<String>, run_as: Option<String>, command: Command) -> Self {
        Invocation::Remote(RemoteCommand {
            host: host.into(),
            run_as,
            command,
        })
    }

    /// The argument vector handed to the OS.
    ///
    /// Remote commands go through a shell on both ends, so every piece is
    /// restricted to characters that need no quoting.
    pub fn argv(&self) -> Result<Vec<String>, ExecutionError> {
        match self {
            Invocation::Local(command) => Ok(command.argv()),
            Invocation::Remote(remote) => {
                check_shell_safe(&remote.host)?;
                for arg in remote.command.argv() {
                    check_shell_safe(&arg)?;
                }
                match &remote.run_as {
                    Some(user) => {
                        check_shell_safe(user)?;
                        Ok(vec![
                            "su".to_string(),
                            user.clone(),
                            "-c".to_string(),
                            format!("{} {} \"{}\"", SSH, remote.host, remote.command),
                        ])
                    }
                    None => {
                        let mut argv = vec![SSH.to_string(), remote.host.clone()];
                        argv.extend(remote.command.argv());
                        Ok(argv)
                    }
                }
            }
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Local(command) => write!(f, "{}", command),
            Invocation::Remote(remote) => write!(f, "[{}] {}", remote.host, remote.command),
        }
    }
}

fn check_shell_safe(arg: &str) -> Result<(), ExecutionError> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | '@' | ':' | '='));
    if safe {
        Ok(())
    } else {
        Err(ExecutionError::UnsafeArgument {
            arg: arg.to_string(),
        })
    }
}

/// Details of a command that ran and exited unsuccessfully.
#[derive(Debug)]
pub struct CommandFailureInfo {
    /// Rendered command line.
    pub command: String,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "Command [{}] failed with exit code {}", self.command, code)?,
            None => write!(f, "Command [{}] was terminated by a signal", self.command)?,
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {}", stderr)?;
        }
        Ok(())
    }
}

/// Errors from running external tools.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The process could not be started at all.
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart {
        /// Rendered command line.
        command: String,
        /// Spawn error.
        err: std::io::Error,
    },

    /// The process ran and failed.
    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    /// Output did not have the expected shape.
    #[error("Failed to parse output of [{command}]: {reason}")]
    ParseFailure {
        /// Rendered command line.
        command: String,
        /// What was wrong.
        reason: String,
    },

    /// An argument for a remote command would need shell quoting.
    #[error("refusing unsafe argument {arg:?} in remote command")]
    UnsafeArgument {
        /// Offending argument.
        arg: String,
    },
}

impl ExecutionError {
    /// Builds a [`ExecutionError::CommandFailure`].
    pub fn failure(
        command: impl Into<String>,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
            command: command.into(),
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }))
    }

    /// Builds a [`ExecutionError::ParseFailure`].
    pub fn parse(command: impl fmt::Display, reason: impl Into<String>) -> Self {
        ExecutionError::ParseFailure {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    /// True if the tool ran and reported failure through its exit status.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, ExecutionError::CommandFailure(_))
    }
}

/// Executes invocations and returns their stdout split into lines.
pub trait CommandRunner: Send + Sync {
    /// Runs one invocation to completion.
    fn run(&self, invocation: &Invocation) -> Result<Vec<String>, ExecutionError>;

    /// Runs `producer | consumer` and returns the consumer's output.
    fn pipe(
        &self,
        producer: &Invocation,
        consumer: &Invocation,
    ) -> Result<Vec<String>, ExecutionError>;
}

/// Runs invocations as child processes of this daemon.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl HostRunner {
    /// Creates a runner.
    pub fn new() -> Self {
        Self
    }
}

fn to_process(argv: &[String]) -> std::process::Command {
    let mut command = std::process::Command::new(&argv[0]);
    command.args(&argv[1..]);
    command
}

fn to_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

impl CommandRunner for HostRunner {
    fn run(&self, invocation: &Invocation) -> Result<Vec<String>, ExecutionError> {
        let argv = invocation.argv()?;
        let rendered = argv.join(" ");
        debug!(command = %rendered, "running");

        let output = to_process(&argv)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| ExecutionError::ExecutionStart {
                command: rendered.clone(),
                err,
            })?;

        if !output.status.success() {
            return Err(ExecutionError::failure(
                rendered,
                output.status.code(),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(to_lines(&output.stdout))
    }

    fn pipe(
        &self,
        producer: &Invocation,
        consumer: &Invocation,
    ) -> Result<Vec<String>, ExecutionError> {
        let producer_argv = producer.argv()?;
        let consumer_argv = consumer.argv()?;
        let producer_cmd = producer_argv.join(" ");
        let consumer_cmd = consumer_argv.join(" ");
        debug!(producer = %producer_cmd, consumer = %consumer_cmd, "running pipeline");

        let mut upstream = to_process(&producer_argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ExecutionError::ExecutionStart {
                command: producer_cmd.clone(),
                err,
            })?;

        let Some(stream) = upstream.stdout.take() else {
            let _ = upstream.kill();
            return Err(ExecutionError::parse(&producer_cmd, "stdout was not captured"));
        };

        // Drained concurrently: a producer blocked on a full stderr pipe
        // would never close its stdout.
        let stderr_reader = upstream.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let downstream = match to_process(&consumer_argv)
            .stdin(Stdio::from(stream))
            .output()
        {
            Ok(output) => output,
            Err(err) => {
                let _ = upstream.kill();
                let _ = upstream.wait();
                return Err(ExecutionError::ExecutionStart {
                    command: consumer_cmd,
                    err,
                });
            }
        };

        let upstream_status = upstream.wait().map_err(|err| ExecutionError::ExecutionStart {
            command: producer_cmd.clone(),
            err,
        })?;

        let upstream_stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if !upstream_status.success() {
            return Err(ExecutionError::failure(
                producer_cmd,
                upstream_status.code(),
                "",
                String::from_utf8_lossy(&upstream_stderr),
            ));
        }
        if !downstream.status.success() {
            return Err(ExecutionError::failure(
                consumer_cmd,
                downstream.status.code(),
                String::from_utf8_lossy(&downstream.stdout),
                String::from_utf8_lossy(&downstream.stderr),
            ));
        }
        Ok(to_lines(&downstream.stdout))
    }
}
