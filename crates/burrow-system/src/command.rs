//! The command-runner seam.
//!
//! External tools are described by a plain [`Cmd`] value and executed
//! through the [`CommandRunner`] trait, so components that shell out can
//! be tested against the recording fake without touching the host.

use crate::SystemError;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// A subprocess invocation: program, argv tail, and optional
/// environment override. Output is captured back into the value so
/// callers can parse stdout or attach stderr to error messages.
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    pub path: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries replacing the inherited environment, or
    /// `None` to inherit the daemon's own.
    pub env: Option<Vec<String>>,
    pub dir: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Cmd {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
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

    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, filling `cmd.stdout`/`cmd.stderr`.
    /// A non-zero exit is an error.
    fn run(&self, cmd: &mut Cmd) -> Result<(), SystemError>;
}

/// Runs commands on the host.
#[derive(Debug, Default)]
pub struct RealCommandRunner;

impl RealCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for RealCommandRunner {
    fn run(&self, cmd: &mut Cmd) -> Result<(), SystemError> {
        debug!(path = %cmd.path, args = ?cmd.args, "running command");

        let mut command = Command::new(&cmd.path);
        command.args(&cmd.args);
        if let Some(env) = &cmd.env {
            command.env_clear();
            for entry in env {
                if let Some((key, value)) = entry.split_once('=') {
                    command.env(key, value);
                }
            }
        }
        if let Some(dir) = &cmd.dir {
            command.current_dir(dir);
        }
        command
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        if let Some(data) = cmd.stdin.take() {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&data)?;
            }
        }

        let output = child.wait_with_output()?;
        cmd.stdout = output.stdout;
        cmd.stderr = output.stderr;

        if output.status.success() {
            Ok(())
        } else {
            Err(SystemError::ExitStatus(output.status.code().unwrap_or(-1)))
        }
    }
}

/// Recording fake used throughout the workspace's tests.
pub mod fake {
    use super::{Cmd, CommandRunner};
    use crate::SystemError;
    use std::sync::Mutex;

    /// Matches commands by program path and, optionally, an exact argv.
    #[derive(Debug, Clone, Default)]
    pub struct CommandSpec {
        pub path: String,
        pub args: Option<Vec<String>>,
    }

    impl CommandSpec {
        pub fn path(path: impl Into<String>) -> Self {
            Self {
                path: path.into(),
                args: None,
            }
        }

        pub fn with_args<I, S>(path: impl Into<String>, args: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                path: path.into(),
                args: Some(args.into_iter().map(Into::into).collect()),
            }
        }

        fn matches(&self, cmd: &Cmd) -> bool {
            if self.path != cmd.path {
                return false;
            }
            match &self.args {
                Some(args) => *args == cmd.args,
                None => true,
            }
        }
    }

    type Stub = Box<dyn Fn(&mut Cmd) -> Result<(), SystemError> + Send + Sync>;

    /// Records every command it is asked to run and lets tests stub
    /// results for matching invocations.
    #[derive(Default)]
    pub struct FakeCommandRunner {
        executed: Mutex<Vec<Cmd>>,
        stubs: Mutex<Vec<(CommandSpec, Stub)>>,
    }

    impl FakeCommandRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a stub invoked for every command matching `spec`.
        pub fn when_running(
            &self,
            spec: CommandSpec,
            stub: impl Fn(&mut Cmd) -> Result<(), SystemError> + Send + Sync + 'static,
        ) {
            self.stubs.lock().unwrap().push((spec, Box::new(stub)));
        }

        pub fn executed_commands(&self) -> Vec<Cmd> {
            self.executed.lock().unwrap().clone()
        }

        /// True when the given specs appear in order (not necessarily
        /// adjacent) among the executed commands.
        pub fn executed_serially(&self, specs: &[CommandSpec]) -> bool {
            let executed = self.executed.lock().unwrap();
            let mut position = 0;
            for spec in specs {
                match executed[position..].iter().position(|cmd| spec.matches(cmd)) {
                    Some(offset) => position += offset + 1,
                    None => return false,
                }
            }
            true
        }

        /// True when no executed command matches `spec`.
        pub fn never_ran(&self, spec: &CommandSpec) -> bool {
            !self.executed.lock().unwrap().iter().any(|c| spec.matches(c))
        }
    }

    impl CommandRunner for FakeCommandRunner {
        fn run(&self, cmd: &mut Cmd) -> Result<(), SystemError> {
            let result = {
                let stubs = self.stubs.lock().unwrap();
                match stubs.iter().find(|(spec, _)| spec.matches(cmd)) {
                    Some((_, stub)) => stub(cmd),
                    None => Ok(()),
                }
            };
            self.executed.lock().unwrap().push(cmd.clone());
            result
        }
    }
}

/// A runner decorator that logs each invocation and its outcome.
pub struct LoggingRunner<R> {
    inner: R,
}

impl<R: CommandRunner> LoggingRunner<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: CommandRunner> CommandRunner for LoggingRunner<R> {
    fn run(&self, cmd: &mut Cmd) -> Result<(), SystemError> {
        debug!(path = %cmd.path, args = ?cmd.args, "command starting");
        let result = self.inner.run(cmd);
        match &result {
            Ok(()) => debug!(path = %cmd.path, "command ended"),
            Err(e) => debug!(path = %cmd.path, error = %e, "command failed"),
        }
        result
    }
}
