//! Subprocess invocation
//!
//! Everything that touches the cluster goes through a [`CommandRunner`]. The
//! production runner spawns `helm`/`kubectl` with tokio; [`MockRunner`] replays
//! canned outputs for tests.

use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::error::{KubeError, Result};

/// A program invocation with a human-readable description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub description: String,
    /// Piped to the child's stdin when set
    pub stdin: Option<String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            description: String::new(),
            stdin: None,
        }
    }

    pub fn helm() -> Self {
        Self::new("helm")
    }

    pub fn kubectl() -> Self {
        Self::new("kubectl")
    }

    /// Build from a full argv; the first element is the program
    pub fn from_argv(argv: &[String]) -> Self {
        let mut iter = argv.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).args(iter.cloned())
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

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Arguments with empty entries dropped
    pub fn effective_args(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(String::as_str).filter(|a| !a.is_empty())
    }

    /// The description, falling back to the command line
    pub fn label(&self) -> String {
        if self.description.is_empty() {
            self.to_string()
        } else {
            self.description.clone()
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in self.effective_args() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Convert a non-zero exit into [`KubeError::CommandFailed`]
    pub fn check(self, cmd: &Command) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(KubeError::CommandFailed {
                description: cmd.label(),
                code: self.code,
                stderr: if self.stderr.trim().is_empty() {
                    self.stdout
                } else {
                    self.stderr
                },
            })
        }
    }
}

/// Runs commands; never fails, non-zero exits are reported in the output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &Command) -> CommandOutput;

    /// Run and require a zero exit code
    async fn run_checked(&self, cmd: &Command) -> Result<CommandOutput> {
        self.run(cmd).await.check(cmd)
    }
}

/// Spawns real subprocesses
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &Command) -> CommandOutput {
        debug!("{}", cmd.label());
        trace!("exec: {}", cmd);

        let mut child = tokio::process::Command::new(&cmd.program);
        child
            .args(cmd.effective_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = match child.spawn() {
            Ok(child) => child,
            Err(e) => return CommandOutput::failed(1, format!("failed to start {}: {}", cmd.program, e)),
        };

        // Feed stdin while draining stdout/stderr, or a chatty child blocks on a full pipe
        let pipe = child.stdin.take();
        let feed = async move {
            match (&cmd.stdin, pipe) {
                (Some(input), Some(mut pipe)) => pipe.write_all(input.as_bytes()).await,
                _ => Ok(()),
            }
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());

        let output = match output {
            Ok(output) => output,
            Err(e) => return CommandOutput::failed(1, e.to_string()),
        };
        match written {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe && output.status.success() => {
                CommandOutput::failed(1, format!("failed to write stdin: {}", e))
            }
            _ => CommandOutput {
                code: exit_code(&output.status),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
        }
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// A lifecycle event recorded by [`MockRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Started(String),
    Finished(String),
}

struct Canned {
    prefix: String,
    output: CommandOutput,
    remaining: Option<usize>,
}

/// In-memory runner for testing
///
/// Responses are matched by command-line prefix; the most recently registered
/// match wins. Unmatched commands succeed with empty output.
#[derive(Clone, Default)]
pub struct MockRunner {
    responses: Arc<Mutex<Vec<Canned>>>,
    history: Arc<Mutex<Vec<Command>>>,
    events: Arc<Mutex<Vec<MockEvent>>>,
    delay: Option<Duration>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every command
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Respond to every command starting with `prefix`
    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        self.push(prefix, output, None);
        self
    }

    /// Respond to the next `times` commands starting with `prefix`
    pub fn on_times(&self, prefix: &str, output: CommandOutput, times: usize) -> &Self {
        self.push(prefix, output, Some(times));
        self
    }

    fn push(&self, prefix: &str, output: CommandOutput, remaining: Option<usize>) {
        lock(&self.responses).push(Canned {
            prefix: prefix.to_string(),
            output,
            remaining,
        });
    }

    /// Every command run so far, in start order
    pub fn history(&self) -> Vec<Command> {
        lock(&self.history).clone()
    }

    /// Command lines run so far
    pub fn command_lines(&self) -> Vec<String> {
        self.history().iter().map(ToString::to_string).collect()
    }

    /// Command lines starting with `prefix`
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.command_lines()
            .into_iter()
            .filter(|line| line.starts_with(prefix))
            .collect()
    }

    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.events).clone()
    }

    fn respond(&self, line: &str) -> CommandOutput {
        let mut responses = lock(&self.responses);
        let matched = responses
            .iter_mut()
            .rev()
            .find(|c| line.starts_with(&c.prefix) && c.remaining != Some(0));
        match matched {
            Some(canned) => {
                if let Some(remaining) = canned.remaining.as_mut() {
                    *remaining -= 1;
                }
                canned.output.clone()
            }
            None => CommandOutput::ok(""),
        }
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, cmd: &Command) -> CommandOutput {
        let line = cmd.to_string();
        lock(&self.history).push(cmd.clone());
        lock(&self.events).push(MockEvent::Started(line.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let output = self.respond(&line);
        lock(&self.events).push(MockEvent::Finished(line));
        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
