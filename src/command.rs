use crate::env::Environment;
use crate::jobs::JobTable;
use anyhow::Result;
use nix::sys::wait::WaitStatus;
use std::fmt;
use std::io::Write;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
pub type ExitCode = i32;

/// Exit code a launched child uses when redirection or exec fails.
pub const LAUNCH_FAILURE: ExitCode = 1;

/// Names of the commands executed inside the shell process.
pub const BUILTINS: [&str; 3] = ["exit", "cd", "status"];

/// How the most recent foreground command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastStatus {
    /// Normal termination with an exit code.
    Exited(ExitCode),
    /// Termination (or stop) by the given signal number.
    Signaled(i32),
}

impl Default for LastStatus {
    fn default() -> Self {
        LastStatus::Exited(0)
    }
}

impl LastStatus {
    /// Translate a `waitpid` result into a status, if the child is finished.
    ///
    /// A stopped child counts as finished so a foreground wait never hangs on it.
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(LastStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(LastStatus::Signaled(signal as i32)),
            WaitStatus::Stopped(_, signal) => Some(LastStatus::Signaled(signal as i32)),
            _ => None,
        }
    }
}

impl fmt::Display for LastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastStatus::Exited(code) => write!(f, "exit value {code}"),
            LastStatus::Signaled(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Result of parsing one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Blank line or comment: nothing to run, just prompt again.
    Empty,
    Command(Command),
}

/// A single parsed command line.
///
/// Fields are fixed once the parser builds the value; accessors only borrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub(crate) program: String,
    pub(crate) arguments: Vec<String>,
    pub(crate) input_file: Option<String>,
    pub(crate) output_file: Option<String>,
    pub(crate) background: bool,
}

impl Command {
    /// Name or path of the program (never empty).
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments after the program name, without redirections or `&`.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn input_file(&self) -> Option<&str> {
        self.input_file.as_deref()
    }

    pub fn output_file(&self) -> Option<&str> {
        self.output_file.as_deref()
    }

    /// True only when the line ended in `&` and background execution was allowed.
    pub fn background(&self) -> bool {
        self.background
    }

    pub fn is_builtin(&self) -> bool {
        BUILTINS.contains(&self.program.as_str())
    }
}

/// What the shell loop should do after a command ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Leave the loop and terminate the shell with this code.
    Exit(ExitCode),
}

/// Mutable view of the shell state handed to a running command.
pub struct ShellContext<'a> {
    pub env: &'a mut Environment,
    pub jobs: &'a mut JobTable,
    pub last_status: &'a mut LastStatus,
    /// Interactive output stream (prompts, job reports, `status`).
    pub out: &'a mut dyn Write,
}

/// Object-safe trait for any command that can be executed by the shell.
///
/// Implemented by the builtins and by the external program launcher.
pub trait ExecutableCommand {
    fn execute(self: Box<Self>, shell: &mut ShellContext<'_>) -> Result<Flow>;
}

/// Factory that tries to create an executable command from a parsed line.
///
/// Returns `None` when the factory doesn't recognize the program.
pub trait CommandFactory {
    fn try_create(&self, command: &Command) -> Option<Box<dyn ExecutableCommand>>;
}
