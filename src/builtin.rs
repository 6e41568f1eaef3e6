use crate::command::{Command, CommandFactory, ExecutableCommand, Flow, ShellContext};
use crate::env::Environment;
use crate::interpreter::Factory;
use anyhow::Result;
use nix::errno::Errno;
use std::env;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// Built-in commands known to the shell at compile time.
///
/// Builtins run inside the shell process: they are never forked, ignore
/// redirections and the background marker, and never touch `last_status`.
pub(crate) trait BuiltinCommand: Sized {
    /// Canonical name of the command, e.g. "cd".
    fn name() -> &'static str;

    /// Build the command from a parsed line whose program is [`Self::name`].
    fn from_command(command: &Command) -> Self;

    fn execute(self, shell: &mut ShellContext<'_>) -> Result<Flow>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(self: Box<Self>, shell: &mut ShellContext<'_>) -> Result<Flow> {
        debug!(builtin = T::name(), "running builtin");
        T::execute(*self, shell)
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn try_create(&self, command: &Command) -> Option<Box<dyn ExecutableCommand>> {
        if command.program() == T::name() {
            Some(Box::new(T::from_command(command)))
        } else {
            None
        }
    }
}

/// Kill every background job and leave the shell with status 0.
pub struct Exit;

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn from_command(_command: &Command) -> Self {
        Exit
    }

    fn execute(self, shell: &mut ShellContext<'_>) -> Result<Flow> {
        shell.jobs.kill_all();
        Ok(Flow::Exit(0))
    }
}

/// Change the working directory; `$HOME` when no target is given.
pub struct Cd {
    pub target: Option<String>,
}

impl Cd {
    /// Absolute targets are used as is; anything else is appended to the
    /// current directory after dropping a leading `./`.
    fn destination(&self, env: &Environment) -> Option<PathBuf> {
        match self.target.as_deref() {
            None => env.home().map(PathBuf::from),
            Some(target) if target.starts_with('/') => Some(PathBuf::from(target)),
            Some(target) => {
                let relative = target.strip_prefix("./").unwrap_or(target);
                Some(env.current_dir.join(relative))
            }
        }
    }
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn from_command(command: &Command) -> Self {
        Cd {
            target: command.arguments().first().cloned(),
        }
    }

    fn execute(self, shell: &mut ShellContext<'_>) -> Result<Flow> {
        let Some(destination) = self.destination(shell.env) else {
            writeln!(shell.out, "cd: HOME not set")?;
            shell.out.flush()?;
            return Ok(Flow::Continue);
        };

        match env::set_current_dir(&destination) {
            Ok(()) => {
                shell.env.current_dir = env::current_dir().unwrap_or(destination);
                debug!(dir = %shell.env.current_dir.display(), "changed directory");
            }
            Err(err) => {
                writeln!(
                    shell.out,
                    "cd: {}: {}",
                    destination.display(),
                    describe(&err)
                )?;
                shell.out.flush()?;
            }
        }
        Ok(Flow::Continue)
    }
}

/// Print how the last foreground command finished.
pub struct Status;

impl BuiltinCommand for Status {
    fn name() -> &'static str {
        "status"
    }

    fn from_command(_command: &Command) -> Self {
        Status
    }

    fn execute(self, shell: &mut ShellContext<'_>) -> Result<Flow> {
        writeln!(shell.out, "{}", shell.last_status)?;
        shell.out.flush()?;
        Ok(Flow::Continue)
    }
}

/// The `strerror` text for OS errors, the full message otherwise.
fn describe(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => Errno::from_raw(code).desc().to_owned(),
        None => err.to_string(),
    }
}
