use crate::command::{CommandFactory, ExitCode, Flow, LastStatus, Parsed, ShellContext};
use crate::config::ShellConfig;
use crate::env::Environment;
use crate::jobs::JobTable;
use crate::line_source::LineSource;
use crate::mode::{Mode, ModeController};
use crate::parser::LineParser;
use anyhow::{Result, anyhow};
use std::io::Write;
use tracing::debug;

/// Factory allows creating instances of ExecutableCommand.
///
/// Only supports commands defined in this crate: the builtins and ExternalCommand.
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

/// The interactive shell: owns the shell state and drives the
/// read, parse, dispatch, reap cycle.
///
/// Example
/// ```
/// use smallsh::{Interpreter, LastStatus, ScriptedSource};
/// let mut sh = Interpreter::default();
/// let mut lines = ScriptedSource::new(["# nothing to do", "status"]);
/// let code = sh.repl(&mut lines).unwrap();
/// assert_eq!(code, 0);
/// assert_eq!(sh.last_status(), LastStatus::Exited(0));
/// ```
pub struct Interpreter {
    config: ShellConfig,
    env: Environment,
    parser: LineParser,
    last_status: LastStatus,
    mode: ModeController,
    jobs: JobTable,
    commands: Vec<Box<dyn CommandFactory>>,
    out: Box<dyn Write>,
    /// Set when a deferred mode change was announced right after a foreground command.
    skip_prompt: bool,
}

impl Interpreter {
    /// Create a new interpreter with a custom set of command factories.
    ///
    /// Factories are consulted in order; the first one that accepts a command runs it.
    pub fn new(config: ShellConfig, commands: Vec<Box<dyn CommandFactory>>) -> Self {
        let parser = LineParser::new(std::process::id())
            .with_limits(config.max_line_len, config.max_args);
        Self {
            jobs: JobTable::with_capacity(config.job_capacity),
            config,
            env: Environment::new(),
            parser,
            last_status: LastStatus::default(),
            mode: ModeController::default(),
            commands,
            out: Box::new(std::io::stdout()),
            skip_prompt: false,
        }
    }

    /// Create an interpreter with the default set of commands:
    /// - built-ins: `exit`, `cd`, `status`
    /// - external command launcher
    pub fn with_config(config: ShellConfig) -> Self {
        use crate::builtin::*;
        use crate::external::ExternalCommand;
        Self::new(
            config,
            vec![
                Box::new(Factory::<Exit>::default()),
                Box::new(Factory::<Cd>::default()),
                Box::new(Factory::<Status>::default()),
                Box::new(Factory::<ExternalCommand>::default()),
            ],
        )
    }

    /// Send interactive output somewhere other than stdout.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn with_mode_controller(mut self, mode: ModeController) -> Self {
        self.mode = mode;
        self
    }

    pub fn last_status(&self) -> LastStatus {
        self.last_status
    }

    pub fn mode(&self) -> Mode {
        self.mode.mode()
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Parse and run one line.
    pub fn run_line(&mut self, line: &str) -> Result<Flow> {
        // A toggle delivered while blocked at the prompt applies to this line.
        self.announce_mode_changes()?;
        let command = match self.parser.parse(line, self.mode.mode()) {
            Parsed::Empty => return Ok(Flow::Continue),
            Parsed::Command(command) => command,
        };
        debug!(?command, "dispatching");

        let executable = self
            .commands
            .iter()
            .find_map(|factory| factory.try_create(&command))
            .ok_or_else(|| anyhow!("command not found: {}", command.program()))?;

        let mut shell = ShellContext {
            env: &mut self.env,
            jobs: &mut self.jobs,
            last_status: &mut self.last_status,
            out: &mut self.out,
        };
        let flow = executable.execute(&mut shell)?;

        // A toggle that arrived while a foreground child ran was deferred
        // until now; announce it in place of the next prompt.
        if !command.is_builtin() && !command.background() && self.announce_mode_changes()? {
            self.skip_prompt = true;
        }
        Ok(flow)
    }

    /// Run until `exit` or end of input and return the shell's exit code.
    ///
    /// End of input behaves like `exit`.
    pub fn repl(&mut self, source: &mut dyn LineSource) -> Result<ExitCode> {
        loop {
            self.announce_mode_changes()?;
            let prompt = if std::mem::take(&mut self.skip_prompt) {
                ""
            } else {
                self.config.prompt.as_str()
            };

            let Some(line) = source.read_line(prompt)? else {
                debug!("end of input");
                self.jobs.kill_all();
                return Ok(0);
            };

            if let Flow::Exit(code) = self.run_line(&line)? {
                debug!(code, "exiting");
                return Ok(code);
            }
            self.jobs.reap_once(&mut self.out)?;
        }
    }

    /// Print announcements for mode changes seen since the last call.
    fn announce_mode_changes(&mut self) -> Result<bool> {
        let announcements = self.mode.poll();
        for message in &announcements {
            writeln!(self.out, "{message}")?;
        }
        self.out.flush()?;
        Ok(!announcements.is_empty())
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::with_config(ShellConfig::default())
    }
}
