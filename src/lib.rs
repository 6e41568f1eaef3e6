//! A small interactive shell with background jobs and a foreground-only mode.
//!
//! Each input line is one command: a program with arguments, optional
//! `< infile` and `> outfile` redirections and an optional trailing `&`.
//! `exit`, `cd` and `status` run inside the shell; everything else is forked
//! and exec'd. `$$` expands to the shell's pid and `#` starts a comment line.
//!
//! `SIGTSTP` toggles foreground-only mode, in which `&` is accepted but
//! ignored. `SIGINT` never affects the shell, only a running foreground child.
//!
//! The main entry point is [`Interpreter`], which reads lines from a
//! [`LineSource`] and writes its interactive output (prompts aside) to any
//! [`std::io::Write`].

mod builtin;
pub mod command;
pub mod config;
pub mod env;
pub mod external;
mod interpreter;
mod io_adapters;
pub mod jobs;
pub mod lexer;
mod line_source;
pub mod mode;
pub mod parser;

pub use command::{Command, ExitCode, LastStatus, Parsed};
pub use config::ShellConfig;
pub use interpreter::Interpreter;
pub use io_adapters::{MemWriter, ScriptedSource};
pub use line_source::{EditorSource, LineSource};
