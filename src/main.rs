use anyhow::{Context, Result};
use argh::FromArgs;
use smallsh::config::DEFAULT_PROMPT;
use smallsh::{EditorSource, ExitCode, Interpreter, ShellConfig, mode};
use std::{env, process};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// A small interactive shell: run commands in the foreground or with a
/// trailing `&` in the background. Ctrl-Z toggles foreground-only mode.
struct Args {
    #[argh(option, default = "DEFAULT_PROMPT.to_owned()")]
    /// text printed before each command line.
    prompt: String,

    #[argh(option, default = "String::from(\"warn\")")]
    /// diagnostics filter used when RUST_LOG is unset (e.g. "debug").
    log_level: String,
}

fn main() {
    let args: Args = argh::from_env();

    // Diagnostics go to stderr so the interactive output on stdout stays exact.
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from(filter))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("smallsh: {err:#}");
            1
        }
    };
    process::exit(code);
}

fn run(args: Args) -> Result<ExitCode> {
    mode::install_signal_handlers().context("failed to install signal handlers")?;
    let mut source = EditorSource::new()?;

    let config = ShellConfig::default().with_prompt(args.prompt);
    debug!(?config, pid = process::id(), "starting shell");
    let mut shell = Interpreter::with_config(config);
    shell.repl(&mut source)
}
