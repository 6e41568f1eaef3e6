use crate::command::{
    Command, CommandFactory, ExecutableCommand, Flow, LAUNCH_FAILURE, LastStatus, ShellContext,
};
use crate::interpreter::Factory;
use crate::jobs::JobTableError;
use crate::mode::{self, StopSignalDeferral};
use anyhow::Result;
use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, pthread_sigmask};
use nix::sys::stat::Mode;
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{ForkResult, Pid, execv, execvp, fork};
use std::borrow::Cow;
use std::ffi::{CString, NulError, OsStr};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

/// Stands in for a missing redirection of a background command.
const DEV_NULL: &str = "/dev/null";

/// Permissions of files created by `> file`.
const OUTPUT_MODE: u32 = 0o600;

/// Any of the user, group or other execute bits.
const EXECUTE_BITS: u32 = 0o111;

/// Failures of the launcher that the shell itself cannot recover from.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("fork failed: {0}")]
    Fork(#[source] Errno),
    #[error("cannot defer stop signal: {0}")]
    SignalMask(#[source] Errno),
    #[error("waiting for pid {pid} failed: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: Errno,
    },
    #[error(transparent)]
    JobTable(#[from] JobTableError),
}

/// Command that is not a builtin: run in a forked child.
pub struct ExternalCommand {
    command: Command,
}

impl ExternalCommand {
    pub fn new(command: Command) -> Self {
        Self { command }
    }
}

impl CommandFactory for Factory<ExternalCommand> {
    /// Accepts every program, so it must be the last factory consulted.
    fn try_create(&self, command: &Command) -> Option<Box<dyn ExecutableCommand>> {
        Some(Box::new(ExternalCommand::new(command.clone())))
    }
}

impl ExecutableCommand for ExternalCommand {
    fn execute(self: Box<Self>, shell: &mut ShellContext<'_>) -> Result<Flow> {
        launch(&self.command, shell)?;
        Ok(Flow::Continue)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Input,
    Output,
}

/// A standard stream the child replaces before exec.
#[derive(Debug)]
struct Redirect {
    path: CString,
    direction: Direction,
    /// Subject of the error line if the open fails.
    failure: String,
}

impl Redirect {
    fn input(path: &str) -> Result<Self, NulError> {
        Ok(Redirect {
            path: CString::new(path)?,
            direction: Direction::Input,
            failure: format!("cannot open {path} for input"),
        })
    }

    fn output(path: &str) -> Result<Self, NulError> {
        Ok(Redirect {
            path: CString::new(path)?,
            direction: Direction::Output,
            failure: format!("cannot open {path} for output"),
        })
    }

    fn open(&self) -> Result<OwnedFd, Errno> {
        match self.direction {
            Direction::Input => open(self.path.as_c_str(), OFlag::O_RDONLY, Mode::empty()),
            Direction::Output => open(
                self.path.as_c_str(),
                OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                Mode::from_bits_truncate(OUTPUT_MODE),
            ),
        }
    }

    fn target(&self) -> RawFd {
        match self.direction {
            Direction::Input => nix::libc::STDIN_FILENO,
            Direction::Output => nix::libc::STDOUT_FILENO,
        }
    }

    /// Open the file and put it in place of the standard stream.
    fn apply(&self) -> Result<(), Errno> {
        let fd = self.open()?;
        // SAFETY: both descriptors are open; `fd` closes its own copy on drop.
        let rc = unsafe { nix::libc::dup2(fd.as_raw_fd(), self.target()) };
        Errno::result(rc).map(drop)
    }
}

/// Everything the child needs, prepared before fork so the child only
/// performs system calls.
#[derive(Debug)]
struct ChildPlan {
    program: CString,
    /// Program found through `PATH`; `None` lets `execvp` produce the error.
    executable: Option<CString>,
    argv: Vec<CString>,
    stdin: Option<Redirect>,
    stdout: Option<Redirect>,
    foreground: bool,
}

impl ChildPlan {
    fn new(command: &Command, search_path: Option<&str>) -> Result<Self, NulError> {
        let program = CString::new(command.program())?;
        let mut argv = Vec::with_capacity(command.arguments().len() + 1);
        argv.push(program.clone());
        for arg in command.arguments() {
            argv.push(CString::new(arg.as_str())?);
        }

        let executable = search_path
            .and_then(|paths| find_command_path(OsStr::new(paths), Path::new(command.program())))
            .map(|path| CString::new(path.as_os_str().as_bytes()))
            .transpose()?;

        let background = command.background();
        let stdin = match command.input_file() {
            Some(path) => Some(Redirect::input(path)?),
            None if background => Some(Redirect::input(DEV_NULL)?),
            None => None,
        };
        let stdout = match command.output_file() {
            Some(path) => Some(Redirect::output(path)?),
            None if background => Some(Redirect::output(DEV_NULL)?),
            None => None,
        };

        Ok(ChildPlan {
            program,
            executable,
            argv,
            stdin,
            stdout,
            foreground: !background,
        })
    }
}

/// Fork and run `command`.
///
/// A background child is registered in the job table and announced; a
/// foreground child is waited for, with the stop signal deferred until it
/// finishes, and its result becomes the new `last_status`.
pub fn launch(command: &Command, shell: &mut ShellContext<'_>) -> Result<()> {
    let plan = match ChildPlan::new(command, shell.env.search_path()) {
        Ok(plan) => plan,
        Err(_) => {
            writeln!(shell.out, "{}: argument contains a NUL byte", command.program())?;
            shell.out.flush()?;
            if !command.background() {
                *shell.last_status = LastStatus::Exited(LAUNCH_FAILURE);
            }
            return Ok(());
        }
    };

    let deferral = if plan.foreground {
        Some(StopSignalDeferral::engage().map_err(LaunchError::SignalMask)?)
    } else {
        None
    };

    // SAFETY: the child branch only calls `run_child`, which execs or exits.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            run_child(&plan, deferral.as_ref().map(StopSignalDeferral::previous_mask))
        }
        Err(errno) => {
            error!(%errno, program = command.program(), "fork failed");
            return Err(LaunchError::Fork(errno).into());
        }
    };
    debug!(%pid, program = command.program(), foreground = plan.foreground, "forked child");

    if !plan.foreground {
        if let Err(err) = shell.jobs.register(pid) {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return Err(LaunchError::from(err).into());
        }
        writeln!(shell.out, "background pid is {pid}")?;
        shell.out.flush()?;
        return Ok(());
    }

    let status = wait_foreground(pid)?;
    drop(deferral);
    debug!(%pid, %status, "foreground child finished");

    *shell.last_status = status;
    if let LastStatus::Signaled(signal) = status {
        writeln!(shell.out, "terminated by signal {signal}")?;
        shell.out.flush()?;
    }
    Ok(())
}

/// Block until `pid` exits, is killed, or stops.
fn wait_foreground(pid: Pid) -> Result<LastStatus, LaunchError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(status) => {
                if let Some(status) = LastStatus::from_wait_status(status) {
                    return Ok(status);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(LaunchError::Wait { pid, source }),
        }
    }
}

/// Child side of the fork. Never returns to the shell's control flow.
fn run_child(plan: &ChildPlan, mask: Option<&SigSet>) -> ! {
    mode::reset_child_signals(plan.foreground);
    if let Some(mask) = mask {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(mask), None);
    }

    for redirect in plan.stdin.iter().chain(plan.stdout.iter()) {
        if let Err(errno) = redirect.apply() {
            exit_with_error(redirect.failure.as_bytes(), errno);
        }
    }

    let result = match &plan.executable {
        Some(path) => execv(path, &plan.argv),
        None => execvp(&plan.program, &plan.argv),
    };
    let errno = match result {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    exit_with_error(plan.program.as_bytes(), errno)
}

/// Write `subject: strerror` to stderr and leave with the launch failure code.
///
/// Uses raw writes only: no locks or formatting after fork.
fn exit_with_error(subject: &[u8], errno: Errno) -> ! {
    let stderr = io::stderr();
    for part in [subject, &b": "[..], errno.desc().as_bytes(), &b"\n"[..]] {
        let _ = nix::unistd::write(&stderr, part);
    }
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { nix::libc::_exit(LAUNCH_FAILURE) }
}

/// Resolve a program name the way a typical shell would.
///
/// Behavior:
/// - Absolute path: returns it if it names a file.
/// - Relative with multiple components (e.g., `bin/sh`, `./run`): returns it if it
///   names a file, relative to the current directory.
/// - Single component: search each directory in `search_paths` (PATH) and return
///   the first executable file found, skipping files without an execute bit.
/// - Empty path: returns `None`.
///
/// Returns either a borrowed reference to the provided `path` or an owned `PathBuf`
/// when the result is discovered via PATH lookup.
pub fn find_command_path<'a>(search_paths: &OsStr, path: &'a Path) -> Option<Cow<'a, Path>> {
    if path.is_absolute() {
        return find_by_path(path).map(Cow::Borrowed);
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (None, _) => None,
        (Some(name), None) if !path.starts_with(".") => {
            find_in_path(search_paths, name.as_os_str()).map(Cow::Owned)
        }
        _ => find_by_path(path).map(Cow::Borrowed),
    }
}

fn find_in_path(search_paths: &OsStr, cmd: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_paths)
        .map(|dir| dir.join(cmd))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & EXECUTE_BITS != 0)
}

fn find_by_path(path: &Path) -> Option<&Path> {
    if path.is_file() { Some(path) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Parsed;
    use crate::env::Environment;
    use crate::jobs::JobTable;
    use crate::mode::Mode;
    use crate::parser::parse_line;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn osstr(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    struct Harness {
        env: Environment,
        jobs: JobTable,
        last_status: LastStatus,
        out: Vec<u8>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                env: Environment::new(),
                jobs: JobTable::with_capacity(8),
                last_status: LastStatus::default(),
                out: Vec::new(),
            }
        }

        fn run(&mut self, line: &str) {
            let Parsed::Command(command) = parse_line(line, std::process::id(), Mode::Normal)
            else {
                panic!("expected a command for {line:?}");
            };
            let mut shell = ShellContext {
                env: &mut self.env,
                jobs: &mut self.jobs,
                last_status: &mut self.last_status,
                out: &mut self.out,
            };
            launch(&command, &mut shell).unwrap();
        }

        fn output(&self) -> String {
            String::from_utf8(self.out.clone()).unwrap()
        }

        fn reap_all(&mut self) -> Vec<crate::jobs::Reaped> {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut reaped = Vec::new();
            while !self.jobs.is_empty() && Instant::now() < deadline {
                reaped.extend(self.jobs.reap_once(&mut self.out).unwrap());
                thread::sleep(Duration::from_millis(20));
            }
            reaped
        }
    }

    fn script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn output_redirection_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.txt");
        let mut harness = Harness::new();

        harness.run(&format!("echo hi > {}", out_path.display()));

        assert_eq!(fs::read_to_string(&out_path).unwrap(), "hi\n");
        assert_eq!(harness.last_status, LastStatus::Exited(0));
        assert_eq!(
            fs::metadata(&out_path).unwrap().permissions().mode() & 0o777,
            OUTPUT_MODE
        );
        assert!(harness.output().is_empty());
    }

    #[test]
    fn output_redirection_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.txt");
        fs::write(&out_path, "something much longer than the new content\n").unwrap();
        let mut harness = Harness::new();

        harness.run(&format!("echo new > {}", out_path.display()));

        assert_eq!(fs::read_to_string(&out_path).unwrap(), "new\n");
    }

    #[test]
    fn input_and_output_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let in_path = dir.path().join("in.txt");
        let out_path = dir.path().join("sorted.txt");
        fs::write(&in_path, "b\na\nc\n").unwrap();
        let mut harness = Harness::new();

        harness.run(&format!(
            "sort < {} > {}",
            in_path.display(),
            out_path.display()
        ));

        assert_eq!(fs::read_to_string(&out_path).unwrap(), "a\nb\nc\n");
        assert_eq!(harness.last_status, LastStatus::Exited(0));
    }

    #[test]
    fn exit_code_becomes_last_status() {
        let dir = tempfile::tempdir().unwrap();
        let exit3 = script(&dir, "exit3.sh", "exit 3\n");
        let mut harness = Harness::new();

        harness.run(&format!("sh {exit3}"));

        assert_eq!(harness.last_status, LastStatus::Exited(3));
        assert_eq!(harness.last_status.to_string(), "exit value 3");
        assert!(harness.output().is_empty());
    }

    #[test]
    fn killed_foreground_child_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let suicide = script(&dir, "kill9.sh", "kill -9 $$\n");
        let mut harness = Harness::new();

        harness.run(&format!("sh {suicide}"));

        assert_eq!(harness.last_status, LastStatus::Signaled(9));
        assert_eq!(harness.output(), "terminated by signal 9\n");
    }

    #[test]
    fn missing_program_exits_with_launch_failure() {
        let mut harness = Harness::new();
        harness.run("definitely-not-a-program-4a1b2c");
        assert_eq!(harness.last_status, LastStatus::Exited(LAUNCH_FAILURE));
    }

    #[test]
    fn unreadable_input_exits_with_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("never.txt");
        let mut harness = Harness::new();

        harness.run(&format!(
            "cat < {} > {}",
            dir.path().join("missing.txt").display(),
            out_path.display()
        ));

        assert_eq!(harness.last_status, LastStatus::Exited(LAUNCH_FAILURE));
        assert!(!out_path.exists());
    }

    #[test]
    fn nul_byte_is_rejected_before_fork() {
        let mut harness = Harness::new();
        harness.run("echo a\0b");
        assert_eq!(harness.last_status, LastStatus::Exited(LAUNCH_FAILURE));
        assert_eq!(harness.output(), "echo: argument contains a NUL byte\n");
    }

    #[test]
    fn redirection_paths_are_checked_before_fork() {
        let mut harness = Harness::new();
        harness.run("cat < in\0put");
        assert_eq!(harness.last_status, LastStatus::Exited(LAUNCH_FAILURE));
        assert_eq!(harness.output(), "cat: argument contains a NUL byte\n");
        assert!(harness.jobs.is_empty());
    }

    #[test]
    fn long_output_path_is_created() {
        let dir = tempfile::tempdir().unwrap();
        // Past the length std handles on the stack.
        let nested = dir.path().join("d".repeat(200)).join("e".repeat(200));
        fs::create_dir_all(&nested).unwrap();
        let out_path = nested.join("out.txt");
        let mut harness = Harness::new();

        harness.run(&format!("echo deep > {}", out_path.display()));

        assert_eq!(fs::read_to_string(&out_path).unwrap(), "deep\n");
        assert_eq!(harness.last_status, LastStatus::Exited(0));
    }

    #[test]
    fn background_child_is_registered_and_reaped() {
        let mut harness = Harness::new();
        harness.last_status = LastStatus::Exited(4);

        // No redirection: stdin is /dev/null, so cat sees EOF at once.
        harness.run("cat &");

        let pids = harness.jobs.pids();
        assert_eq!(pids.len(), 1);
        assert_eq!(harness.output(), format!("background pid is {}\n", pids[0]));
        assert_eq!(harness.last_status, LastStatus::Exited(4));

        let reaped = harness.reap_all();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, LastStatus::Exited(0));
        assert!(
            harness
                .output()
                .ends_with(&format!("background pid {} is done: exit value 0\n", pids[0]))
        );
    }

    #[test]
    fn background_output_redirection_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("bg.txt");
        let mut harness = Harness::new();

        harness.run(&format!("echo from background > {} &", out_path.display()));
        harness.reap_all();

        assert_eq!(fs::read_to_string(&out_path).unwrap(), "from background\n");
    }

    #[test]
    fn full_job_table_is_an_error() {
        let mut harness = Harness::new();
        harness.jobs = JobTable::with_capacity(0);
        let Parsed::Command(command) = parse_line("sleep 5 &", 1, Mode::Normal) else {
            panic!("expected a command");
        };
        let mut shell = ShellContext {
            env: &mut harness.env,
            jobs: &mut harness.jobs,
            last_status: &mut harness.last_status,
            out: &mut harness.out,
        };

        let err = launch(&command, &mut shell).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::JobTable(JobTableError::Full { capacity: 0 }))
        ));
    }

    #[test]
    fn absolute_existing() {
        let res = find_command_path(osstr("/does/not/matter"), Path::new("/bin/sh"));
        assert_eq!(res.as_deref(), Some(Path::new("/bin/sh")));
    }

    #[test]
    fn absolute_nonexisting() {
        let res = find_command_path(osstr("/bin"), Path::new("/bin/nonexisting"));
        assert!(res.is_none());
    }

    #[test]
    fn single_component_found_in_path() {
        let found = find_command_path(osstr("/nonexistent:/bin"), Path::new("sh"))
            .expect("Expected to find 'sh' in /bin via PATH search");
        assert_eq!(found.as_ref(), Path::new("/bin/sh"));
    }

    #[test]
    fn single_component_not_found_in_path() {
        let res = find_command_path(osstr("/bin"), Path::new("nonexisting"));
        assert!(res.is_none());
    }

    #[test]
    fn directories_are_not_programs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("tool")).unwrap();
        let res = find_command_path(dir.path().as_os_str(), Path::new("tool"));
        assert!(res.is_none());
    }

    #[test]
    fn non_executable_file_does_not_shadow_later_entries() {
        let dir = tempfile::tempdir().unwrap();
        let decoy = dir.path().join("sh");
        fs::write(&decoy, "not a program\n").unwrap();
        fs::set_permissions(&decoy, fs::Permissions::from_mode(0o644)).unwrap();
        let search = format!("{}:/bin", dir.path().display());

        let found = find_command_path(osstr(&search), Path::new("sh")).unwrap();

        assert_eq!(found.as_ref(), Path::new("/bin/sh"));
    }

    #[test]
    fn launch_skips_non_executable_path_entry() {
        let dir = tempfile::tempdir().unwrap();
        let decoy = dir.path().join("true");
        fs::write(&decoy, "").unwrap();
        fs::set_permissions(&decoy, fs::Permissions::from_mode(0o644)).unwrap();
        let mut harness = Harness::new();
        harness.env = Environment::with_vars([(
            "PATH",
            format!("{}:/usr/bin:/bin", dir.path().display()),
        )]);
        harness.last_status = LastStatus::Exited(7);

        harness.run("true");

        assert_eq!(harness.last_status, LastStatus::Exited(0));
    }

    #[test]
    fn empty_path_is_none() {
        assert!(find_command_path(osstr("/bin"), Path::new("")).is_none());
    }
}
