//! Foreground-only mode, toggled by `SIGTSTP`.
//!
//! The signal handler does exactly one thing: bump an atomic counter. Every
//! other part of a transition (flipping the mode, printing the announcement)
//! happens on the main loop when [`ModeController::poll`] notices the counter
//! moved. Each toggle the handler sees is therefore applied exactly once and
//! in order, even if several arrive between two polls.

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask, sigaction,
};
use std::ffi::c_int;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Signal that flips the mode.
pub const STOP_SIGNAL: Signal = Signal::SIGTSTP;

/// Signal that interrupts a foreground child.
pub const INTERRUPT_SIGNAL: Signal = Signal::SIGINT;

pub const ENTER_MESSAGE: &str = "Entering foreground-only mode (& is now ignored)";
pub const EXIT_MESSAGE: &str = "Exiting foreground-only mode";

/// Number of stop signals delivered to the shell so far.
static STOP_SIGNALS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_stop_signal(_: c_int) {
    STOP_SIGNALS.fetch_add(1, Ordering::SeqCst);
}

/// Whether a trailing `&` is currently honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    ForegroundOnly,
}

impl Mode {
    pub fn allows_background(self) -> bool {
        self == Mode::Normal
    }

    fn toggled(self) -> Self {
        match self {
            Mode::Normal => Mode::ForegroundOnly,
            Mode::ForegroundOnly => Mode::Normal,
        }
    }

    /// Line printed when the shell enters this mode.
    pub fn announcement(self) -> &'static str {
        match self {
            Mode::Normal => EXIT_MESSAGE,
            Mode::ForegroundOnly => ENTER_MESSAGE,
        }
    }
}

/// Two-state machine driven by the stop-signal counter.
#[derive(Debug)]
pub struct ModeController {
    mode: Mode,
    observed: usize,
    counter: &'static AtomicUsize,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::with_counter(&STOP_SIGNALS)
    }
}

impl ModeController {
    /// Controller fed by `counter` instead of the process-wide signal counter.
    pub fn with_counter(counter: &'static AtomicUsize) -> Self {
        ModeController {
            mode: Mode::Normal,
            observed: counter.load(Ordering::SeqCst),
            counter,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Apply every transition delivered since the last poll.
    ///
    /// Returns the announcements to print, oldest first.
    pub fn poll(&mut self) -> Vec<&'static str> {
        let delivered = self.counter.load(Ordering::SeqCst);
        let mut announcements = Vec::new();
        while self.observed != delivered {
            self.mode = self.mode.toggled();
            self.observed = self.observed.wrapping_add(1);
            debug!(mode = ?self.mode, "foreground-only mode toggled");
            announcements.push(self.mode.announcement());
        }
        announcements
    }
}

/// Set the shell's own dispositions: ignore interrupts, count stop signals.
///
/// The stop handler stays installed for the life of the process, so every
/// delivery arms the opposite transition.
pub fn install_signal_handlers() -> nix::Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let toggle = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches an atomic, which is async-signal-safe.
    unsafe {
        sigaction(INTERRUPT_SIGNAL, &ignore)?;
        sigaction(STOP_SIGNAL, &toggle)?;
    }
    debug!("shell signal dispositions installed");
    Ok(())
}

/// Child-side dispositions, applied between fork and exec.
///
/// Children never take part in mode toggling. Foreground children get the
/// default interrupt action back; background ones keep ignoring it.
pub(crate) fn reset_child_signals(foreground: bool) {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing SIG_IGN/SIG_DFL has no handler code to worry about.
    unsafe {
        let _ = sigaction(STOP_SIGNAL, &ignore);
        if foreground {
            let _ = sigaction(INTERRUPT_SIGNAL, &default);
        }
    }
}

/// Holds the stop signal blocked while a foreground child runs.
///
/// A toggle arriving during the wait stays pending and is delivered when the
/// guard drops, so the caller can [`ModeController::poll`] right after.
pub struct StopSignalDeferral {
    previous: SigSet,
}

impl StopSignalDeferral {
    pub fn engage() -> nix::Result<Self> {
        let mut blocked = SigSet::empty();
        blocked.add(STOP_SIGNAL);
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))?;
        Ok(StopSignalDeferral { previous })
    }

    /// Mask that was in effect before the guard was engaged.
    pub fn previous_mask(&self) -> &SigSet {
        &self.previous
    }
}

impl Drop for StopSignalDeferral {
    fn drop(&mut self) {
        if let Err(err) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!(%err, "failed to restore signal mask");
        }
    }
}
