use crate::command::LastStatus;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobTableError {
    #[error("job table is full ({capacity} background jobs)")]
    Full { capacity: usize },
}

/// A background child that has not been reaped yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pid: Pid,
}

impl Job {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// A job removed by [`JobTable::reap_once`] and how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    pub status: LastStatus,
}

enum Poll {
    Running,
    Finished(LastStatus),
    Gone,
}

/// Bounded, ordered registry of live background processes.
///
/// Only the shell process touches it; children never see their parent's table.
#[derive(Debug)]
pub struct JobTable {
    jobs: Vec<Job>,
    capacity: usize,
}

impl JobTable {
    pub fn with_capacity(capacity: usize) -> Self {
        JobTable {
            jobs: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pids of live jobs, in registration order.
    pub fn pids(&self) -> Vec<Pid> {
        self.jobs.iter().map(Job::pid).collect()
    }

    pub fn register(&mut self, pid: Pid) -> Result<(), JobTableError> {
        if self.jobs.len() >= self.capacity {
            return Err(JobTableError::Full {
                capacity: self.capacity,
            });
        }
        self.jobs.push(Job { pid });
        debug!(%pid, live = self.jobs.len(), "background job registered");
        Ok(())
    }

    /// Poll every live job once without blocking.
    ///
    /// Finished jobs are reported to `out`, one line each, and removed. The
    /// remaining jobs keep their relative order.
    pub fn reap_once(&mut self, out: &mut dyn Write) -> io::Result<Vec<Reaped>> {
        let mut reaped = Vec::new();
        self.jobs.retain(|job| match poll(job.pid) {
            Poll::Running => true,
            Poll::Finished(status) => {
                reaped.push(Reaped {
                    pid: job.pid,
                    status,
                });
                false
            }
            Poll::Gone => false,
        });

        for job in &reaped {
            debug!(pid = %job.pid, status = %job.status, "background job reaped");
            writeln!(out, "background pid {} is done: {}", job.pid, job.status)?;
        }
        if !reaped.is_empty() {
            out.flush()?;
        }
        Ok(reaped)
    }

    /// Forcefully terminate every live job and collect them.
    pub fn kill_all(&mut self) {
        for job in self.jobs.drain(..) {
            match kill(job.pid, Signal::SIGKILL) {
                Ok(()) => {
                    if let Err(err) = waitpid(job.pid, None) {
                        warn!(pid = %job.pid, %err, "failed to collect killed job");
                    }
                }
                Err(err) => warn!(pid = %job.pid, %err, "failed to kill job"),
            }
            debug!(pid = %job.pid, "background job killed");
        }
    }
}

fn poll(pid: Pid) -> Poll {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => match LastStatus::from_wait_status(status) {
            Some(status) => Poll::Finished(status),
            None => Poll::Running,
        },
        Err(Errno::ECHILD) => {
            warn!(%pid, "background job vanished before it was reaped");
            Poll::Gone
        }
        Err(err) => {
            warn!(%pid, %err, "polling background job failed");
            Poll::Running
        }
    }
}
