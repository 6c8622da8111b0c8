//! The collaborator surface the supervision core consumes.
//!
//! The core never performs I/O itself. Timers, file-descriptor watches,
//! process launching, signal delivery and terminal control are all requested
//! through the [`Host`] trait, and their outcomes are fed back through the
//! entry points on [`ServiceSet`](crate::ServiceSet) (`exec_succeeded`,
//! `handle_exit_status`, `timer_expired`, and friends). This keeps the state
//! machine single threaded and deterministic: between two host callbacks the
//! queues always drain to a fixed point.

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::builder::ServiceBuilder;
use crate::error::LoadError;
use crate::supervisor::{ServiceEvent, ServiceId};

/// What to launch and how, handed to [`Host::launch`].
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    /// Program and arguments.
    pub argv: &'a [String],
    /// The service holds the console; the child should be given the
    /// controlling terminal's foreground.
    pub on_console: bool,
}

/// Event loop, process launcher and terminal control bundled into one
/// dependency, passed to [`ServiceSet::new`](crate::ServiceSet::new).
///
/// Launching is fork/exec shaped: `launch` returns the child's pid
/// synchronously, and the exec outcome is reported later by calling
/// `exec_succeeded` or `exec_failed` on the service set. Each service owns at
/// most one timer and one watched readiness descriptor at a time.
pub trait Host {
    /// Monotonic clock reading. Only differences are meaningful.
    fn now(&self) -> Duration;

    /// Arm (or re-arm) the single timer slot of `service`.
    fn arm_timer(&mut self, service: ServiceId, after: Duration);

    /// Disarm the timer slot of `service`. Disarming an idle slot is a no-op.
    fn clear_timer(&mut self, service: ServiceId);

    /// Watch `fd` for readability on behalf of `service`.
    fn watch_fd(&mut self, service: ServiceId, fd: RawFd);

    /// Stop watching `fd`.
    fn unwatch_fd(&mut self, service: ServiceId, fd: RawFd);

    /// Fork and begin exec of `spec.argv`. Returns the child pid; the exec
    /// outcome arrives later through `exec_succeeded` / `exec_failed`.
    fn launch(&mut self, service: ServiceId, spec: LaunchSpec<'_>) -> Result<Pid, Errno>;

    /// Deliver `signal` to the process group of `pid`.
    fn send_signal(&mut self, pid: Pid, signal: Signal);

    /// Return the controlling terminal's foreground to the supervisor's own
    /// process group (`tcsetpgrp(0, getpgrp())`).
    fn reclaim_terminal(&mut self) {}

    /// Fan a lifecycle event out to interested listeners. Best effort; the
    /// core never depends on delivery.
    fn service_event(&mut self, service: ServiceId, name: &str, event: ServiceEvent) {
        let _ = (service, name, event);
    }

    /// Produce the definition of a service that is not yet registered, for
    /// `start_on_completion` chain targets.
    fn load_service(&mut self, name: &str) -> Result<ServiceBuilder, LoadError> {
        let _ = name;
        Err(LoadError::NotFound)
    }

    /// The root filesystem has become writable (a service with the
    /// `rw_ready` flag reached the started state).
    fn rootfs_is_rw(&mut self) {}

    /// External logging can begin (a service with the `log_ready` flag
    /// reached the started state).
    fn setup_external_log(&mut self) {}
}
