//! Per-service data: lifecycle states, dependency links and the record type
//! the [`ServiceSet`](super::ServiceSet) arena stores.

use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// Stable handle to a service inside its [`ServiceSet`](super::ServiceSet).
///
/// Handles stay valid for the lifetime of the service; a removed service's
/// slot may be reused by a later registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub(crate) usize);

/// Handle to a dependency link in the central link table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkId(pub(crate) usize);

/// Lifecycle state of a service.
///
/// The cycle is `Stopped` → `Starting` → `Started` → `Stopping` → `Stopped`,
/// with interruptions allowed in either in-between state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Started => write!(f, "started"),
            ServiceState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Why a service most recently stopped (or is stopping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Stop was requested and completed in an orderly fashion.
    Normal,
    /// A hard dependency failed to start.
    DepFailed,
    /// The start or stop command exited with a non-zero status, or the
    /// process died before signalling readiness.
    Failed,
    /// The launcher could not exec the target binary.
    ExecFailed,
    /// The start or stop timer fired.
    TimedOut,
    /// The process exited unexpectedly while the service was started.
    Terminated,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Normal => write!(f, "normal"),
            StopReason::DepFailed => write!(f, "dependency failed"),
            StopReason::Failed => write!(f, "failed"),
            StopReason::ExecFailed => write!(f, "exec failed"),
            StopReason::TimedOut => write!(f, "timed out"),
            StopReason::Terminated => write!(f, "terminated"),
        }
    }
}

/// Lifecycle events fanned out to listeners via
/// [`Host::service_event`](crate::Host::service_event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceEvent {
    Started,
    Stopped,
    FailedStart,
    StartCancelled,
    StopCancelled,
}

/// The four dependency semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepType {
    /// Dependent cannot run unless the target is started; target failure
    /// cascades, and the dependent holds activation on the target.
    Regular,
    /// Like `Regular` during startup, but once the dependent has started the
    /// edge becomes inert and the target may stop independently.
    Milestone,
    /// Dependent waits for the target to start (or fail) before starting,
    /// but does not fail with it.
    WaitsFor,
    /// Dependent brings the target up but proceeds regardless of the
    /// outcome.
    Soft,
}

impl DepType {
    /// Only regular edges block the target's stop and cascade stops while
    /// held. Milestone edges cascade failure during startup but behave like
    /// soft edges once the dependent is up.
    pub fn is_hard(self) -> bool {
        matches!(self, DepType::Regular)
    }
}

/// Start-time behaviour flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags {
    /// Acquire the console before bringing the service up.
    pub starts_on_console: bool,
    /// Keep the console after reaching the started state.
    pub runs_on_console: bool,
    /// Invoke the host's `rootfs_is_rw` hook on start.
    pub rw_ready: bool,
    /// Invoke the host's `setup_external_log` hook on start.
    pub log_ready: bool,
    /// A start process terminated by SIGINT counts as a successful,
    /// skipped start.
    pub skippable: bool,
    /// A start in progress may be interrupted by a stop request.
    pub start_interruptible: bool,
}

/// A typed, directed dependency edge between two services.
///
/// Links live in the set's central table; both endpoints index into it, so
/// edge flags can be flipped while either endpoint's edge list is being
/// walked.
#[derive(Debug)]
pub(crate) struct DepLink {
    pub from: ServiceId,
    pub to: ServiceId,
    pub dep_type: DepType,
    /// This edge currently contributes to `to.required_by`.
    pub holding_acq: bool,
    /// `from` is starting and still waits for `to` to reach started.
    pub waiting_on: bool,
}

/// What the armed timer slot of a process service currently means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerPurpose {
    StartTimeout,
    StopTimeout,
    RestartDelay,
}

/// State carried by process-backed service kinds.
#[derive(Debug)]
pub(crate) struct ProcessState {
    pub argv: Vec<String>,
    /// Stop command for scripted services; empty means none.
    pub stop_argv: Vec<String>,
    pub pid: Option<nix::unistd::Pid>,
    pub stop_signal: Signal,
    /// Rate-limit window and the maximum launches allowed within it.
    /// A maximum of zero disables the limit.
    pub restart_interval: Duration,
    pub max_restart_count: usize,
    /// Minimum spacing between two consecutive launches.
    pub restart_delay: Duration,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    /// Re-exec on unexpected exit without leaving the started state.
    pub smooth_recovery: bool,
    /// Readiness pipe; when set, start completes only once the host reports
    /// a readiness notification on it.
    pub notification_fd: Option<RawFd>,
    pub waiting_for_execstat: bool,
    pub waiting_for_notify: bool,
    pub waiting_restart_timer: bool,
    pub timer: Option<TimerPurpose>,
    /// The stop signal has been delivered for the stop in progress.
    pub stop_signalled: bool,
    /// Host clock at the most recent launch.
    pub last_start_time: Duration,
    /// Start of the current rate-limit window and launches within it.
    pub interval_start: Duration,
    pub interval_count: usize,
}

impl ProcessState {
    pub fn new(argv: Vec<String>) -> Self {
        ProcessState {
            argv,
            stop_argv: Vec::new(),
            pid: None,
            stop_signal: Signal::SIGTERM,
            restart_interval: Duration::from_secs(10),
            max_restart_count: 3,
            restart_delay: Duration::from_millis(200),
            start_timeout: None,
            stop_timeout: None,
            smooth_recovery: false,
            notification_fd: None,
            waiting_for_execstat: false,
            waiting_for_notify: false,
            waiting_restart_timer: false,
            timer: None,
            stop_signalled: false,
            last_start_time: Duration::ZERO,
            interval_start: Duration::ZERO,
            interval_count: 0,
        }
    }
}

/// Kind-specific state and behaviour selector.
///
/// The core calls the bring-up, bring-down and interruption capabilities by
/// dispatching on this enum; each kind carries its own state.
#[derive(Debug)]
pub(crate) enum ServiceKind {
    /// No process: started as soon as dependencies are, stopped as soon as
    /// dependents are.
    Internal,
    /// Long-running child process; ready on exec success (or readiness
    /// notification), stopped by signal.
    Process(ProcessState),
    /// Start and stop commands that run to completion; ready when the start
    /// command exits successfully.
    Scripted(ProcessState),
}

/// Owned discriminant of [`ServiceKind`], for dispatching without holding
/// a borrow on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KindClass {
    Internal,
    Process,
    Scripted,
}

impl ServiceKind {
    pub fn class(&self) -> KindClass {
        match self {
            ServiceKind::Internal => KindClass::Internal,
            ServiceKind::Process(_) => KindClass::Process,
            ServiceKind::Scripted(_) => KindClass::Scripted,
        }
    }

    pub fn proc(&self) -> Option<&ProcessState> {
        match self {
            ServiceKind::Internal => None,
            ServiceKind::Process(ps) | ServiceKind::Scripted(ps) => Some(ps),
        }
    }

    pub fn proc_mut(&mut self) -> Option<&mut ProcessState> {
        match self {
            ServiceKind::Internal => None,
            ServiceKind::Process(ps) | ServiceKind::Scripted(ps) => Some(ps),
        }
    }

    pub fn is_scripted(&self) -> bool {
        matches!(self, ServiceKind::Scripted(_))
    }
}

/// One service's complete supervision state.
#[derive(Debug)]
pub(crate) struct ServiceRecord {
    pub name: String,
    pub state: ServiceState,
    /// Where the service should be heading: `Stopped` or `Started`.
    pub desired_state: ServiceState,
    pub stop_reason: StopReason,
    pub kind: ServiceKind,
    pub flags: ServiceFlags,
    /// Outbound edges (services this one depends on).
    pub depends_on: Vec<LinkId>,
    /// Inbound edges (services that depend on this one).
    pub dependents: Vec<LinkId>,
    /// Activation holders: one per holding dependency edge, plus one if
    /// `start_explicit`.
    pub required_by: usize,
    pub start_explicit: bool,
    pub auto_restart: bool,
    pub pinned_started: bool,
    pub pinned_stopped: bool,
    /// Stop is mandatory and propagates as forced to hard dependents.
    pub force_stop: bool,
    /// The next stop completion must re-enter the starting state.
    pub restarting: bool,
    pub start_failed: bool,
    pub start_skipped: bool,
    /// Blocked inside starting/stopping awaiting dependency quiescence.
    pub waiting_for_deps: bool,
    pub waiting_for_console: bool,
    pub have_console: bool,
    // Latched propagation requests, drained by the propagation queue.
    pub prop_require: bool,
    pub prop_release: bool,
    pub prop_start: bool,
    pub prop_stop: bool,
    pub prop_failure: bool,
    // Idempotent-enqueue guards.
    pub in_prop_queue: bool,
    pub in_transition_queue: bool,
    /// Service to load and start once this one has stopped.
    pub start_on_completion: Option<String>,
    /// Contributes to the set's active-service count.
    pub counted_active: bool,
}

impl ServiceRecord {
    pub fn new(name: String, kind: ServiceKind) -> Self {
        ServiceRecord {
            name,
            state: ServiceState::Stopped,
            desired_state: ServiceState::Stopped,
            stop_reason: StopReason::Normal,
            kind,
            flags: ServiceFlags::default(),
            depends_on: Vec::new(),
            dependents: Vec::new(),
            required_by: 0,
            start_explicit: false,
            auto_restart: false,
            pinned_started: false,
            pinned_stopped: false,
            force_stop: false,
            restarting: false,
            start_failed: false,
            start_skipped: false,
            waiting_for_deps: false,
            waiting_for_console: false,
            have_console: false,
            prop_require: false,
            prop_release: false,
            prop_start: false,
            prop_stop: false,
            prop_failure: false,
            in_prop_queue: false,
            in_transition_queue: false,
            start_on_completion: None,
            counted_active: false,
        }
    }

    pub fn any_prop_pending(&self) -> bool {
        self.prop_require
            || self.prop_release
            || self.prop_start
            || self.prop_stop
            || self.prop_failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_dep_types() {
        assert!(DepType::Regular.is_hard());
        assert!(!DepType::Milestone.is_hard());
        assert!(!DepType::WaitsFor.is_hard());
        assert!(!DepType::Soft.is_hard());
    }

    #[test]
    fn state_display() {
        assert_eq!(ServiceState::Starting.to_string(), "starting");
        assert_eq!(StopReason::DepFailed.to_string(), "dependency failed");
    }

    #[test]
    fn fresh_record_is_quiescent() {
        let rec = ServiceRecord::new("svc".to_string(), ServiceKind::Internal);
        assert_eq!(rec.state, ServiceState::Stopped);
        assert_eq!(rec.required_by, 0);
        assert!(!rec.any_prop_pending());
    }
}
