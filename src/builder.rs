//! Fluent construction of service records.
//!
//! A [`ServiceBuilder`] captures everything a service definition provides
//! (kind, commands, dependencies, timing parameters, flags) and is handed
//! to [`ServiceSet::add_service`](crate::ServiceSet::add_service) for
//! registration. Hosts also return builders from
//! [`Host::load_service`](crate::Host::load_service) for chain targets.

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::{Error, Result};
use crate::supervisor::{DepType, ServiceFlags, ServiceId};
use crate::supervisor::{ProcessState, ServiceKind, ServiceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindSelector {
    Internal,
    Process,
    Scripted,
}

/// Builder for one service definition.
#[derive(Debug)]
pub struct ServiceBuilder {
    name: String,
    kind: KindSelector,
    argv: Vec<String>,
    stop_argv: Vec<String>,
    dependencies: Vec<(ServiceId, DepType)>,
    flags: ServiceFlags,
    auto_restart: bool,
    smooth_recovery: bool,
    restart_delay: Option<Duration>,
    restart_interval: Option<(Duration, usize)>,
    start_timeout: Option<Duration>,
    stop_timeout: Option<Duration>,
    stop_signal: Option<Signal>,
    notification_fd: Option<RawFd>,
    start_on_completion: Option<String>,
}

impl ServiceBuilder {
    fn new(name: impl Into<String>, kind: KindSelector) -> Self {
        ServiceBuilder {
            name: name.into(),
            kind,
            argv: Vec::new(),
            stop_argv: Vec::new(),
            dependencies: Vec::new(),
            flags: ServiceFlags::default(),
            auto_restart: false,
            smooth_recovery: false,
            restart_delay: None,
            restart_interval: None,
            start_timeout: None,
            stop_timeout: None,
            stop_signal: None,
            notification_fd: None,
            start_on_completion: None,
        }
    }

    /// A service with no process of its own: it is started once its
    /// dependencies are, and stopped once its dependents are.
    pub fn internal(name: impl Into<String>) -> Self {
        Self::new(name, KindSelector::Internal)
    }

    /// A long-running process service. Ready on exec success, or on the
    /// readiness notification if [`notification_fd`](Self::notification_fd)
    /// is set.
    pub fn process(name: impl Into<String>, argv: Vec<String>) -> Self {
        let mut b = Self::new(name, KindSelector::Process);
        b.argv = argv;
        b
    }

    /// A scripted service: the start command runs to completion and its
    /// exit status decides readiness.
    pub fn scripted(name: impl Into<String>, argv: Vec<String>) -> Self {
        let mut b = Self::new(name, KindSelector::Scripted);
        b.argv = argv;
        b
    }

    /// Stop command for scripted services.
    pub fn stop_command(mut self, argv: Vec<String>) -> Self {
        self.stop_argv = argv;
        self
    }

    /// Add a dependency on an already-registered service.
    pub fn depends_on(mut self, target: ServiceId, dep_type: DepType) -> Self {
        self.dependencies.push((target, dep_type));
        self
    }

    pub fn flags(mut self, flags: ServiceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Restart automatically after an unexpected exit while still required.
    pub fn auto_restart(mut self, on: bool) -> Self {
        self.auto_restart = on;
        self
    }

    /// Re-exec the process on unexpected exit without leaving the started
    /// state.
    pub fn smooth_recovery(mut self, on: bool) -> Self {
        self.smooth_recovery = on;
        self
    }

    /// Minimum spacing between two consecutive launches.
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = Some(delay);
        self
    }

    /// Rate-limit window: at most `max_count` restarts within `interval`.
    /// A `max_count` of zero disables the limit.
    pub fn restart_interval(mut self, interval: Duration, max_count: usize) -> Self {
        self.restart_interval = Some((interval, max_count));
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Signal used to terminate the process (SIGTERM by default).
    pub fn stop_signal(mut self, signal: Signal) -> Self {
        self.stop_signal = Some(signal);
        self
    }

    /// File descriptor of the readiness pipe. When set, start completes only
    /// once the host reports a readiness notification on it.
    pub fn notification_fd(mut self, fd: RawFd) -> Self {
        self.notification_fd = Some(fd);
        self
    }

    /// Load and start the named service once this one has stopped.
    pub fn start_on_completion(mut self, target: impl Into<String>) -> Self {
        self.start_on_completion = Some(target.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dependencies(&self) -> &[(ServiceId, DepType)] {
        &self.dependencies
    }

    pub(crate) fn into_record(self) -> Result<(ServiceRecord, Vec<(ServiceId, DepType)>)> {
        let kind = match self.kind {
            KindSelector::Internal => ServiceKind::Internal,
            KindSelector::Process | KindSelector::Scripted => {
                if self.argv.is_empty() {
                    return Err(Error::EmptyCommand(self.name));
                }
                let mut ps = ProcessState::new(self.argv);
                ps.stop_argv = self.stop_argv;
                ps.smooth_recovery = self.smooth_recovery;
                if let Some(delay) = self.restart_delay {
                    ps.restart_delay = delay;
                }
                if let Some((interval, max_count)) = self.restart_interval {
                    ps.restart_interval = interval;
                    ps.max_restart_count = max_count;
                }
                ps.start_timeout = self.start_timeout;
                ps.stop_timeout = self.stop_timeout;
                if let Some(sig) = self.stop_signal {
                    ps.stop_signal = sig;
                }
                ps.notification_fd = self.notification_fd;
                if self.kind == KindSelector::Process {
                    ServiceKind::Process(ps)
                } else {
                    ServiceKind::Scripted(ps)
                }
            }
        };

        let mut record = ServiceRecord::new(self.name, kind);
        record.flags = self.flags;
        record.auto_restart = self.auto_restart;
        record.start_on_completion = self.start_on_completion;
        Ok((record, self.dependencies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_requires_command() {
        let builder = ServiceBuilder::process("empty", Vec::new());
        assert!(matches!(
            builder.into_record(),
            Err(Error::EmptyCommand(name)) if name == "empty"
        ));
    }

    #[test]
    fn internal_needs_no_command() {
        let builder = ServiceBuilder::internal("plain");
        let (record, deps) = builder.into_record().expect("internal builds");
        assert_eq!(record.name, "plain");
        assert!(deps.is_empty());
    }

    #[test]
    fn timing_parameters_are_applied() {
        let builder = ServiceBuilder::process("timed", vec!["cmd".to_string()])
            .restart_delay(Duration::from_millis(50))
            .restart_interval(Duration::from_secs(5), 2)
            .start_timeout(Duration::from_secs(1))
            .stop_timeout(Duration::from_secs(2));
        let (record, _) = builder.into_record().expect("builds");
        let ps = record.kind.proc().expect("process state");
        assert_eq!(ps.restart_delay, Duration::from_millis(50));
        assert_eq!(ps.restart_interval, Duration::from_secs(5));
        assert_eq!(ps.max_restart_count, 2);
        assert_eq!(ps.start_timeout, Some(Duration::from_secs(1)));
        assert_eq!(ps.stop_timeout, Some(Duration::from_secs(2)));
    }
}
