//! Shared test host: a deterministic, inspectable implementation of the
//! `Host` collaborator with a manually advanced clock.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use overseer::{
    Host, LaunchSpec, LoadError, ServiceBuilder, ServiceEvent, ServiceId, ServiceSet,
};

/// Records every request the core makes so tests can assert on side
/// effects, and lets tests advance time to fire timers.
pub struct TestHost {
    pub now: Duration,
    pub timers: BTreeMap<ServiceId, Duration>,
    pub watched_fds: HashSet<(ServiceId, RawFd)>,
    pub launches: Vec<(ServiceId, Vec<String>, bool)>,
    pub next_pid: i32,
    pub last_forked_pid: i32,
    pub signals: Vec<(Pid, Signal)>,
    pub events: Vec<(String, ServiceEvent)>,
    pub terminal_reclaims: usize,
    pub rootfs_rw_calls: usize,
    pub external_log_calls: usize,
    pub loadable: HashMap<String, ServiceBuilder>,
    /// When set, `launch` fails with this errno instead of forking.
    pub fail_launch: Option<Errno>,
}

impl TestHost {
    pub fn new() -> Self {
        // Route core tracing output through the test harness so it shows up
        // with failing tests. Only the first call installs the subscriber.
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        TestHost {
            now: Duration::ZERO,
            timers: BTreeMap::new(),
            watched_fds: HashSet::new(),
            launches: Vec::new(),
            next_pid: 100,
            last_forked_pid: 0,
            signals: Vec::new(),
            events: Vec::new(),
            terminal_reclaims: 0,
            rootfs_rw_calls: 0,
            external_log_calls: 0,
            loadable: HashMap::new(),
            fail_launch: None,
        }
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn last_signal(&self) -> Option<Signal> {
        self.signals.last().map(|(_, sig)| *sig)
    }

    pub fn events_for(&self, name: &str) -> Vec<ServiceEvent> {
        self.events
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, e)| *e)
            .collect()
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for TestHost {
    fn now(&self) -> Duration {
        self.now
    }

    fn arm_timer(&mut self, service: ServiceId, after: Duration) {
        self.timers.insert(service, self.now + after);
    }

    fn clear_timer(&mut self, service: ServiceId) {
        self.timers.remove(&service);
    }

    fn watch_fd(&mut self, service: ServiceId, fd: RawFd) {
        self.watched_fds.insert((service, fd));
    }

    fn unwatch_fd(&mut self, service: ServiceId, fd: RawFd) {
        self.watched_fds.remove(&(service, fd));
    }

    fn launch(&mut self, service: ServiceId, spec: LaunchSpec<'_>) -> Result<Pid, Errno> {
        if let Some(errno) = self.fail_launch {
            return Err(errno);
        }
        self.launches
            .push((service, spec.argv.to_vec(), spec.on_console));
        let pid = self.next_pid;
        self.next_pid += 1;
        self.last_forked_pid = pid;
        Ok(Pid::from_raw(pid))
    }

    fn send_signal(&mut self, pid: Pid, signal: Signal) {
        self.signals.push((pid, signal));
    }

    fn reclaim_terminal(&mut self) {
        self.terminal_reclaims += 1;
    }

    fn service_event(&mut self, _service: ServiceId, name: &str, event: ServiceEvent) {
        self.events.push((name.to_string(), event));
    }

    fn load_service(&mut self, name: &str) -> Result<ServiceBuilder, LoadError> {
        self.loadable.remove(name).ok_or(LoadError::NotFound)
    }

    fn rootfs_is_rw(&mut self) {
        self.rootfs_rw_calls += 1;
    }

    fn setup_external_log(&mut self) {
        self.external_log_calls += 1;
    }
}

/// Advance the host clock, firing due timers in service order, and drain
/// the queues after each expiry.
pub fn advance(services: &mut ServiceSet<TestHost>, by: Duration) {
    let deadline = services.host().now + by;
    services.host_mut().now = deadline;
    loop {
        let due: Vec<ServiceId> = services
            .host()
            .timers
            .iter()
            .filter(|(_, at)| **at <= deadline)
            .map(|(id, _)| *id)
            .collect();
        if due.is_empty() {
            break;
        }
        for id in due {
            services.host_mut().timers.remove(&id);
            services.timer_expired(id);
            services.process_queues();
        }
    }
    services.process_queues();
}

/// Report the service's child exiting with `code`.
pub fn exit_with_code(services: &mut ServiceSet<TestHost>, id: ServiceId, code: i32) {
    let pid = services.process_pid(id).expect("service has a process");
    services.handle_exit_status(id, nix::sys::wait::WaitStatus::Exited(pid, code));
    services.process_queues();
}

/// Report the service's child being terminated by `signal`.
pub fn exit_with_signal(services: &mut ServiceSet<TestHost>, id: ServiceId, signal: Signal) {
    let pid = services.process_pid(id).expect("service has a process");
    services.handle_exit_status(id, nix::sys::wait::WaitStatus::Signaled(pid, signal, false));
    services.process_queues();
}
