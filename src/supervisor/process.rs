//! Process-backed service behaviour: launching, exec and exit handling,
//! readiness notification, start and stop timeouts, restart pacing and
//! smooth recovery.
//!
//! The host reports process events through the public entry points here
//! (`exec_succeeded`, `exec_failed`, `handle_exit_status`, `timer_expired`,
//! `ready_notified`, `ready_closed`). Every entry point is total: an event
//! that no longer matches the service's state is logged and ignored.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use super::record::{KindClass, ServiceEvent, ServiceId, ServiceState, StopReason, TimerPurpose};
use super::ServiceSet;
use crate::host::{Host, LaunchSpec};

/// Terminal outcome of a child process.
#[derive(Debug, Clone, Copy)]
enum ExitOutcome {
    Exited(i32),
    Signalled(Signal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchPhase {
    Start,
    Stop,
}

impl<H: Host> ServiceSet<H> {
    // ------------------------------------------------------------------
    // Capabilities consulted by the core state machine
    // ------------------------------------------------------------------

    /// Bring the service up. Internal services are started on the spot;
    /// process kinds launch their command, subject to restart pacing when
    /// this start is a restart. Returns false on immediate failure.
    pub(crate) fn bring_up(&mut self, id: ServiceId) -> bool {
        match self.rec(id).kind.class() {
            KindClass::Internal => {
                // No process to run; the service is up once its
                // dependencies are.
                self.started(id);
                true
            }
            KindClass::Process | KindClass::Scripted => {
                if let Some(ps) = self.rec(id).kind.proc() {
                    if ps.pid.is_some() || ps.waiting_for_execstat {
                        // A launch is already under way.
                        return true;
                    }
                }
                if self.rec(id).restarting {
                    self.restart_ps_process(id)
                } else {
                    let now = self.host().now();
                    if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                        ps.interval_start = now;
                        ps.interval_count = 0;
                        ps.stop_signalled = false;
                    }
                    if self.launch_process(id, LaunchPhase::Start) {
                        self.arm_start_timeout(id);
                        true
                    } else {
                        false
                    }
                }
            }
        }
    }

    /// Bring the service down once its dependents have quiesced. Process
    /// kinds signal the child and wait for its exit; scripted kinds run
    /// their stop command instead (unless the start was skipped).
    pub(crate) fn bring_down(&mut self, id: ServiceId) {
        self.rec_mut(id).waiting_for_deps = false;
        match self.rec(id).kind.class() {
            KindClass::Internal => {
                self.stopped(id);
            }
            KindClass::Process => {
                if self.process_pid(id).is_some() {
                    self.signal_stop(id);
                } else {
                    self.cancel_proc_timer(id);
                    self.stopped(id);
                }
            }
            KindClass::Scripted => {
                if self.rec(id).start_skipped {
                    // Nothing actually ran; skip the stop command as well.
                    self.cancel_proc_timer(id);
                    self.stopped(id);
                } else if self.process_pid(id).is_some() {
                    // An interrupted or timed-out start command is still
                    // running; terminate it rather than running the stop
                    // command.
                    self.signal_stop(id);
                } else {
                    let has_stop_cmd = self
                        .rec(id)
                        .kind
                        .proc()
                        .map(|ps| !ps.stop_argv.is_empty())
                        .unwrap_or(false);
                    if has_stop_cmd {
                        if self.launch_process(id, LaunchPhase::Stop) {
                            self.arm_stop_timeout(id);
                        } else {
                            if self.rec(id).stop_reason == StopReason::Normal {
                                self.rec_mut(id).stop_reason = StopReason::Failed;
                            }
                            self.stopped(id);
                        }
                    } else {
                        self.stopped(id);
                    }
                }
            }
        }
    }

    pub(crate) fn can_proceed_to_start(&self, id: ServiceId) -> bool {
        match self.rec(id).kind.proc() {
            Some(ps) => !ps.waiting_restart_timer,
            None => true,
        }
    }

    pub(crate) fn can_interrupt_start(&self, id: ServiceId) -> bool {
        match self.rec(id).kind.proc() {
            Some(ps) => ps.waiting_restart_timer || self.rec(id).flags.start_interruptible,
            None => true,
        }
    }

    /// Interrupt a start in progress. Returns true if the start is cancelled
    /// on the spot; false means the kind completes the cancellation
    /// asynchronously (the child has been signalled and must still exit).
    pub(crate) fn interrupt_start(&mut self, id: ServiceId) -> bool {
        let waiting_timer = self
            .rec(id)
            .kind
            .proc()
            .map(|ps| ps.waiting_restart_timer)
            .unwrap_or(false);
        if waiting_timer {
            if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                ps.waiting_restart_timer = false;
            }
            self.cancel_proc_timer(id);
            return true;
        }

        if let Some(pid) = self.process_pid(id) {
            tracing::info!(service = %self.rec(id).name, %pid, "interrupting start");
            self.host_mut().send_signal(pid, Signal::SIGINT);
            let stop_timeout = self.rec(id).kind.proc().and_then(|ps| ps.stop_timeout);
            match stop_timeout {
                Some(t) => self.arm_proc_timer(id, t, TimerPurpose::StopTimeout),
                None => self.cancel_proc_timer(id),
            }
            false
        } else {
            true
        }
    }

    /// Clean up per-start process state when the service settles inactive.
    pub(crate) fn becoming_inactive(&mut self, id: ServiceId) {
        self.stop_notify_watch(id);
        if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
            ps.waiting_restart_timer = false;
            ps.stop_signalled = false;
        }
        self.cancel_proc_timer(id);
    }

    // ------------------------------------------------------------------
    // Host event entry points
    // ------------------------------------------------------------------

    /// The launcher reports that the child's exec has succeeded.
    pub fn exec_succeeded(&mut self, id: ServiceId) {
        let waiting = self
            .rec(id)
            .kind
            .proc()
            .map(|ps| ps.waiting_for_execstat)
            .unwrap_or(false);
        if !waiting {
            return;
        }
        if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
            ps.waiting_for_execstat = false;
        }

        let scripted = self.rec(id).kind.is_scripted();
        let state = self.rec(id).state;
        match state {
            ServiceState::Starting => {
                if scripted {
                    // The start command runs to completion; readiness is
                    // signalled by its exit status.
                    return;
                }
                let notification_fd = self.rec(id).kind.proc().and_then(|ps| ps.notification_fd);
                if let Some(fd) = notification_fd {
                    if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                        ps.waiting_for_notify = true;
                    }
                    self.host_mut().watch_fd(id, fd);
                } else {
                    self.cancel_proc_timer(id);
                    self.started(id);
                }
            }
            ServiceState::Started => {
                if !scripted {
                    // Smooth recovery: the replacement process is up.
                    tracing::info!(service = %self.rec(id).name, "process restarted");
                    self.rec_mut(id).restarting = false;
                }
            }
            _ => {}
        }
    }

    /// The launcher reports that the child could not exec its command.
    pub fn exec_failed(&mut self, id: ServiceId, err: Errno) {
        let waiting = self
            .rec(id)
            .kind
            .proc()
            .map(|ps| ps.waiting_for_execstat)
            .unwrap_or(false);
        if !waiting {
            return;
        }
        if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
            ps.waiting_for_execstat = false;
            ps.pid = None;
        }
        tracing::error!(service = %self.rec(id).name, error = %err, "could not execute command");

        let state = self.rec(id).state;
        match state {
            ServiceState::Starting => {
                self.cancel_proc_timer(id);
                self.rec_mut(id).stop_reason = StopReason::ExecFailed;
                self.failed_to_start(id, false, true);
            }
            ServiceState::Started => {
                // Smooth recovery relaunch failed; give up and stop.
                self.rec_mut(id).restarting = false;
                self.rec_mut(id).stop_reason = StopReason::ExecFailed;
                self.emergency_stop(id);
            }
            ServiceState::Stopping => {
                // The stop command could not run; the stop completes anyway.
                if self.rec(id).stop_reason == StopReason::Normal {
                    self.rec_mut(id).stop_reason = StopReason::Failed;
                }
                self.stopped(id);
            }
            ServiceState::Stopped => {}
        }
    }

    /// The host reaped the service's child process.
    pub fn handle_exit_status(&mut self, id: ServiceId, status: WaitStatus) {
        if self.process_pid(id).is_none() {
            return;
        }
        let outcome = match status {
            WaitStatus::Exited(_, code) => ExitOutcome::Exited(code),
            WaitStatus::Signaled(_, sig, _) => ExitOutcome::Signalled(sig),
            // Stops and ptrace events are not terminations.
            _ => return,
        };
        if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
            ps.pid = None;
            ps.waiting_for_execstat = false;
        }

        if let ExitOutcome::Exited(code) = outcome {
            if code != 0 && self.rec(id).state != ServiceState::Stopping {
                tracing::warn!(service = %self.rec(id).name, code,
                    "process exited with non-zero status");
            }
        }

        if self.rec(id).kind.is_scripted() {
            self.scripted_exit(id, outcome);
        } else {
            self.process_exit(id, outcome);
        }
    }

    fn process_exit(&mut self, id: ServiceId, outcome: ExitOutcome) {
        let state = self.rec(id).state;
        match state {
            ServiceState::Starting => {
                // Died before signalling readiness.
                self.cancel_proc_timer(id);
                self.stop_notify_watch(id);
                if self.start_was_skipped(id, outcome) {
                    self.rec_mut(id).start_skipped = true;
                    self.started(id);
                } else {
                    self.rec_mut(id).stop_reason = StopReason::Failed;
                    self.failed_to_start(id, false, true);
                }
            }
            ServiceState::Stopping => {
                self.cancel_proc_timer(id);
                self.stopped(id);
            }
            ServiceState::Started => {
                let rec = self.rec(id);
                let smooth = rec
                    .kind
                    .proc()
                    .map(|ps| ps.smooth_recovery)
                    .unwrap_or(false);
                if smooth && rec.desired_state == ServiceState::Started && !rec.force_stop {
                    tracing::warn!(service = %rec.name,
                        "process terminated unexpectedly; performing smooth recovery");
                    self.do_smooth_recovery(id);
                } else {
                    tracing::warn!(service = %rec.name, "process terminated unexpectedly");
                    self.rec_mut(id).stop_reason = StopReason::Terminated;
                    self.emergency_stop(id);
                }
            }
            ServiceState::Stopped => {}
        }
    }

    fn scripted_exit(&mut self, id: ServiceId, outcome: ExitOutcome) {
        let state = self.rec(id).state;
        match state {
            ServiceState::Starting => {
                self.cancel_proc_timer(id);
                if matches!(outcome, ExitOutcome::Exited(0)) {
                    self.started(id);
                } else if self.start_was_skipped(id, outcome) {
                    self.rec_mut(id).start_skipped = true;
                    self.started(id);
                } else {
                    self.rec_mut(id).stop_reason = StopReason::Failed;
                    self.failed_to_start(id, false, true);
                }
            }
            ServiceState::Stopping => {
                // Either the stop command or an interrupted start command
                // has finished; the stop is complete either way.
                self.cancel_proc_timer(id);
                if !matches!(outcome, ExitOutcome::Exited(0)) {
                    tracing::warn!(service = %self.rec(id).name, "stop command failed");
                    if self.rec(id).stop_reason == StopReason::Normal {
                        self.rec_mut(id).stop_reason = StopReason::Failed;
                    }
                }
                self.stopped(id);
            }
            _ => {}
        }
    }

    /// A start process terminated by SIGINT counts as a successful, skipped
    /// start when the service carries the skippable flag.
    fn start_was_skipped(&self, id: ServiceId, outcome: ExitOutcome) -> bool {
        self.rec(id).flags.skippable
            && matches!(outcome, ExitOutcome::Signalled(Signal::SIGINT))
    }

    /// The service's timer slot fired.
    pub fn timer_expired(&mut self, id: ServiceId) {
        let purpose = match self.rec_mut(id).kind.proc_mut() {
            Some(ps) => ps.timer.take(),
            None => None,
        };
        let Some(purpose) = purpose else { return };

        match purpose {
            TimerPurpose::StopTimeout => {
                // Stale expiries (the state moved on) are no-ops.
                if self.rec(id).state == ServiceState::Stopping {
                    if let Some(pid) = self.process_pid(id) {
                        tracing::warn!(service = %self.rec(id).name, %pid,
                            "stop timed out; sending SIGKILL");
                        self.rec_mut(id).stop_reason = StopReason::TimedOut;
                        self.host_mut().send_signal(pid, Signal::SIGKILL);
                    }
                }
            }
            TimerPurpose::StartTimeout => {
                if self.rec(id).state == ServiceState::Starting {
                    tracing::warn!(service = %self.rec(id).name, "start timed out");
                    self.rec_mut(id).stop_reason = StopReason::TimedOut;
                    self.cancel_start_in_progress(id);
                }
            }
            TimerPurpose::RestartDelay => {
                if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                    ps.waiting_restart_timer = false;
                }
                let state = self.rec(id).state;
                match state {
                    ServiceState::Starting => {
                        if self.rec(id).waiting_for_deps {
                            // Dependencies regressed while the delay ran;
                            // re-evaluate through the transition queue.
                            self.add_transition_queue(id);
                        } else if !self.do_restart_launch(id) {
                            self.failed_to_start(id, false, true);
                        }
                    }
                    ServiceState::Started => {
                        // Smooth recovery delay has elapsed.
                        if self.rec(id).waiting_for_deps {
                            self.add_transition_queue(id);
                        } else if !self.do_restart_launch(id) {
                            self.rec_mut(id).restarting = false;
                            self.emergency_stop(id);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// The host read a readiness notification from the service's pipe.
    pub fn ready_notified(&mut self, id: ServiceId) {
        if !self.awaiting_readiness(id) {
            return;
        }
        self.stop_notify_watch(id);
        self.cancel_proc_timer(id);
        self.started(id);
    }

    /// The readiness pipe reached end of file before any notification,
    /// which counts as a start failure.
    pub fn ready_closed(&mut self, id: ServiceId) {
        if !self.awaiting_readiness(id) {
            return;
        }
        self.stop_notify_watch(id);
        self.cancel_proc_timer(id);
        tracing::error!(service = %self.rec(id).name,
            "readiness pipe closed before the service became ready");
        self.rec_mut(id).stop_reason = StopReason::Failed;
        self.cancel_start_in_progress(id);
    }

    fn awaiting_readiness(&self, id: ServiceId) -> bool {
        self.rec(id).state == ServiceState::Starting
            && self
                .rec(id)
                .kind
                .proc()
                .map(|ps| ps.waiting_for_notify)
                .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn launch_process(&mut self, id: ServiceId, phase: LaunchPhase) -> bool {
        let (argv, on_console) = {
            let rec = self.rec(id);
            let Some(ps) = rec.kind.proc() else {
                return false;
            };
            let argv = match phase {
                LaunchPhase::Start => ps.argv.clone(),
                LaunchPhase::Stop => ps.stop_argv.clone(),
            };
            (argv, rec.have_console)
        };

        if phase == LaunchPhase::Start {
            let now = self.host().now();
            if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                ps.last_start_time = now;
            }
        }

        match self.host_mut().launch(id, LaunchSpec { argv: &argv, on_console }) {
            Ok(pid) => {
                if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                    ps.pid = Some(pid);
                    ps.waiting_for_execstat = true;
                }
                true
            }
            Err(errno) => {
                tracing::error!(service = %self.rec(id).name, error = %errno,
                    "failed to launch process");
                if phase == LaunchPhase::Start {
                    self.rec_mut(id).stop_reason = StopReason::ExecFailed;
                }
                false
            }
        }
    }

    /// Restart pacing: enforce the rate-limit window, then either launch
    /// immediately or arm the delay timer and report success with the
    /// launch still pending.
    fn restart_ps_process(&mut self, id: ServiceId) -> bool {
        let now = self.host().now();
        let Some(ps) = self.rec(id).kind.proc() else {
            return false;
        };
        let (interval, max_count, delay, last_start) = (
            ps.restart_interval,
            ps.max_restart_count,
            ps.restart_delay,
            ps.last_start_time,
        );

        if max_count != 0 {
            let in_window = now.saturating_sub(ps.interval_start) < interval;
            if in_window {
                if ps.interval_count >= max_count {
                    tracing::warn!(service = %self.rec(id).name,
                        "restarting too quickly; giving up");
                    return false;
                }
            } else if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                ps.interval_start = now;
                ps.interval_count = 0;
            }
        }

        let elapsed = now.saturating_sub(last_start);
        if elapsed >= delay {
            self.do_restart_launch(id)
        } else {
            self.arm_proc_timer(id, delay - elapsed, TimerPurpose::RestartDelay);
            if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                ps.waiting_restart_timer = true;
            }
            true
        }
    }

    fn do_restart_launch(&mut self, id: ServiceId) -> bool {
        if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
            ps.interval_count += 1;
            ps.stop_signalled = false;
        }
        if self.launch_process(id, LaunchPhase::Start) {
            self.arm_start_timeout(id);
            true
        } else {
            false
        }
    }

    fn do_smooth_recovery(&mut self, id: ServiceId) {
        self.rec_mut(id).restarting = true;
        if !self.restart_ps_process(id) {
            self.rec_mut(id).restarting = false;
            self.rec_mut(id).stop_reason = StopReason::Terminated;
            self.emergency_stop(id);
        }
    }

    /// Unexpected termination (or a failed recovery): drop our own
    /// activation unless a restart will follow, then force a stop through
    /// the ordinary path, so the record waits in stopping until its hard
    /// dependents have gone down before it reports stopped.
    fn emergency_stop(&mut self, id: ServiceId) {
        if !self.rec(id).auto_restart && self.rec(id).start_explicit {
            self.rec_mut(id).start_explicit = false;
            self.release(id, false);
        }
        self.rec_mut(id).force_stop = true;
        self.do_stop(id);
    }

    /// A start that cannot continue (timeout or readiness failure): signal
    /// the child, cascade the stop and move to stopping. The stop reason is
    /// set by the caller.
    fn cancel_start_in_progress(&mut self, id: ServiceId) {
        let all_deps_stopped = self.stop_dependents(id);
        self.stop_notify_watch(id);

        if let Some(pid) = self.process_pid(id) {
            let (sig, stop_timeout) = {
                let ps = self.rec(id).kind.proc();
                (
                    ps.map(|p| p.stop_signal).unwrap_or(Signal::SIGTERM),
                    ps.and_then(|p| p.stop_timeout),
                )
            };
            self.host_mut().send_signal(pid, sig);
            if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                ps.stop_signalled = true;
            }
            if let Some(t) = stop_timeout {
                self.arm_proc_timer(id, t, TimerPurpose::StopTimeout);
            }
        }

        self.notify_event(id, ServiceEvent::StartCancelled);
        self.clear_waiting_on_edges(id);

        if self.rec(id).pinned_started {
            return;
        }
        if self.rec(id).required_by == 0 {
            self.rec_mut(id).prop_release = true;
            self.add_prop_queue(id);
        }
        self.rec_mut(id).state = ServiceState::Stopping;
        self.rec_mut(id).waiting_for_deps = true;
        if all_deps_stopped {
            self.add_transition_queue(id);
        }
    }

    fn signal_stop(&mut self, id: ServiceId) {
        let Some(pid) = self.process_pid(id) else {
            return;
        };
        let already = self
            .rec(id)
            .kind
            .proc()
            .map(|ps| ps.stop_signalled)
            .unwrap_or(false);
        if already {
            return;
        }
        let sig = self
            .rec(id)
            .kind
            .proc()
            .map(|ps| ps.stop_signal)
            .unwrap_or(Signal::SIGTERM);
        self.host_mut().send_signal(pid, sig);
        if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
            ps.stop_signalled = true;
        }
        self.arm_stop_timeout(id);
    }

    fn arm_start_timeout(&mut self, id: ServiceId) {
        if self.rec(id).state != ServiceState::Starting {
            return;
        }
        if let Some(t) = self.rec(id).kind.proc().and_then(|ps| ps.start_timeout) {
            self.arm_proc_timer(id, t, TimerPurpose::StartTimeout);
        }
    }

    fn arm_stop_timeout(&mut self, id: ServiceId) {
        if let Some(t) = self.rec(id).kind.proc().and_then(|ps| ps.stop_timeout) {
            self.arm_proc_timer(id, t, TimerPurpose::StopTimeout);
        }
    }

    fn arm_proc_timer(&mut self, id: ServiceId, after: std::time::Duration, purpose: TimerPurpose) {
        if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
            ps.timer = Some(purpose);
        }
        self.host_mut().arm_timer(id, after);
    }

    fn cancel_proc_timer(&mut self, id: ServiceId) {
        let had = match self.rec_mut(id).kind.proc_mut() {
            Some(ps) => ps.timer.take().is_some(),
            None => false,
        };
        if had {
            self.host_mut().clear_timer(id);
        }
    }

    fn stop_notify_watch(&mut self, id: ServiceId) {
        let fd = match self.rec(id).kind.proc() {
            Some(ps) if ps.waiting_for_notify => ps.notification_fd,
            _ => None,
        };
        if let Some(fd) = fd {
            if let Some(ps) = self.rec_mut(id).kind.proc_mut() {
                ps.waiting_for_notify = false;
            }
            self.host_mut().unwatch_fd(id, fd);
        }
    }
}
