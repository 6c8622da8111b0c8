//! The per-service state machine and graph-wide propagation.
//!
//! Two properties make re-entrant mutation safe here and must be preserved
//! by any change: an edge flag is always cleared before the call it guards,
//! and re-entry always goes through a queue enqueue rather than direct
//! recursion into the same edge walk.

use super::record::{DepType, ServiceEvent, ServiceId, ServiceState, StopReason};
use super::ServiceSet;
use crate::host::Host;

impl<H: Host> ServiceSet<H> {
    // ------------------------------------------------------------------
    // Activation counting
    // ------------------------------------------------------------------

    /// Add an activation holder. The zero-to-one transition latches a
    /// require propagation (cancelling a pending release) and, if the
    /// service is not already coming up, a start request.
    pub(crate) fn require(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        rec.required_by += 1;
        if rec.required_by == 1 {
            rec.prop_require = !rec.prop_release;
            rec.prop_release = false;
            if rec.state != ServiceState::Starting && rec.state != ServiceState::Started {
                rec.prop_start = true;
            }
            self.add_prop_queue(id);
        }
    }

    /// Drop an activation holder. Reaching zero makes the desired state
    /// stopped, latches a release propagation and, depending on the current
    /// state, marks the record inactive or issues a stop.
    pub(crate) fn release(&mut self, id: ServiceId, issue_stop: bool) {
        let rec = self.rec_mut(id);
        rec.required_by -= 1;
        if rec.required_by == 0 {
            rec.desired_state = ServiceState::Stopped;

            // No release needs to propagate if the require is still pending.
            if rec.state != ServiceState::Stopped && rec.state != ServiceState::Stopping {
                rec.prop_release = !rec.prop_require;
                rec.prop_require = false;
                self.add_prop_queue(id);
            }

            if self.rec(id).state == ServiceState::Stopped {
                self.service_inactive(id);
            } else if issue_stop {
                // A stop already in progress keeps its reason.
                if self.rec(id).state != ServiceState::Stopping {
                    self.rec_mut(id).stop_reason = StopReason::Normal;
                }
                self.do_stop(id);
            }
        }
    }

    fn release_dependencies(&mut self, id: ServiceId) {
        let outbound = self.rec(id).depends_on.clone();
        for l in outbound {
            if self.link(l).holding_acq {
                // Clear the hold before releasing: the target may stop and
                // re-examine this link from the other side.
                self.link_mut(l).holding_acq = false;
                let to = self.link(l).to;
                self.release(to, true);
            }
        }
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Request that the service start. With `explicit` the user asked for
    /// this service directly and it holds its own activation until stopped.
    pub fn start(&mut self, id: ServiceId, explicit: bool) {
        if explicit && !self.rec(id).start_explicit {
            self.require(id);
            self.rec_mut(id).start_explicit = true;
        }

        self.rec_mut(id).desired_state = ServiceState::Started;

        let state = self.rec(id).state;
        match state {
            ServiceState::Starting | ServiceState::Started => return,
            ServiceState::Stopping => {
                if !self.can_interrupt_stop(id) {
                    // The stop must run to completion first; re-enter
                    // starting from stopped().
                    self.rec_mut(id).restarting = true;
                    return;
                }
                // Dependencies that are stopping are waiting for us, so they
                // can return to starting instantly as well.
                self.notify_event(id, ServiceEvent::StopCancelled);
            }
            ServiceState::Stopped => {
                if self.rec(id).pinned_stopped {
                    // Desired state is recorded; unpin performs the start.
                    return;
                }
                self.service_active(id);
            }
        }

        self.initiate_start(id);
    }

    /// Deferred start performed by `unpin` once a stopped pin is cleared.
    pub(crate) fn do_start(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        if rec.pinned_stopped || rec.state != ServiceState::Stopped {
            return;
        }
        self.service_active(id);
        self.initiate_start(id);
    }

    fn initiate_start(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        rec.start_failed = false;
        rec.start_skipped = false;
        rec.state = ServiceState::Starting;
        rec.waiting_for_deps = true;

        if self.start_check_dependencies(id) {
            self.add_transition_queue(id);
        }
    }

    /// Ask every dependency to start and mark the edges being waited on.
    /// Returns true when all dependencies are already started.
    fn start_check_dependencies(&mut self, id: ServiceId) -> bool {
        let mut all_started = true;
        let outbound = self.rec(id).depends_on.clone();
        for l in outbound {
            let to = self.link(l).to;
            let to_state = self.rec(to).state;
            if to_state != ServiceState::Started {
                if to_state != ServiceState::Starting {
                    self.rec_mut(to).prop_start = true;
                    self.add_prop_queue(to);
                }
                self.link_mut(l).waiting_on = true;
                all_started = false;
            }
        }
        all_started
    }

    pub(crate) fn check_deps_started(&self, id: ServiceId) -> bool {
        self.rec(id)
            .depends_on
            .iter()
            .all(|l| !self.link(*l).waiting_on)
    }

    /// All dependencies are started: acquire the console if needed, then
    /// bring the service up unless the kind is not yet ready to proceed.
    pub(crate) fn all_deps_started(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        if rec.flags.starts_on_console && !rec.have_console {
            self.queue_for_console(id);
            return;
        }

        self.rec_mut(id).waiting_for_deps = false;

        if !self.can_proceed_to_start(id) {
            // Kind-specific hold, e.g. a restart delay still running. The
            // kind re-queues the transition when it clears.
            self.rec_mut(id).waiting_for_deps = true;
            return;
        }

        let start_success = self.bring_up(id);
        self.rec_mut(id).restarting = false;
        if !start_success {
            self.failed_to_start(id, false, true);
        }
    }

    /// A dependency of this record reached started (or resolved otherwise).
    pub(crate) fn dependency_started(&mut self, id: ServiceId) {
        // Also check for the started state: a service in smooth recovery
        // waits for its dependencies before relaunching the process.
        let rec = self.rec(id);
        if (rec.state == ServiceState::Starting || rec.state == ServiceState::Started)
            && rec.waiting_for_deps
        {
            self.add_transition_queue(id);
        }
    }

    /// The kind signals that the service is up.
    pub(crate) fn started(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        if rec.have_console && !rec.flags.runs_on_console {
            self.host_mut().reclaim_terminal();
            self.release_console(id);
        }

        tracing::info!(service = %self.rec(id).name, "service started");
        self.rec_mut(id).state = ServiceState::Started;
        self.notify_event(id, ServiceEvent::Started);

        if self.rec(id).flags.rw_ready {
            self.host_mut().rootfs_is_rw();
        }
        if self.rec(id).flags.log_ready {
            self.host_mut().setup_external_log();
        }

        let rec = self.rec(id);
        if rec.force_stop || rec.desired_state == ServiceState::Stopped {
            self.do_stop(id);
            return;
        }

        let inbound = self.rec(id).dependents.clone();
        for l in inbound {
            self.link_mut(l).waiting_on = false;
            let from = self.link(l).from;
            self.dependency_started(from);
        }
    }

    /// The start attempt failed. Cascades failure to hard dependents in
    /// their starting state, unblocks soft ones, and drops every hold on
    /// this record so its desired state is stopped before `stopped()` runs.
    pub(crate) fn failed_to_start(&mut self, id: ServiceId, dep_failed: bool, immediate_stop: bool) {
        if self.rec(id).waiting_for_console {
            self.unqueue_console(id);
            self.rec_mut(id).waiting_for_console = false;
        }

        if self.rec(id).start_explicit {
            self.rec_mut(id).start_explicit = false;
            self.release(id, false);
        }

        self.clear_waiting_on_edges(id);

        let inbound = self.rec(id).dependents.clone();
        for l in inbound {
            match self.link(l).dep_type {
                DepType::Regular | DepType::Milestone => {
                    let from = self.link(l).from;
                    if self.rec(from).state == ServiceState::Starting {
                        self.rec_mut(from).prop_failure = true;
                        self.add_prop_queue(from);
                    }
                }
                DepType::WaitsFor | DepType::Soft => {
                    if self.link(l).waiting_on {
                        self.link_mut(l).waiting_on = false;
                        let from = self.link(l).from;
                        self.dependency_started(from);
                    }
                }
            }

            if self.link(l).holding_acq {
                self.link_mut(l).holding_acq = false;
                self.release(id, false);
            }
        }

        self.rec_mut(id).start_failed = true;
        if dep_failed {
            tracing::error!(service = %self.rec(id).name, "cannot start: dependency failed");
        } else {
            tracing::error!(service = %self.rec(id).name, "failed to start");
        }
        self.notify_event(id, ServiceEvent::FailedStart);

        if immediate_stop {
            self.stopped(id);
        }
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    /// Request that the service stop. An explicit activation is dropped
    /// first; if no holder remains the stop is treated as a full manual
    /// bring-down regardless of `bring_down`.
    pub fn stop(&mut self, id: ServiceId, mut bring_down: bool) {
        if self.rec(id).start_explicit {
            let rec = self.rec_mut(id);
            rec.start_explicit = false;
            rec.required_by -= 1;
            if rec.required_by == 0 && rec.state == ServiceState::Stopped {
                rec.prop_release = !rec.prop_require;
                rec.prop_require = false;
                self.add_prop_queue(id);
                self.service_inactive(id);
            }
        }

        if self.rec(id).required_by == 0 {
            bring_down = true;
        }

        let state = self.rec(id).state;
        if bring_down && state != ServiceState::Stopped && state != ServiceState::Stopping {
            self.rec_mut(id).stop_reason = StopReason::Normal;
            self.do_stop(id);
        }
    }

    /// Restart without affecting dependency links or activation. Only valid
    /// while started; returns false otherwise.
    pub fn restart(&mut self, id: ServiceId) -> bool {
        if self.rec(id).state != ServiceState::Started {
            return false;
        }
        self.rec_mut(id).restarting = true;
        self.rec_mut(id).stop_reason = StopReason::Normal;
        self.do_stop(id);
        true
    }

    /// Mark this service (and transitively, via stop propagation, its hard
    /// dependents) as forcibly stopped. A pin in the started state defers
    /// the stop until unpinned.
    pub fn forced_stop(&mut self, id: ServiceId) {
        if self.rec(id).state != ServiceState::Stopped {
            self.rec_mut(id).force_stop = true;
            if !self.rec(id).pinned_started {
                self.rec_mut(id).prop_stop = true;
                self.add_prop_queue(id);
            }
        }
    }

    /// The stop entry point: cascade to hard dependents, interrupt a start
    /// in progress if permitted, then move to stopping.
    pub(crate) fn do_stop(&mut self, id: ServiceId) {
        // We may need to restart afterwards, but we won't know for sure
        // until the execution transition.
        let all_deps_stopped = self.stop_dependents(id);

        let state = self.rec(id).state;
        if state != ServiceState::Started {
            if state == ServiceState::Starting {
                let rec = self.rec(id);
                if !rec.waiting_for_deps && !rec.waiting_for_console {
                    if !self.can_interrupt_start(id) {
                        // Start must continue; the stop fires on started().
                        return;
                    }
                    if !self.interrupt_start(id) {
                        // The kind finishes the cancellation asynchronously.
                        self.notify_event(id, ServiceEvent::StartCancelled);
                        return;
                    }
                } else if self.rec(id).waiting_for_console {
                    self.unqueue_console(id);
                    self.rec_mut(id).waiting_for_console = false;
                }

                self.notify_event(id, ServiceEvent::StartCancelled);
                self.clear_waiting_on_edges(id);
            } else {
                // Already stopping or stopped.
                return;
            }
        }

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

    /// Issue a stop to every hard dependent holding activation. Returns true
    /// when none of them is still running.
    pub(crate) fn stop_dependents(&mut self, id: ServiceId) -> bool {
        let mut all_deps_stopped = true;
        let force = self.rec(id).force_stop;
        let inbound = self.rec(id).dependents.clone();
        for l in inbound {
            let link = self.link(l);
            if link.dep_type.is_hard() && link.holding_acq {
                let from = link.from;
                if self.rec(from).state != ServiceState::Stopped {
                    // The dependent will notify us when it stops, at which
                    // point stop_check_dependents runs again.
                    all_deps_stopped = false;
                }
                if force {
                    self.forced_stop(from);
                }
                self.rec_mut(from).prop_stop = true;
                self.add_prop_queue(from);
            }
        }
        all_deps_stopped
    }

    pub(crate) fn stop_check_dependents(&self, id: ServiceId) -> bool {
        self.rec(id)
            .dependents
            .iter()
            .all(|l| !(self.link(*l).dep_type.is_hard() && self.link(*l).holding_acq))
    }

    /// A dependent of this record reached the stopped state.
    pub(crate) fn dependent_stopped(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        if rec.state == ServiceState::Stopping && rec.waiting_for_deps {
            self.add_transition_queue(id);
        }
    }

    fn can_interrupt_stop(&self, id: ServiceId) -> bool {
        let rec = self.rec(id);
        rec.waiting_for_deps && !rec.force_stop
    }

    /// The kind signals that the service has fully stopped.
    pub(crate) fn stopped(&mut self, id: ServiceId) {
        if self.rec(id).have_console {
            self.host_mut().reclaim_terminal();
            self.release_console(id);
        }

        self.rec_mut(id).force_stop = false;

        let rec = self.rec_mut(id);
        rec.restarting |= rec.auto_restart;
        let will_restart = rec.restarting && rec.required_by > 0;
        if rec.restarting && !will_restart {
            self.notify_event(id, ServiceEvent::StartCancelled);
        }
        self.rec_mut(id).restarting = false;

        if !will_restart {
            // Break milestone, waits-for and soft dependencies now.
            let inbound = self.rec(id).dependents.clone();
            for l in inbound {
                if !self.link(l).dep_type.is_hard() {
                    if self.link(l).waiting_on {
                        self.link_mut(l).waiting_on = false;
                        let from = self.link(l).from;
                        if self.link(l).dep_type == DepType::Milestone {
                            // A milestone target that stops before starting
                            // fails its still-starting dependent.
                            if self.rec(from).state == ServiceState::Starting {
                                self.rec_mut(from).prop_failure = true;
                                self.add_prop_queue(from);
                            }
                        } else {
                            self.dependency_started(from);
                        }
                    }
                    if self.link(l).holding_acq {
                        self.link_mut(l).holding_acq = false;
                        // Release without issuing a stop: this service is
                        // already stopped or stopping.
                        self.release(id, false);
                    }
                }
            }
        }

        // Signal dependencies in case they are waiting for us to stop.
        let outbound = self.rec(id).depends_on.clone();
        for l in outbound {
            let to = self.link(l).to;
            self.dependent_stopped(to);
        }

        self.rec_mut(id).state = ServiceState::Stopped;

        if will_restart {
            self.rec_mut(id).restarting = true;
            self.start(id, false);
        } else {
            self.becoming_inactive(id);

            if self.rec(id).start_explicit {
                // required_by is at least one here; release marks inactive
                // and drops dependencies as needed.
                self.rec_mut(id).start_explicit = false;
                self.release(id, true);
            } else if self.rec(id).required_by == 0 {
                let rec = self.rec_mut(id);
                rec.prop_release = !rec.prop_require;
                rec.prop_require = false;
                self.add_prop_queue(id);
                self.service_inactive(id);
            }
        }

        // A start failure has been logged already; only log ordinary stops.
        if !self.rec(id).start_failed {
            tracing::info!(service = %self.rec(id).name, reason = %self.rec(id).stop_reason,
                "service stopped");
            if !will_restart {
                if let Some(chain) = self.rec(id).start_on_completion.clone() {
                    self.start_chain_target(id, &chain);
                }
            }
        }
        self.notify_event(id, ServiceEvent::Stopped);
    }

    fn start_chain_target(&mut self, id: ServiceId, target: &str) {
        let chain_id = match self.find_service(target) {
            Some(existing) => Some(existing),
            None => match self.host_mut().load_service(target) {
                Ok(builder) => match self.add_service(builder) {
                    Ok(new_id) => Some(new_id),
                    Err(err) => {
                        tracing::error!(service = %self.rec(id).name, chain = target,
                            %err, "could not register chain target");
                        None
                    }
                },
                Err(err) => {
                    tracing::error!(service = %self.rec(id).name, chain = target,
                        %err, "could not load chain target");
                    None
                }
            },
        };
        if let Some(chain_id) = chain_id {
            self.start(chain_id, true);
        }
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    /// Pin the service in the started state: stop requests and dependency
    /// stops are deferred until unpinned. Ignored if pinned stopped.
    pub fn pin_started(&mut self, id: ServiceId) {
        if !self.rec(id).pinned_stopped {
            self.rec_mut(id).pinned_started = true;
        }
    }

    /// Pin the service in the stopped state: start requests are recorded
    /// but deferred until unpinned. Ignored if pinned started.
    pub fn pin_stopped(&mut self, id: ServiceId) {
        if !self.rec(id).pinned_started {
            self.rec_mut(id).pinned_stopped = true;
        }
    }

    /// Clear whichever pin is set and let the deferred transition proceed.
    /// Drains the queues before returning.
    pub fn unpin(&mut self, id: ServiceId) {
        if self.rec(id).pinned_started {
            self.rec_mut(id).pinned_started = false;

            let outbound = self.rec(id).depends_on.clone();
            for l in outbound {
                if self.link(l).dep_type.is_hard() {
                    let to = self.link(l).to;
                    if self.rec(to).state != ServiceState::Started {
                        self.rec_mut(id).desired_state = ServiceState::Stopped;
                    }
                } else if self.link(l).holding_acq {
                    self.link_mut(l).holding_acq = false;
                    let to = self.link(l).to;
                    self.release(to, true);
                }
            }

            let rec = self.rec(id);
            if rec.desired_state == ServiceState::Stopped || rec.force_stop {
                self.do_stop(id);
                self.process_queues();
            }
        }
        if self.rec(id).pinned_stopped {
            self.rec_mut(id).pinned_stopped = false;
            if self.rec(id).desired_state == ServiceState::Started {
                self.do_start(id);
                self.process_queues();
            }
        }
    }

    // ------------------------------------------------------------------
    // Queue workers
    // ------------------------------------------------------------------

    /// Drain one record's propagation bits, in require, release, failure,
    /// start, stop order. Each bit is cleared before its sub-call so that
    /// re-entry cannot re-trigger it.
    pub(crate) fn do_propagation(&mut self, id: ServiceId) {
        if self.rec(id).prop_require {
            self.rec_mut(id).prop_require = false;
            let outbound = self.rec(id).depends_on.clone();
            for l in outbound {
                let to = self.link(l).to;
                self.require(to);
                self.link_mut(l).holding_acq = true;
            }
        }

        if self.rec(id).prop_release {
            self.rec_mut(id).prop_release = false;
            self.release_dependencies(id);
        }

        if self.rec(id).prop_failure {
            self.rec_mut(id).prop_failure = false;
            self.rec_mut(id).stop_reason = StopReason::DepFailed;
            self.failed_to_start(id, true, true);
        }

        if self.rec(id).prop_start {
            self.rec_mut(id).prop_start = false;
            self.start(id, false);
        }

        if self.rec(id).prop_stop {
            self.rec_mut(id).prop_stop = false;
            self.do_stop(id);
        }
    }

    /// One transition-queue step for this record.
    pub(crate) fn execute_transition(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        // Started with the restarting flag set means a smooth recovery is
        // waiting for dependencies.
        if rec.state == ServiceState::Starting
            || (rec.state == ServiceState::Started && rec.restarting)
        {
            if self.check_deps_started(id) {
                self.all_deps_started(id);
            }
        } else if rec.state == ServiceState::Stopping && self.stop_check_dependents(id) {
            self.rec_mut(id).waiting_for_deps = false;

            // A service that actually stops has its explicit activation
            // released, unless it is about to restart.
            let rec = self.rec(id);
            if rec.start_explicit && !rec.auto_restart && !rec.restarting {
                self.rec_mut(id).start_explicit = false;
                self.release(id, false);
            }

            self.bring_down(id);
        }
    }

    /// Drop the waiting-on mark from every outbound edge. Used whenever a
    /// record leaves the starting state without completing its start, so
    /// edge flags stay consistent at every fixed point.
    pub(crate) fn clear_waiting_on_edges(&mut self, id: ServiceId) {
        let outbound = self.rec(id).depends_on.clone();
        for l in outbound {
            self.link_mut(l).waiting_on = false;
        }
    }
}
