//! The service set: registry, work queues and the quiescence loop.
//!
//! A [`ServiceSet`] owns every service record in an arena and drives all
//! state changes. External callers mutate state through the top-level
//! operations (`start`, `stop`, `restart`, process event entry points) and
//! then call [`ServiceSet::process_queues`], which drains the propagation
//! and transition queues to a fixed point. The core is single threaded and
//! cooperative: nothing here blocks or yields, waiting is always recorded
//! as state.

mod lifecycle;
mod process;
mod record;

pub use record::{DepType, ServiceEvent, ServiceFlags, ServiceId, ServiceState, StopReason};

pub(crate) use record::{DepLink, LinkId, ProcessState, ServiceKind, ServiceRecord};

use std::collections::{HashMap, VecDeque};

use crate::builder::ServiceBuilder;
use crate::error::{Error, Result};
use crate::host::Host;

/// Registry of service records plus the three work queues.
///
/// The propagation queue holds records with pending `prop_*` bits, the
/// transition queue holds records ready to re-evaluate their in-between
/// state, and the console queue holds records waiting for the single
/// console slot in FIFO order.
pub struct ServiceSet<H: Host> {
    host: H,
    records: Vec<ServiceRecord>,
    links: Vec<DepLink>,
    by_name: HashMap<String, ServiceId>,
    free_slots: Vec<usize>,
    prop_queue: VecDeque<ServiceId>,
    transition_queue: VecDeque<ServiceId>,
    console_queue: VecDeque<ServiceId>,
    console_holder: Option<ServiceId>,
    active_services: usize,
}

impl<H: Host> ServiceSet<H> {
    pub fn new(host: H) -> Self {
        ServiceSet {
            host,
            records: Vec::new(),
            links: Vec::new(),
            by_name: HashMap::new(),
            free_slots: Vec::new(),
            prop_queue: VecDeque::new(),
            transition_queue: VecDeque::new(),
            console_queue: VecDeque::new(),
            console_holder: None,
            active_services: 0,
        }
    }

    /// The host collaborator, for inspection or driving.
    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub(crate) fn rec(&self, id: ServiceId) -> &ServiceRecord {
        &self.records[id.0]
    }

    pub(crate) fn rec_mut(&mut self, id: ServiceId) -> &mut ServiceRecord {
        &mut self.records[id.0]
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a service built from `builder`. The name must be unique and
    /// every dependency target must already be registered.
    pub fn add_service(&mut self, builder: ServiceBuilder) -> Result<ServiceId> {
        if self.by_name.contains_key(builder.name()) {
            return Err(Error::ServiceExists(builder.name().to_string()));
        }
        for (dep, _) in builder.dependencies() {
            if !self.is_registered(*dep) {
                return Err(Error::UnknownDependency);
            }
        }

        let (record, deps) = builder.into_record()?;
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.records[slot] = record;
                ServiceId(slot)
            }
            None => {
                self.records.push(record);
                ServiceId(self.records.len() - 1)
            }
        };
        self.by_name.insert(self.records[id.0].name.clone(), id);

        for (to, dep_type) in deps {
            let link = LinkId(self.links.len());
            self.links.push(DepLink {
                from: id,
                to,
                dep_type,
                holding_acq: false,
                waiting_on: false,
            });
            self.records[id.0].depends_on.push(link);
            self.records[to.0].dependents.push(link);
        }
        Ok(id)
    }

    /// Remove a stopped service with no remaining dependents. Its handle
    /// becomes invalid and the slot may be reused.
    pub fn remove_service(&mut self, id: ServiceId) -> Result<()> {
        let rec = self.rec(id);
        if rec.state != ServiceState::Stopped {
            return Err(Error::NotStopped(rec.name.clone()));
        }
        if !rec.dependents.is_empty() {
            return Err(Error::HasDependents(rec.name.clone()));
        }

        let outbound = self.rec(id).depends_on.clone();
        for l in outbound {
            if self.links[l.0].holding_acq {
                self.links[l.0].holding_acq = false;
                let to = self.links[l.0].to;
                self.release(to, true);
            }
            let to = self.links[l.0].to;
            self.records[to.0].dependents.retain(|d| *d != l);
        }

        self.service_inactive(id);
        // A stopped record may still carry a latched release; the reused
        // slot must not inherit queue membership.
        self.prop_queue.retain(|q| *q != id);
        self.transition_queue.retain(|q| *q != id);
        let name = std::mem::take(&mut self.records[id.0].name);
        self.by_name.remove(&name);
        self.records[id.0] = ServiceRecord::new(String::new(), ServiceKind::Internal);
        self.free_slots.push(id.0);
        Ok(())
    }

    /// Look a service up by name.
    pub fn find_service(&self, name: &str) -> Option<ServiceId> {
        self.by_name.get(name).copied()
    }

    fn is_registered(&self, id: ServiceId) -> bool {
        id.0 < self.records.len() && !self.free_slots.contains(&id.0)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn service_state(&self, id: ServiceId) -> ServiceState {
        self.rec(id).state
    }

    pub fn desired_state(&self, id: ServiceId) -> ServiceState {
        self.rec(id).desired_state
    }

    pub fn stop_reason(&self, id: ServiceId) -> StopReason {
        self.rec(id).stop_reason
    }

    pub fn was_start_skipped(&self, id: ServiceId) -> bool {
        self.rec(id).start_skipped
    }

    pub fn did_start_fail(&self, id: ServiceId) -> bool {
        self.rec(id).start_failed
    }

    pub fn name_of(&self, id: ServiceId) -> &str {
        &self.rec(id).name
    }

    pub fn required_by(&self, id: ServiceId) -> usize {
        self.rec(id).required_by
    }

    pub fn is_explicitly_started(&self, id: ServiceId) -> bool {
        self.rec(id).start_explicit
    }

    pub fn is_pinned_started(&self, id: ServiceId) -> bool {
        self.rec(id).pinned_started
    }

    pub fn is_pinned_stopped(&self, id: ServiceId) -> bool {
        self.rec(id).pinned_stopped
    }

    pub fn has_console(&self, id: ServiceId) -> bool {
        self.rec(id).have_console
    }

    /// The service counts towards the active-service total.
    pub fn is_active(&self, id: ServiceId) -> bool {
        self.rec(id).counted_active
    }

    /// Direct dependencies of a service, as (target, type) pairs.
    pub fn dependencies_of(&self, id: ServiceId) -> Vec<(ServiceId, DepType)> {
        self.rec(id)
            .depends_on
            .iter()
            .map(|l| (self.links[l.0].to, self.links[l.0].dep_type))
            .collect()
    }

    /// Number of inbound dependency edges currently holding activation.
    pub fn dependents_holding(&self, id: ServiceId) -> usize {
        self.rec(id)
            .dependents
            .iter()
            .filter(|l| self.links[l.0].holding_acq)
            .count()
    }

    /// A propagation request is latched on this record.
    pub fn propagation_pending(&self, id: ServiceId) -> bool {
        self.rec(id).any_prop_pending()
    }

    /// The pid of the service's child process, if one is running.
    pub fn process_pid(&self, id: ServiceId) -> Option<nix::unistd::Pid> {
        self.rec(id).kind.proc().and_then(|ps| ps.pid)
    }

    /// Services that are not stopped-and-unrequired. Shutdown is complete
    /// when this reaches zero.
    pub fn count_active_services(&self) -> usize {
        self.active_services
    }

    pub(crate) fn service_active(&mut self, id: ServiceId) {
        if !self.rec(id).counted_active {
            self.rec_mut(id).counted_active = true;
            self.active_services += 1;
        }
    }

    pub(crate) fn service_inactive(&mut self, id: ServiceId) {
        if self.rec(id).counted_active {
            self.rec_mut(id).counted_active = false;
            self.active_services -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    pub(crate) fn add_prop_queue(&mut self, id: ServiceId) {
        if !self.rec(id).in_prop_queue {
            tracing::debug!(service = %self.rec(id).name, "queued for propagation");
            self.rec_mut(id).in_prop_queue = true;
            self.prop_queue.push_back(id);
        }
    }

    pub(crate) fn add_transition_queue(&mut self, id: ServiceId) {
        if !self.rec(id).in_transition_queue {
            tracing::debug!(service = %self.rec(id).name, "queued for transition");
            self.rec_mut(id).in_transition_queue = true;
            self.transition_queue.push_back(id);
        }
    }

    /// Drain both work queues to a fixed point.
    ///
    /// Propagation runs strictly before transitions: a record that gains
    /// propagation work while a transition executes is re-drained before the
    /// next transition step. Call this after any batch of mutations.
    pub fn process_queues(&mut self) {
        let mut propagations = 0usize;
        let mut transitions = 0usize;
        while !self.prop_queue.is_empty() || !self.transition_queue.is_empty() {
            while let Some(id) = self.prop_queue.pop_front() {
                self.rec_mut(id).in_prop_queue = false;
                self.do_propagation(id);
                propagations += 1;
            }
            if let Some(id) = self.transition_queue.pop_front() {
                self.rec_mut(id).in_transition_queue = false;
                self.execute_transition(id);
                transitions += 1;
            }
        }
        if propagations + transitions > 0 {
            tracing::debug!(propagations, transitions, "queues drained to fixed point");
        }
    }

    // ------------------------------------------------------------------
    // Console arbiter
    // ------------------------------------------------------------------

    pub(crate) fn queue_for_console(&mut self, id: ServiceId) {
        self.rec_mut(id).waiting_for_console = true;
        self.console_queue.push_back(id);
        if self.console_holder.is_none() {
            self.pull_console_queue();
        }
    }

    pub(crate) fn unqueue_console(&mut self, id: ServiceId) {
        self.console_queue.retain(|q| *q != id);
    }

    /// Hand the free console slot to the head waiter, which either proceeds
    /// with its start or immediately yields the slot back.
    pub(crate) fn pull_console_queue(&mut self) {
        if self.console_holder.is_some() {
            return;
        }
        if let Some(next) = self.console_queue.pop_front() {
            let rec = self.rec_mut(next);
            rec.waiting_for_console = false;
            rec.have_console = true;
            self.console_holder = Some(next);
            tracing::debug!(service = %self.rec(next).name, "console granted");
            self.acquired_console(next);
        }
    }

    pub(crate) fn release_console(&mut self, id: ServiceId) {
        self.rec_mut(id).have_console = false;
        if self.console_holder == Some(id) {
            tracing::debug!(service = %self.rec(id).name, "console released");
            self.console_holder = None;
            self.pull_console_queue();
        }
    }

    fn acquired_console(&mut self, id: ServiceId) {
        if self.rec(id).state != ServiceState::Starting {
            // Got the console but no longer want it.
            self.release_console(id);
        } else if self.check_deps_started(id) {
            self.all_deps_started(id);
        } else {
            // Got the console but cannot use it yet.
            self.release_console(id);
        }
    }

    pub fn is_queued_for_console(&self, id: ServiceId) -> bool {
        self.console_queue.contains(&id)
    }

    pub fn is_console_queue_empty(&self) -> bool {
        self.console_queue.is_empty()
    }

    // ------------------------------------------------------------------
    // Link helpers
    // ------------------------------------------------------------------

    pub(crate) fn link(&self, l: LinkId) -> &DepLink {
        &self.links[l.0]
    }

    pub(crate) fn link_mut(&mut self, l: LinkId) -> &mut DepLink {
        &mut self.links[l.0]
    }

    pub(crate) fn notify_event(&mut self, id: ServiceId, event: ServiceEvent) {
        let name = self.rec(id).name.clone();
        self.host.service_event(id, &name, event);
    }
}
