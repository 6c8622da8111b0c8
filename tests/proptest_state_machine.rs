//! Property-based tests for the supervision state machine.
//!
//! Random operation sequences run against a fixed mixed-type dependency
//! graph, draining the queues after every operation, and the structural
//! invariants are asserted at every fixed point:
//! - activation counts match the holding edges plus explicit activation
//! - at most one service holds the console
//! - the two pins are mutually exclusive
//! - a started service has all its regular dependencies started
//! - stopped and unrequired services are not counted active
//! - no propagation request survives a queue drain

mod common;

use std::time::Duration;

use common::TestHost;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use proptest::prelude::*;
use overseer::{DepType, ServiceBuilder, ServiceFlags, ServiceId, ServiceSet, ServiceState};

#[derive(Debug, Clone)]
enum Op {
    Start(u8),
    Stop(u8),
    Restart(u8),
    ForcedStop(u8),
    PinStarted(u8),
    PinStopped(u8),
    Unpin(u8),
    ExecOk(u8),
    ExecFail(u8),
    ExitCode(u8, i32),
    ExitSignal(u8),
    Advance(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u8>().prop_map(Op::Start),
        any::<u8>().prop_map(Op::Stop),
        any::<u8>().prop_map(Op::Restart),
        any::<u8>().prop_map(Op::ForcedStop),
        (any::<u8>(), any::<bool>()).prop_map(|(s, started)| {
            if started {
                Op::PinStarted(s)
            } else {
                Op::PinStopped(s)
            }
        }),
        any::<u8>().prop_map(Op::Unpin),
        any::<u8>().prop_map(Op::ExecOk),
        any::<u8>().prop_map(Op::ExecFail),
        (any::<u8>(), prop::option::of(0..2i32)).prop_map(|(s, code)| match code {
            Some(code) => Op::ExitCode(s, code),
            None => Op::ExitSignal(s),
        }),
        (0u16..500).prop_map(Op::Advance),
    ]
}

/// Four services covering all kinds and dependency types:
/// `b` (process, on console) requires `a`; `c` waits for `b` and has `a`
/// as a milestone; `d` requires `c` and softly wants `b`.
fn build_graph(services: &mut ServiceSet<TestHost>) -> Vec<ServiceId> {
    let a = services
        .add_service(ServiceBuilder::internal("svc-a"))
        .expect("register a");
    let b = services
        .add_service(
            ServiceBuilder::process("svc-b", vec!["b-cmd".to_string()])
                .restart_delay(Duration::ZERO)
                .depends_on(a, DepType::Regular)
                .flags(ServiceFlags {
                    starts_on_console: true,
                    ..Default::default()
                }),
        )
        .expect("register b");
    let c = services
        .add_service(
            ServiceBuilder::internal("svc-c")
                .depends_on(b, DepType::WaitsFor)
                .depends_on(a, DepType::Milestone),
        )
        .expect("register c");
    let d = services
        .add_service(
            ServiceBuilder::process("svc-d", vec!["d-cmd".to_string()])
                .restart_delay(Duration::ZERO)
                .depends_on(c, DepType::Regular)
                .depends_on(b, DepType::Soft),
        )
        .expect("register d");
    vec![a, b, c, d]
}

fn apply(services: &mut ServiceSet<TestHost>, ids: &[ServiceId], op: &Op) {
    let pick = |sel: u8| ids[sel as usize % ids.len()];
    match op {
        Op::Start(s) => services.start(pick(*s), true),
        Op::Stop(s) => services.stop(pick(*s), true),
        Op::Restart(s) => {
            services.restart(pick(*s));
        }
        Op::ForcedStop(s) => services.forced_stop(pick(*s)),
        Op::PinStarted(s) => services.pin_started(pick(*s)),
        Op::PinStopped(s) => services.pin_stopped(pick(*s)),
        Op::Unpin(s) => services.unpin(pick(*s)),
        Op::ExecOk(s) => services.exec_succeeded(pick(*s)),
        Op::ExecFail(s) => services.exec_failed(pick(*s), Errno::ENOENT),
        Op::ExitCode(s, code) => {
            let id = pick(*s);
            if let Some(pid) = services.process_pid(id) {
                services.handle_exit_status(id, WaitStatus::Exited(pid, *code));
            }
        }
        Op::ExitSignal(s) => {
            let id = pick(*s);
            if let Some(pid) = services.process_pid(id) {
                services.handle_exit_status(id, WaitStatus::Signaled(pid, Signal::SIGTERM, false));
            }
        }
        Op::Advance(ms) => {
            common::advance(services, Duration::from_millis(*ms as u64));
        }
    }
    services.process_queues();
}

fn check_invariants(services: &ServiceSet<TestHost>, ids: &[ServiceId]) {
    let mut console_holders = 0;
    for &id in ids {
        let name = services.name_of(id).to_string();

        // Activation count matches the holding edges plus explicit start.
        let expected = services.dependents_holding(id)
            + usize::from(services.is_explicitly_started(id));
        assert_eq!(
            services.required_by(id),
            expected,
            "{name}: required_by diverged from holders"
        );

        if services.has_console(id) {
            console_holders += 1;
        }

        assert!(
            !(services.is_pinned_started(id) && services.is_pinned_stopped(id)),
            "{name}: both pins set"
        );

        // A started, unpinned service has its regular dependencies started.
        if services.service_state(id) == ServiceState::Started
            && !services.is_pinned_started(id)
        {
            for (dep, dep_type) in services.dependencies_of(id) {
                if dep_type == DepType::Regular {
                    assert_eq!(
                        services.service_state(dep),
                        ServiceState::Started,
                        "{name}: started with a stopped regular dependency"
                    );
                }
            }
        }

        // Stopped and unrequired means inactive.
        if services.service_state(id) == ServiceState::Stopped && services.required_by(id) == 0 {
            assert!(
                !services.is_active(id),
                "{name}: stopped and unrequired but still counted active"
            );
        }

        // Queue drains leave no latched propagation behind.
        assert!(
            !services.propagation_pending(id),
            "{name}: propagation bit set after drain"
        );
    }
    assert!(console_holders <= 1, "more than one console holder");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn invariants_hold_across_random_operations(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut services = ServiceSet::new(TestHost::new());
        let ids = build_graph(&mut services);

        for op in &ops {
            apply(&mut services, &ids, op);
            check_invariants(&services, &ids);
        }
    }

    /// Driving every service down (with process exits fed in) always ends
    /// with an empty active set.
    #[test]
    fn full_stop_reaches_quiescence(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut services = ServiceSet::new(TestHost::new());
        let ids = build_graph(&mut services);

        for op in &ops {
            apply(&mut services, &ids, op);
        }

        for &id in &ids {
            services.unpin(id);
            services.stop(id, true);
            services.process_queues();
        }
        // Let stragglers finish: complete pending execs, reap processes and
        // run out any timers.
        for _ in 0..4 {
            for &id in &ids {
                services.exec_succeeded(id);
                services.process_queues();
                if let Some(pid) = services.process_pid(id) {
                    services.handle_exit_status(id, WaitStatus::Exited(pid, 0));
                    services.process_queues();
                }
                services.stop(id, true);
                services.process_queues();
            }
            common::advance(&mut services, Duration::from_secs(60));
        }

        for &id in &ids {
            prop_assert_eq!(services.service_state(id), ServiceState::Stopped);
        }
        prop_assert_eq!(services.count_active_services(), 0);
        check_invariants(&services, &ids);
    }
}
