//! # Overseer
//!
//! The supervision core of a service-management daemon: a registry of named
//! services, each with its own lifecycle state machine, connected by typed
//! dependency edges and driven to a consistent fixed point after every
//! external event.
//!
//! ## Features
//!
//! - **Typed dependencies**: regular, milestone, waits-for and soft edges,
//!   each with its own failure and release semantics
//! - **Fixed-point scheduling**: propagation and transition queues drained
//!   by [`ServiceSet::process_queues`] after every mutation batch
//! - **Process supervision**: launch, readiness notification, start and
//!   stop timeouts, stop-signal escalation
//! - **Restart machinery**: automatic restart, restart pacing with a
//!   rate-limit window, and smooth recovery that re-execs a process without
//!   leaving the started state
//! - **Console arbitration**: a single controlling-terminal slot granted in
//!   FIFO order
//! - **Pinning**: services can be administratively frozen started or
//!   stopped until unpinned
//!
//! ## Quick start
//!
//! ```no_run
//! use overseer::{Host, ServiceBuilder, ServiceSet};
//!
//! fn run(host: impl Host) -> overseer::Result<()> {
//!     let mut services = ServiceSet::new(host);
//!     let db = services.add_service(ServiceBuilder::process(
//!         "db",
//!         vec!["/usr/bin/db".to_string()],
//!     ))?;
//!     let web = services.add_service(
//!         ServiceBuilder::process("web", vec!["/usr/bin/web".to_string()])
//!             .depends_on(db, overseer::DepType::Regular),
//!     )?;
//!     services.start(web, true);
//!     services.process_queues();
//!     Ok(())
//! }
//! ```
//!
//! ## Execution model
//!
//! The core is single threaded and cooperative. It never blocks: whenever an
//! operation must wait (for a dependency, the console, a timer or a
//! readiness notification) it records the intent in state and returns. The
//! host event loop feeds timer expiries, process events and commands back
//! in through the entry points on [`ServiceSet`], then calls
//! [`process_queues`](ServiceSet::process_queues) to drain the work queues.

pub mod builder;
pub mod error;
pub mod host;
pub mod supervisor;

pub use builder::ServiceBuilder;
pub use error::{Error, LoadError, Result};
pub use host::{Host, LaunchSpec};
pub use supervisor::{
    DepType, ServiceEvent, ServiceFlags, ServiceId, ServiceSet, ServiceState, StopReason,
};
