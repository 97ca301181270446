//! Simulated GPU workers.
//!
//! - [`registry`]: worker records and health transitions
//! - [`heartbeat`]: heartbeat delivery, liveness checks and crash draws
//! - [`executor`]: per-type job handlers and the execution unit that runs
//!   one attempt against its deadline
//! - [`probe`]: resource snapshots used by the scheduler's placement policy
//!
//! Workers never run real work. Each job type's handler sleeps for the
//! simulated duration of its parameters, and fault injection jobs may fail
//! on purpose.

pub mod executor;
pub mod heartbeat;
pub mod probe;
pub mod registry;

pub use executor::{HandlerRegistry, JobExecutor, JobHandler};
pub use heartbeat::HeartbeatMonitor;
pub use probe::{ResourceProbe, ResourceSnapshot, SimulatedProbe, StaticProbe, UnavailableProbe};
pub use registry::{Worker, WorkerHealth, WorkerRegistry};
