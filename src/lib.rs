//! Distributed host for long-running, persistent workflows.
//!
//! A workflow template declares hierarchical state machines whose actions call
//! into registered [`Worker`] plugins. Hosts share a record store, a lock
//! provider and a message bus; each instance is run by at most one agent at a
//! time, guarded by its instance lease.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flowhost::messaging::{BusRegistry, MemoryBus};
//! use flowhost::scheduler::TimerJobScheduler;
//! use flowhost::store::memory::MemoryRecordStore;
//! use flowhost::sync::MemoryLockProvider;
//! use flowhost::{HostOptions, HostServices, WorkerRegistry, WorkflowHost};
//!
//! # async fn run() -> Result<(), flowhost::WorkflowError> {
//! let bus: Arc<dyn flowhost::messaging::MessageBus> = Arc::new(MemoryBus::new(BusRegistry::new()));
//! let services = HostServices::new(
//!     Arc::new(MemoryRecordStore::new()),
//!     Arc::new(MemoryLockProvider::new()),
//!     Arc::clone(&bus),
//!     TimerJobScheduler::start(Arc::clone(&bus)),
//!     WorkerRegistry::builder().build(),
//! );
//! let host = WorkflowHost::new(services, HostOptions::default());
//! host.on_start().await?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod logging;

pub mod agent;
pub mod alerts;
pub mod client;
pub mod context;
pub mod error;
pub mod host;
pub mod machine;
pub mod messaging;
pub mod observability;
pub mod options;
pub mod records;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod template;
pub mod workers;
pub mod workspace;

pub use agent::{AgentOwner, WorkflowAgent};
pub use alerts::{AlertSink, Severity};
pub use client::WorkflowClient;
pub use context::{ActionContext, HostServices, WorkflowContext};
pub use error::{ActionError, RouteError, TemplateError, WorkerError, WorkflowError};
pub use host::{GroomReport, WorkflowHost};
pub use machine::{FireOutcome, StateMachine};
pub use observability::{init_logging, LogFormat, ObservabilityConfig};
pub use options::HostOptions;
pub use records::{InstanceStatus, TriggerRoute, WorkflowInstanceInfo, WorkflowMachineState, WorkflowTrigger};
pub use template::{specify_using_template, WorkflowTemplate};
pub use workers::{Worker, WorkerRegistry};
