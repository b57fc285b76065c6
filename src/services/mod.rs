//! Control-plane services: one module per component.

pub mod agent_registry;
pub mod builtin_handlers;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod event_bus;
pub mod event_store;
pub mod heartbeat;
pub mod improvement_loop;
pub mod planner;
pub mod playbook_library;
pub mod quality_gates;
pub mod reactor;
pub mod rollback;
pub mod router;
pub mod scheduler;
pub mod trace_recorder;

pub use agent_registry::{AgentRegistry, AgentStats, RegistryError};
pub use circuit_breaker::{BreakerConfig, BreakerKey, BreakerState, CircuitBreakers};
pub use dispatcher::{AgentLoadTable, DispatchOutcome, Dispatcher, DispatcherConfig};
pub use event_bus::{BusError, EventBus, EventBusConfig, EventSubscriber, SubscriptionId};
pub use event_store::{EventStore, RepairReport, StoreConfig, StoreError, StoredRecord, Stream};
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use improvement_loop::{CycleReport, ImprovementConfig, ImprovementError, SelfImprovingLoop};
pub use planner::{Planner, PlannerError};
pub use playbook_library::PlaybookLibrary;
pub use quality_gates::{GateConfig, GateVerdict, QualityGates};
pub use reactor::{PlaybookStats, Reactor, ReactorConfig};
pub use rollback::{Rollback, RollbackConfig, RollbackError, SnapshotReason, SnapshotVault};
pub use router::{Route, RouteError, Router, RouterConfig};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError};
pub use trace_recorder::{TraceRecorder, WorkerFailure};
