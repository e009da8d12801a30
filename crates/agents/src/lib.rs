pub mod graph;
pub mod models;
pub mod runtime;
pub mod scheduler;
pub mod state_store;
pub mod tracing_ext;

pub use models::{AgentRequest, AgentRun, ExecutionStrategy, RunPriority, RunStatus, StepStatus};
pub use runtime::AgentsRuntime;
pub use scheduler::RunScheduler;
pub use state_store::AgentsStateStore;
