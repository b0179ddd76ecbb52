//! Orchestration: routing (step kind -> manager) and per-lineage monitoring.

mod manager;
mod monitor;
mod router;

pub use manager::{ManagerContext, SeedJobManager, StepConfig, StepManager};
pub use monitor::MonitorRegistry;
pub(crate) use monitor::MonitorDeps;
pub use router::Router;
