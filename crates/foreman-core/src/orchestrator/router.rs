//! Routing orchestrator: step kind -> manager dispatch.
//!
//! Design:
//! - Built during initialization (mutable registration in the builder).
//! - Used during runtime (immutable lookups).
//! This keeps the dispatch path lock-free.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{EngineError, JobId};
use crate::orchestrator::{ManagerContext, MonitorRegistry, StepConfig, StepManager};

pub struct Router {
    managers: HashMap<String, Arc<dyn StepManager>>,
    ctx: ManagerContext,
    monitors: Arc<MonitorRegistry>,
}

impl Router {
    pub(crate) fn new(
        managers: HashMap<String, Arc<dyn StepManager>>,
        ctx: ManagerContext,
        monitors: Arc<MonitorRegistry>,
    ) -> Self {
        Self {
            managers,
            ctx,
            monitors,
        }
    }

    /// Single entry point for external schedulers: create the parent job for
    /// `config` and start monitoring its tree. Each invocation creates a new
    /// job id.
    pub async fn execute(&self, config: &StepConfig) -> Result<JobId, EngineError> {
        let Some(manager) = self.managers.get(&config.kind) else {
            return Err(EngineError::UnknownStepKind(config.kind.clone()));
        };
        let job_id = manager.create_parent_job(&self.ctx, config).await?;
        self.monitors.start(job_id);
        tracing::info!(job_id = %job_id, kind = %config.kind, "step routed");
        Ok(job_id)
    }

    pub fn kinds(&self) -> Vec<String> {
        self.managers.keys().cloned().collect()
    }
}
