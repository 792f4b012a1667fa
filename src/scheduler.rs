//! The required [`TaskScheduler`] collaborator (spec.md §6.1, §6.2).

use std::sync::Arc;

use crate::{error::InvalidTokenError, graph::NodeKey, task::Task};

/// Exactly one of these methods is invoked per scheduled task
/// (spec.md §6.2). Additional invocations after the first must be
/// ignored by the implementation, not by callers.
pub trait TaskCompletionCallback: Send + Sync {
    fn report_success(&self);
    fn report_failure(&self, message: Option<String>, cause: Option<anyhow::Error>);
}

/// The external collaborator that actually runs tasks. `Token` is
/// whatever opaque handle the scheduler chooses to issue; the driver
/// never inspects it beyond equality/cloning needed for bookkeeping.
pub trait TaskScheduler: Send + Sync {
    type Token: Clone + Send + Sync + 'static;

    /// Schedules `task`. `callback` must fire exactly once. If the
    /// scheduler invokes `callback` synchronously before returning,
    /// it may return `None` in place of a token (spec.md §6.1).
    fn submit(
        &self,
        node: &NodeKey,
        task: Arc<dyn Task>,
        callback: Arc<dyn TaskCompletionCallback>,
    ) -> Option<Self::Token>;

    /// Attaches a callback to a previously issued token. If the task
    /// already completed, the relevant callback method must fire
    /// before this call returns.
    fn register_callback(
        &self,
        token: &Self::Token,
        callback: Arc<dyn TaskCompletionCallback>,
    ) -> Result<(), InvalidTokenError>;
}
