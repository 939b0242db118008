//! Application state.

use boardci_core::store::JobStore;
use boardci_scheduler::SchedulerHandle;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub store: Arc<dyn JobStore>,
    /// Shared secret for `X-Hub-Signature-256`. Without it signatures are not checked.
    pub webhook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(scheduler: SchedulerHandle, webhook_secret: Option<String>) -> Self {
        let store = scheduler.reporter().store().clone();
        Self {
            scheduler,
            store,
            webhook_secret: webhook_secret.map(Arc::from),
        }
    }
}
