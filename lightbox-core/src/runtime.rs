//! Process-wide singletons with explicit init and shutdown.
//!
//! Exactly two exist: the metadata store handle and the scheduler. Init is
//! explicit and rejected when called twice; there is no silent
//! re-initialization.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::{CoreError, Result};
use crate::scheduler::TaskScheduler;
use crate::store::MetadataStore;

static STORE: OnceCell<Arc<MetadataStore>> = OnceCell::new();
static SCHEDULER: OnceCell<Arc<TaskScheduler>> = OnceCell::new();

/// Install the process-wide metadata store. Errors if one is already set.
pub fn init_store(store: Arc<MetadataStore>) -> Result<()> {
    STORE
        .set(store)
        .map_err(|_| CoreError::Internal("metadata store already initialized".into()))
}

pub fn store() -> Option<Arc<MetadataStore>> {
    STORE.get().cloned()
}

/// Install the process-wide scheduler. Errors if one is already set.
pub fn init_scheduler(scheduler: Arc<TaskScheduler>) -> Result<()> {
    SCHEDULER
        .set(scheduler)
        .map_err(|_| CoreError::Internal("scheduler already initialized".into()))
}

pub fn scheduler() -> Option<Arc<TaskScheduler>> {
    SCHEDULER.get().cloned()
}
