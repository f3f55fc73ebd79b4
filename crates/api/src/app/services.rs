//! Service wiring: store selection, flow control and the driver the handlers
//! talk to.

use std::sync::Arc;

use remitsync_core::BatchId;
use remitsync_infra::pipeline::BatchTrigger;
use remitsync_infra::{
    InMemoryPipelineStore, PipelineStore, PostgresPipelineStore, SchedulerDriver, Settings,
    StoreError,
};
use remitsync_remote::{FlowControl, RateLimiter};
use tracing::{info, warn};

/// Shared state behind every handler.
pub struct AppServices {
    driver: Arc<SchedulerDriver>,
    trigger: Option<BatchTrigger>,
}

impl AppServices {
    /// `trigger` is the running driver loop's entry point. Without one, no
    /// pass runs in the background and `POST /batches/{id}/process` runs the
    /// pass inline.
    pub fn new(driver: Arc<SchedulerDriver>, trigger: Option<BatchTrigger>) -> Self {
        Self { driver, trigger }
    }

    pub fn driver(&self) -> &SchedulerDriver {
        &self.driver
    }

    pub fn has_background_driver(&self) -> bool {
        self.trigger.is_some()
    }

    /// Queue a pass on the driver loop. Returns whether a request was queued.
    pub fn request_pass(&self, batch_id: BatchId) -> bool {
        let Some(trigger) = &self.trigger else {
            return false;
        };
        match trigger.trigger(batch_id) {
            Ok(()) => true,
            Err(err) => {
                warn!(batch_id = %batch_id, error = %err, "could not queue pass");
                false
            }
        }
    }
}

/// Postgres when `database_url` is configured (migrations applied), the
/// in-memory store otherwise.
pub async fn build_store(settings: &Settings) -> Result<Arc<dyn PipelineStore>, StoreError> {
    match settings.database_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            let store = PostgresPipelineStore::connect(url).await?;
            store.migrate().await?;
            info!("using postgres pipeline store");
            Ok(Arc::new(store))
        }
        _ => {
            warn!("database_url not set; pipeline state is kept in memory only");
            Ok(InMemoryPipelineStore::arc())
        }
    }
}

/// The process-wide flow control shared by every batch.
pub fn build_flow_control(settings: &Settings) -> FlowControl {
    FlowControl::new(
        RateLimiter::new(settings.flow.max_requests, settings.flow.window()),
        settings.flow.breaker(),
        settings.retry.config(),
    )
}
