//! Expiry sweep: deletes export requests past their `expires_at` along with
//! their objects.

use tracing::info;

use super::scheduler::{Job, JobFrequency};
use crate::middleware::metrics::record_expired_deleted;
use crate::services::LifecycleController;

pub struct ExpireExportsJob {
    controller: LifecycleController,
    interval_minutes: u64,
}

impl ExpireExportsJob {
    pub fn new(controller: LifecycleController, interval_minutes: u64) -> Self {
        Self {
            controller,
            interval_minutes,
        }
    }
}

#[async_trait::async_trait]
impl Job for ExpireExportsJob {
    fn name(&self) -> &'static str {
        "expire_exports"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(self.interval_minutes)
    }

    async fn execute(&self) -> anyhow::Result<()> {
        let deleted = self.controller.sweep_expired().await?;
        record_expired_deleted(deleted);
        if deleted > 0 {
            info!(deleted, "Deleted expired exports");
        }
        Ok(())
    }
}
