//! Daily statistics refresher
//!
//! Thin range-scoped wrapper over the SQL-side daily stats and
//! analytics materializations. All the heavy lifting is in the store;
//! this worker only exists so the refresh rides the same lease and
//! checkpoint discipline as everything else.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, DAILY_STATS_WORKER};

pub struct DailyStatsProcessor {
    ctx: ProcessorContext,
}

impl DailyStatsProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for DailyStatsProcessor {
    fn name(&self) -> &'static str {
        DAILY_STATS_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        self.ctx.repository.refresh_daily_stats_range(from, to).await?;
        self.ctx
            .repository
            .refresh_analytics_daily_metrics_range(from, to)
            .await?;
        Ok(())
    }
}
