use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDateTime, NaiveTime};
use tracing::info;

use crate::{
    collaborators::{LogAnalyzer, LogCollector},
    error::JobError,
    registry::JobBody,
};

/// `[yesterday 00:00, today 00:00)` in local time.
pub fn yesterday_window(now: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
    let end = now.date().and_time(NaiveTime::MIN);
    let start = end
        .date()
        .checked_sub_days(Days::new(1))
        .map_or(end, |day| day.and_time(NaiveTime::MIN));
    (start, end)
}

/// Nightly analysis of the previous day's query logs.
pub struct AnalyzeLogs {
    analyzer: Arc<dyn LogAnalyzer>,
}

impl AnalyzeLogs {
    pub fn new(analyzer: Arc<dyn LogAnalyzer>) -> Self {
        Self { analyzer }
    }

    pub async fn analyze_at(&self, now: NaiveDateTime) -> Result<(), JobError> {
        let (start, end) = yesterday_window(now);
        self.analyzer.analyze(start, end).await?;
        info!(%start, %end, "log analysis finished");
        Ok(())
    }
}

#[async_trait]
impl JobBody for AnalyzeLogs {
    async fn run(&self) -> Result<(), JobError> {
        self.analyze_at(Local::now().naive_local()).await
    }
}

/// Periodic pull of fresh logs from the upstream filter.
pub struct UpstreamLogPull {
    collector: Arc<dyn LogCollector>,
}

impl UpstreamLogPull {
    pub fn new(collector: Arc<dyn LogCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl JobBody for UpstreamLogPull {
    async fn run(&self) -> Result<(), JobError> {
        self.collector.pull().await
    }
}
