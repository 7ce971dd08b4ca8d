//! Built-in notifiers.

use async_trait::async_trait;
use tracing::info;

use chengis_core::build::BuildStatus;
use chengis_core::notify::{BuildSummary, Notifier};

/// Notifier that writes the terminal summary to the log stream.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, summary: &BuildSummary) {
        let outcome = match summary.status {
            BuildStatus::Success => "succeeded",
            BuildStatus::Failure => "failed",
            BuildStatus::Aborted => "was aborted",
            BuildStatus::Orphaned => "was orphaned",
            _ => "finished",
        };
        info!(
            build_id = %summary.build_id,
            job = %summary.job_name,
            number = summary.build_number,
            duration_ms = summary.duration_ms,
            failed_stage = summary.failed_stage.as_deref().unwrap_or(""),
            "build #{} of {} {}",
            summary.build_number,
            summary.job_name,
            outcome
        );
    }
}
