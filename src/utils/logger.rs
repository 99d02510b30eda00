use crate::domain::model::{
    AcquisitionReport, AttemptRecord, DownloadResult, ExtractionHeuristic, LoadStrategy,
    ResolvedArtifact, Target,
};
use crate::domain::ports::{AcquisitionObserver, StrategyOutcome};
use crate::utils::error::PageError;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_cli_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("artifact_acquire=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("artifact_acquire=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// 預設 observer：把每個生命週期事件轉成 `tracing` 事件
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl AcquisitionObserver for TracingObserver {
    fn attempt_started(&self, target: &Target, attempt: u32, max_attempts: u32) {
        tracing::info!(
            "🚀 Attempt {}/{} for {}",
            attempt,
            max_attempts,
            target.source_url
        );
    }

    fn strategy_outcome(&self, strategy: LoadStrategy, outcome: &StrategyOutcome, elapsed: Duration) {
        match outcome {
            StrategyOutcome::Loaded => tracing::info!("✅ {} loaded in {:?}", strategy, elapsed),
            StrategyOutcome::TimedOut => {
                tracing::warn!("⏰ {} timed out after {:?}, probing partial page", strategy, elapsed)
            }
            StrategyOutcome::Failed(reason) => {
                tracing::warn!("❌ {} failed: {}", strategy, reason)
            }
            StrategyOutcome::Skipped => tracing::warn!("⏭️ {} skipped, deadline reached", strategy),
        }
    }

    fn heuristic_failed(&self, heuristic: ExtractionHeuristic, error: &PageError) {
        tracing::debug!("{} failed: {}", heuristic, error);
    }

    fn candidate_rejected(&self, heuristic: ExtractionHeuristic, raw: &str, reason: &str) {
        tracing::debug!("{} candidate '{}' rejected: {}", heuristic, raw, reason);
    }

    fn artifact_resolved(&self, artifact: &ResolvedArtifact) {
        tracing::info!("🔗 Found artifact via {}: {}", artifact.discovered_by, artifact.url);
    }

    fn download_failed(&self, url: &str, reason: &str) {
        tracing::warn!("❌ Download of {} failed: {}", url, reason);
    }

    fn download_finished(&self, result: &DownloadResult, elapsed: Duration) {
        tracing::info!(
            "📁 Saved {} bytes to {} in {:?}",
            result.bytes_written,
            result.destination.display(),
            elapsed
        );
    }

    fn attempt_finished(&self, record: &AttemptRecord) {
        match record.failure_kind {
            None => tracing::debug!("Attempt {} succeeded", record.attempt_number),
            Some(kind) => tracing::warn!(
                "Attempt {} failed: {}{}",
                record.attempt_number,
                kind,
                record
                    .detail
                    .as_ref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            ),
        }
    }

    fn backing_off(&self, delay: Duration) {
        tracing::info!("⏳ Retrying in {:.1}s", delay.as_secs_f64());
    }

    fn acquisition_finished(&self, report: &AcquisitionReport) {
        match &report.outcome {
            Ok(result) => tracing::info!(
                "✅ Acquired {} after {} attempt(s)",
                result.destination.display(),
                report.attempts.len()
            ),
            Err(kind) => tracing::error!(
                "❌ Acquisition failed after {} attempt(s): {}",
                report.attempts.len(),
                kind
            ),
        }
    }
}
