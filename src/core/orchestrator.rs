use crate::core::downloader::{part_path, DownloadContext, DownloadSettings, Downloader};
use crate::core::escalator::LoadEscalator;
use crate::core::extractor::{ExtractorSettings, LinkExtractor};
use crate::domain::model::{
    AcquisitionReport, AttemptRecord, DownloadResult, FailureKind, LoadStrategy, StrategyStep,
    Target,
};
use crate::domain::ports::{
    AcquisitionObserver, DelayPolicy, HttpFetcher, IdentityPolicy, RenderedPage, SessionFactory,
    SessionIdentity,
};
use crate::utils::error::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// 重試迴圈除了協作者以外需要的設定
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireSettings {
    pub steps: Vec<StrategyStep>,
    pub extractor: ExtractorSettings,
    pub download: DownloadSettings,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            steps: LoadStrategy::ALL
                .iter()
                .map(|s| StrategyStep::new(*s, Duration::from_secs(60)))
                .collect(),
            extractor: ExtractorSettings::default(),
            download: DownloadSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Delaying,
    LoadingAndExtracting,
    Downloading,
}

impl Stage {
    /// 期限在此階段到期時對應的失敗種類
    fn timeout_kind(self) -> FailureKind {
        match self {
            Stage::Delaying | Stage::LoadingAndExtracting => FailureKind::NavigationTimeout,
            Stage::Downloading => FailureKind::TransportTimeout,
        }
    }
}

/// 包住載入升級與下載的重試迴圈，不保存單次擷取的狀態
pub struct AcquisitionOrchestrator<S, H> {
    sessions: S,
    fetcher: H,
    steps: Vec<StrategyStep>,
    extractor: LinkExtractor,
    escalator: LoadEscalator,
    downloader: Downloader,
    identity: Arc<dyn IdentityPolicy>,
    observer: Arc<dyn AcquisitionObserver>,
}

impl<S: SessionFactory, H: HttpFetcher> AcquisitionOrchestrator<S, H> {
    pub fn new(
        sessions: S,
        fetcher: H,
        settings: AcquireSettings,
        identity: Arc<dyn IdentityPolicy>,
        observer: Arc<dyn AcquisitionObserver>,
    ) -> Result<Self> {
        Ok(Self {
            extractor: LinkExtractor::new(settings.extractor, observer.clone())?,
            escalator: LoadEscalator::new(observer.clone()),
            downloader: Downloader::new(settings.download, observer.clone()),
            steps: settings.steps,
            sessions,
            fetcher,
            identity,
            observer,
        })
    }

    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    pub fn fetcher(&self) -> &H {
        &self.fetcher
    }

    pub async fn acquire(
        &self,
        target: &Target,
        max_attempts: u32,
        delays: &dyn DelayPolicy,
    ) -> std::result::Result<DownloadResult, FailureKind> {
        self.run(target, max_attempts, delays, None).await.outcome
    }

    /// 同 [`acquire`](Self::acquire)，但不會超過 `deadline`
    pub async fn acquire_until(
        &self,
        target: &Target,
        max_attempts: u32,
        delays: &dyn DelayPolicy,
        deadline: Instant,
    ) -> std::result::Result<DownloadResult, FailureKind> {
        self.run(target, max_attempts, delays, Some(deadline))
            .await
            .outcome
    }

    /// 完整重試迴圈；報告中每次嘗試一筆紀錄
    pub async fn run(
        &self,
        target: &Target,
        max_attempts: u32,
        delays: &dyn DelayPolicy,
        deadline: Option<Instant>,
    ) -> AcquisitionReport {
        let started = Instant::now();
        let max_attempts = max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut last_failure = FailureKind::ExtractionExhausted;

        for attempt_number in 1..=max_attempts {
            self.observer.attempt_started(target, attempt_number, max_attempts);

            let mut record = AttemptRecord::new(attempt_number);
            let attempt_started = Instant::now();
            let outcome = self.attempt(target, &mut record, delays, deadline).await;
            record.elapsed = attempt_started.elapsed();

            match &outcome {
                Ok(result) => record.download_outcome = Some(result.clone()),
                Err(kind) => record.failure_kind = Some(*kind),
            }
            self.observer.attempt_finished(&record);
            attempts.push(record);

            match outcome {
                Ok(result) => return self.finish(Ok(result), attempts, started),
                Err(kind) => last_failure = kind,
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!("⏰ Deadline reached after attempt {}", attempt_number);
                break;
            }

            if attempt_number < max_attempts {
                let backoff = delays.inter_attempt_backoff();
                self.observer.backing_off(backoff);
                if within(deadline, tokio::time::sleep(backoff)).await.is_none() {
                    break;
                }
            }
        }

        self.finish(Err(last_failure), attempts, started)
    }

    fn finish(
        &self,
        outcome: std::result::Result<DownloadResult, FailureKind>,
        attempts: Vec<AttemptRecord>,
        started: Instant,
    ) -> AcquisitionReport {
        let report = AcquisitionReport {
            outcome,
            attempts,
            elapsed: started.elapsed(),
        };
        self.observer.acquisition_finished(&report);
        report
    }

    async fn attempt(
        &self,
        target: &Target,
        record: &mut AttemptRecord,
        delays: &dyn DelayPolicy,
        deadline: Option<Instant>,
    ) -> std::result::Result<DownloadResult, FailureKind> {
        let pause = delays.pre_attempt_delay();
        if !pause.is_zero() {
            tracing::debug!("Waiting {:?} before attempt {}", pause, record.attempt_number);
            if within(deadline, tokio::time::sleep(pause)).await.is_none() {
                record.detail = Some("deadline expired while delaying".to_string());
                return Err(Stage::Delaying.timeout_kind());
            }
        }

        let identity = SessionIdentity {
            user_agent: self.identity.user_agent(),
        };
        let mut page = match within(deadline, self.sessions.open(&identity)).await {
            Some(Ok(page)) => page,
            Some(Err(e)) => {
                record.detail = Some(e.to_string());
                return Err(FailureKind::NavigationError);
            }
            None => {
                record.detail = Some("deadline expired while opening a session".to_string());
                return Err(Stage::LoadingAndExtracting.timeout_kind());
            }
        };

        let mut stage = Stage::LoadingAndExtracting;
        let outcome = within(
            deadline,
            self.load_and_download(page.as_mut(), target, &identity, record, &mut stage, deadline),
        )
        .await;

        // 無論成功、失敗或逾時都要關閉 session
        match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, page.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Closing session failed: {}", e),
            Err(_) => tracing::warn!("Closing session timed out"),
        }

        match outcome {
            Some(result) => result,
            None => {
                record.detail = Some("overall deadline expired".to_string());
                if stage == Stage::Downloading {
                    let _ = tokio::fs::remove_file(part_path(&target.destination)).await;
                }
                Err(stage.timeout_kind())
            }
        }
    }

    async fn load_and_download(
        &self,
        page: &mut dyn RenderedPage,
        target: &Target,
        identity: &SessionIdentity,
        record: &mut AttemptRecord,
        stage: &mut Stage,
        deadline: Option<Instant>,
    ) -> std::result::Result<DownloadResult, FailureKind> {
        let escalation = self
            .escalator
            .escalate(page, &target.source_url, &self.steps, &self.extractor, deadline)
            .await;
        record.strategy_reached = escalation.reached;

        let artifact = match escalation.result {
            Ok(artifact) => artifact,
            Err(kind) => {
                record.detail = escalation.detail;
                return Err(kind);
            }
        };
        record.extraction_outcome = Some(artifact.clone());

        *stage = Stage::Downloading;
        let context = DownloadContext::for_source(identity.user_agent.clone(), &target.source_url);
        self.downloader
            .fetch(&artifact, &target.destination, &self.fetcher, &context)
            .await
    }
}

/// `future` 完成前 `deadline` 已過則回傳 `None`
async fn within<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::{
        CountingDelays, NavOutcome, PageFixture, ScriptedSessions, StaticFetcher, StaticReply,
    };
    use crate::core::delay::DelayRange;
    use crate::core::identity::FixedIdentity;
    use crate::domain::ports::NoopObserver;
    use crate::utils::error::PageError;
    use tempfile::TempDir;

    const SOURCE: &str = "https://docs.example.com/library/report";

    fn settings() -> AcquireSettings {
        let mut settings = AcquireSettings::default();
        settings.steps = LoadStrategy::ALL
            .iter()
            .map(|s| StrategyStep::new(*s, Duration::from_millis(200)))
            .collect();
        settings.extractor.click_settle = DelayRange::ZERO;
        settings.extractor.probe_timeout = Duration::from_millis(20);
        settings.extractor.nested_probe_timeout = Duration::from_millis(20);
        settings.download.timeout = Duration::from_secs(5);
        settings
    }

    fn orchestrator(
        sessions: ScriptedSessions,
        fetcher: StaticFetcher,
    ) -> AcquisitionOrchestrator<ScriptedSessions, StaticFetcher> {
        AcquisitionOrchestrator::new(
            sessions,
            fetcher,
            settings(),
            Arc::new(FixedIdentity("agent/1.0".into())),
            Arc::new(NoopObserver),
        )
        .unwrap()
    }

    fn anchor_page() -> PageFixture {
        PageFixture::new(SOURCE).links(&["/files/report.pdf"])
    }

    #[tokio::test]
    async fn test_session_is_closed_after_success_and_failure() {
        let temp_dir = TempDir::new().unwrap();
        let target = Target::new(SOURCE, temp_dir.path().join("r.pdf")).unwrap();
        let orchestrator = orchestrator(
            ScriptedSessions::new(anchor_page()),
            StaticFetcher::new(vec![StaticReply::status(500), StaticReply::ok(b"ok".to_vec())]),
        );

        let result = orchestrator.acquire(&target, 3, &CountingDelays::default()).await;

        assert!(result.is_ok());
        assert_eq!(orchestrator.sessions().opened(), 2);
        assert_eq!(orchestrator.sessions().closed(), 2);
    }

    #[tokio::test]
    async fn test_open_failure_is_navigation_error() {
        let temp_dir = TempDir::new().unwrap();
        let target = Target::new(SOURCE, temp_dir.path().join("r.pdf")).unwrap();
        let orchestrator = orchestrator(
            ScriptedSessions::failing(PageError::Launch("no browser".into())),
            StaticFetcher::new(Vec::new()),
        );

        let report = orchestrator
            .run(&target, 2, &CountingDelays::default(), None)
            .await;

        assert_eq!(report.outcome, Err(FailureKind::NavigationError));
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(
            report.attempts[0].detail.as_deref(),
            Some("session could not be opened: no browser")
        );
        assert!(orchestrator.fetcher().requests().is_empty());
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let temp_dir = TempDir::new().unwrap();
        let target = Target::new(SOURCE, temp_dir.path().join("r.pdf")).unwrap();
        let orchestrator = orchestrator(
            ScriptedSessions::new(PageFixture::new(SOURCE)),
            StaticFetcher::new(Vec::new()),
        );
        let delays = CountingDelays::default();

        let report = orchestrator.run(&target, 0, &delays, None).await;

        assert_eq!(report.outcome, Err(FailureKind::ExtractionExhausted));
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(delays.backoffs(), 0);
    }

    #[tokio::test]
    async fn test_deadline_during_navigation_is_navigation_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let target = Target::new(SOURCE, temp_dir.path().join("r.pdf")).unwrap();
        let slow = PageFixture::new(SOURCE).navigation_latency(Duration::from_secs(30));
        let orchestrator = orchestrator(ScriptedSessions::new(slow), StaticFetcher::new(Vec::new()));

        let deadline = Instant::now() + Duration::from_millis(100);
        let report = orchestrator
            .run(&target, 3, &CountingDelays::default(), Some(deadline))
            .await;

        assert_eq!(report.outcome, Err(FailureKind::NavigationTimeout));
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(orchestrator.sessions().closed(), 1);
    }

    #[tokio::test]
    async fn test_deadline_during_download_is_transport_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let destination = temp_dir.path().join("r.pdf");
        let target = Target::new(SOURCE, &destination).unwrap();
        let orchestrator = orchestrator(
            ScriptedSessions::new(anchor_page()),
            StaticFetcher::new(vec![StaticReply::Stalled]),
        );

        let deadline = Instant::now() + Duration::from_millis(300);
        let report = orchestrator
            .run(&target, 3, &CountingDelays::default(), Some(deadline))
            .await;

        assert_eq!(report.outcome, Err(FailureKind::TransportTimeout));
        assert_eq!(report.attempts.len(), 1);
        assert!(!destination.exists());
        assert!(!part_path(&destination).exists());
        assert_eq!(orchestrator.sessions().closed(), 1);
    }

    #[tokio::test]
    async fn test_attempt_record_tracks_progress() {
        let temp_dir = TempDir::new().unwrap();
        let target = Target::new(SOURCE, temp_dir.path().join("r.pdf")).unwrap();
        let page = anchor_page().navigation(LoadStrategy::MinimalDom, NavOutcome::Failed);
        let orchestrator = orchestrator(
            ScriptedSessions::new(page),
            StaticFetcher::new(vec![StaticReply::ok(b"%PDF".to_vec())]),
        );

        let report = orchestrator
            .run(&target, 1, &CountingDelays::default(), None)
            .await;

        let record = &report.attempts[0];
        assert!(record.succeeded());
        assert_eq!(record.strategy_reached, Some(LoadStrategy::FullLoad));
        assert_eq!(
            record.extraction_outcome.as_ref().unwrap().url.as_str(),
            "https://docs.example.com/files/report.pdf"
        );
        assert_eq!(record.download_outcome.as_ref().unwrap().bytes_written, 4);
    }
}
