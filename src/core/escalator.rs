use crate::core::extractor::LinkExtractor;
use crate::domain::model::{FailureKind, LoadStrategy, ResolvedArtifact, StrategyStep};
use crate::domain::ports::{AcquisitionObserver, RenderedPage, StrategyOutcome};
use crate::utils::error::NavError;
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

/// 走過一次策略清單的結果
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    /// 最後一個實際導航過的策略
    pub reached: Option<LoadStrategy>,
    pub result: Result<ResolvedArtifact, FailureKind>,
    pub detail: Option<String>,
}

/// 由快到慢嘗試載入策略，每次載入後都執行偵測
pub struct LoadEscalator {
    observer: Arc<dyn AcquisitionObserver>,
}

impl LoadEscalator {
    pub fn new(observer: Arc<dyn AcquisitionObserver>) -> Self {
        Self { observer }
    }

    pub async fn load(
        &self,
        page: &mut dyn RenderedPage,
        source: &Url,
        steps: &[StrategyStep],
        extractor: &LinkExtractor,
    ) -> Result<ResolvedArtifact, FailureKind> {
        self.escalate(page, source, steps, extractor, None).await.result
    }

    /// 有 `deadline` 時，導航時間會被截到期限內
    pub async fn escalate(
        &self,
        page: &mut dyn RenderedPage,
        source: &Url,
        steps: &[StrategyStep],
        extractor: &LinkExtractor,
        deadline: Option<Instant>,
    ) -> Escalation {
        let mut reached = None;
        let mut any_loaded = false;
        let mut last_detail = None;

        for (index, step) in steps.iter().enumerate() {
            let is_last = index + 1 == steps.len();

            let budget = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.observer.strategy_outcome(
                            step.strategy,
                            &StrategyOutcome::Skipped,
                            std::time::Duration::ZERO,
                        );
                        return Escalation {
                            reached,
                            result: Err(FailureKind::NavigationTimeout),
                            detail: Some("overall deadline expired".to_string()),
                        };
                    }
                    step.timeout.min(remaining)
                }
                None => step.timeout,
            };

            tracing::info!("Loading {} with {} ({:?})", source, step.strategy, budget);
            let started = Instant::now();
            let navigation = page.navigate(source.as_str(), step.strategy, budget).await;
            reached = Some(step.strategy);

            let outcome = match &navigation {
                Ok(()) => StrategyOutcome::Loaded,
                Err(NavError::Timeout { .. }) => StrategyOutcome::TimedOut,
                Err(NavError::Failed(reason)) => StrategyOutcome::Failed(reason.clone()),
            };
            self.observer
                .strategy_outcome(step.strategy, &outcome, started.elapsed());

            match navigation {
                Ok(()) => any_loaded = true,
                // 逾時的頁面可能已經有部分 DOM，照樣嘗試擷取
                Err(NavError::Timeout { .. }) => {}
                Err(NavError::Failed(reason)) => {
                    if is_last {
                        return Escalation {
                            reached,
                            result: Err(FailureKind::NavigationError),
                            detail: Some(reason),
                        };
                    }
                    last_detail = Some(reason);
                    continue;
                }
            }

            if let Some(artifact) = extractor.extract(page, source).await {
                return Escalation {
                    reached,
                    result: Ok(artifact),
                    detail: None,
                };
            }
            tracing::debug!("No artifact after {}", step.strategy);
        }

        let (kind, detail) = if any_loaded || reached.is_none() {
            (FailureKind::ExtractionExhausted, None)
        } else {
            (FailureKind::NavigationTimeout, last_detail)
        };

        Escalation {
            reached,
            result: Err(kind),
            detail,
        }
    }
}
