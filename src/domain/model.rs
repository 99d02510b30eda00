use crate::utils::error::{AcquireError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// 一次擷取請求：文件所在頁面與輸出位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub source_url: Url,
    pub destination: PathBuf,
}

impl Target {
    pub fn new(source_url: &str, destination: impl Into<PathBuf>) -> Result<Self> {
        let parsed = Url::parse(source_url).map_err(|e| AcquireError::InvalidTargetError {
            message: format!("{}: {}", source_url, e),
        })?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AcquireError::InvalidTargetError {
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let destination = destination.into();
        if destination.as_os_str().is_empty() {
            return Err(AcquireError::InvalidTargetError {
                message: "destination path is empty".to_string(),
            });
        }

        Ok(Self {
            source_url: parsed,
            destination,
        })
    }
}

/// 頁面載入完成的條件，由快到慢
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// DOMContentLoaded 事件
    MinimalDom,
    /// window load 事件
    FullLoad,
    /// load 事件之後一小段時間沒有新的網路活動
    NetworkQuiescent,
}

impl LoadStrategy {
    pub const ALL: [LoadStrategy; 3] = [
        LoadStrategy::MinimalDom,
        LoadStrategy::FullLoad,
        LoadStrategy::NetworkQuiescent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::MinimalDom => "minimal_dom",
            LoadStrategy::FullLoad => "full_load",
            LoadStrategy::NetworkQuiescent => "network_quiescent",
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 載入策略與其導航期限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyStep {
    pub strategy: LoadStrategy,
    pub timeout: Duration,
}

impl StrategyStep {
    pub fn new(strategy: LoadStrategy, timeout: Duration) -> Self {
        Self { strategy, timeout }
    }
}

/// 檔案偵測方式，宣告順序即優先順序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionHeuristic {
    DirectAnchor,
    EmbeddedViewerFrame,
    ClickTriggeredDownload,
    ViewerContainerFrame,
    ScriptEvaluatedState,
    BroadLinkScan,
}

impl ExtractionHeuristic {
    pub const ALL: [ExtractionHeuristic; 6] = [
        ExtractionHeuristic::DirectAnchor,
        ExtractionHeuristic::EmbeddedViewerFrame,
        ExtractionHeuristic::ClickTriggeredDownload,
        ExtractionHeuristic::ViewerContainerFrame,
        ExtractionHeuristic::ScriptEvaluatedState,
        ExtractionHeuristic::BroadLinkScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionHeuristic::DirectAnchor => "direct_anchor",
            ExtractionHeuristic::EmbeddedViewerFrame => "embedded_viewer_frame",
            ExtractionHeuristic::ClickTriggeredDownload => "click_triggered_download",
            ExtractionHeuristic::ViewerContainerFrame => "viewer_container_frame",
            ExtractionHeuristic::ScriptEvaluatedState => "script_evaluated_state",
            ExtractionHeuristic::BroadLinkScan => "broad_link_scan",
        }
    }

    /// 唯一會改變頁面的方式
    pub fn has_side_effects(&self) -> bool {
        matches!(self, ExtractionHeuristic::ClickTriggeredDownload)
    }
}

impl fmt::Display for ExtractionHeuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedArtifact {
    pub url: Url,
    pub discovered_by: ExtractionHeuristic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResult {
    pub bytes_written: u64,
    pub destination: PathBuf,
}

/// 單次嘗試（或整個擷取）失敗的原因
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    #[error("page navigation timed out")]
    NavigationTimeout,
    #[error("page navigation failed")]
    NavigationError,
    #[error("no artifact link found with any load strategy")]
    ExtractionExhausted,
    #[error("download timed out")]
    TransportTimeout,
    #[error("download transport failed")]
    TransportError,
    #[error("download returned a non-success status")]
    HttpStatusError,
    #[error("writing the artifact failed")]
    IoError,
}

/// 重試迴圈中單次嘗試的診斷資訊
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub strategy_reached: Option<LoadStrategy>,
    pub extraction_outcome: Option<ResolvedArtifact>,
    pub download_outcome: Option<DownloadResult>,
    pub failure_kind: Option<FailureKind>,
    pub detail: Option<String>,
    pub elapsed: Duration,
}

impl AttemptRecord {
    pub fn new(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            started_at: Utc::now(),
            strategy_reached: None,
            extraction_outcome: None,
            download_outcome: None,
            failure_kind: None,
            detail: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.download_outcome.is_some() && self.failure_kind.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    pub outcome: std::result::Result<DownloadResult, FailureKind>,
    pub attempts: Vec<AttemptRecord>,
    pub elapsed: Duration,
}

impl AcquisitionReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_rejects_non_http_urls() {
        assert!(Target::new("https://example.com/doc", "out/doc.pdf").is_ok());
        assert!(Target::new("ftp://example.com/doc", "out/doc.pdf").is_err());
        assert!(Target::new("not a url", "out/doc.pdf").is_err());
        assert!(Target::new("https://example.com/doc", "").is_err());
    }

    #[test]
    fn test_heuristic_priority_follows_declaration_order() {
        let mut shuffled = vec![
            ExtractionHeuristic::BroadLinkScan,
            ExtractionHeuristic::DirectAnchor,
            ExtractionHeuristic::ScriptEvaluatedState,
            ExtractionHeuristic::ClickTriggeredDownload,
            ExtractionHeuristic::ViewerContainerFrame,
            ExtractionHeuristic::EmbeddedViewerFrame,
        ];
        shuffled.sort();
        assert_eq!(shuffled, ExtractionHeuristic::ALL.to_vec());
    }

    #[test]
    fn test_only_click_heuristic_has_side_effects() {
        let side_effecting: Vec<_> = ExtractionHeuristic::ALL
            .iter()
            .filter(|h| h.has_side_effects())
            .collect();
        assert_eq!(side_effecting, vec![&ExtractionHeuristic::ClickTriggeredDownload]);
    }

    #[test]
    fn test_strategy_serde_names() {
        let parsed: LoadStrategy = serde_json::from_str("\"network_quiescent\"").unwrap();
        assert_eq!(parsed, LoadStrategy::NetworkQuiescent);
        assert_eq!(LoadStrategy::MinimalDom.to_string(), "minimal_dom");
    }
}
