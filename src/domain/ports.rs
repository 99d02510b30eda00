use crate::domain::model::{
    AcquisitionReport, AttemptRecord, DownloadResult, ExtractionHeuristic, LoadStrategy,
    ResolvedArtifact, Target,
};
use crate::utils::error::{NavError, PageError, TransportFailure};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// [`Locator`] 的一個 CSS 候選，可再以可見文字縮小範圍
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    pub css: String,
    /// 元素文字必須包含的子字串（不分大小寫）
    pub text: Option<String>,
}

/// 元素查詢：在同一個期限內依序嘗試各候選
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    alternatives: Vec<Selector>,
}

impl Locator {
    pub fn css(css: impl Into<String>) -> Self {
        Self {
            alternatives: vec![Selector {
                css: css.into(),
                text: None,
            }],
        }
    }

    /// 把最後加入的候選限制為包含 `text` 的元素
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        if let Some(last) = self.alternatives.last_mut() {
            last.text = Some(text.into());
        }
        self
    }

    /// 每個 CSS 各自成為一個候選；空集合什麼都不會匹配
    pub fn any_of<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            alternatives: selectors
                .into_iter()
                .map(|css| Selector {
                    css: css.into(),
                    text: None,
                })
                .collect(),
        }
    }

    pub fn or(mut self, other: Locator) -> Self {
        self.alternatives.extend(other.alternatives);
        self
    }

    pub fn alternatives(&self) -> &[Selector] {
        &self.alternatives
    }
}

/// [`RenderedPage::query_visible`] 找到的元素參照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub selector: Selector,
    pub index: usize,
}

/// 具名的頁面狀態查詢，實際腳本由 adapter 決定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateQuery {
    /// 從連結、iframe 或頁面初始狀態取得檔案 URL
    ArtifactLocation,
}

#[async_trait]
pub trait RenderedPage: Send + Sync {
    async fn navigate(
        &mut self,
        url: &str,
        condition: LoadStrategy,
        deadline: Duration,
    ) -> std::result::Result<(), NavError>;

    /// `probe` 時間內沒有可見元素時回傳 `Ok(None)`
    async fn query_visible(
        &self,
        locator: &Locator,
        probe: Duration,
    ) -> std::result::Result<Option<ElementHandle>, PageError>;

    /// 同 `query_visible`，但只搜尋 `container` 的子孫元素
    async fn query_visible_within(
        &self,
        container: &ElementHandle,
        locator: &Locator,
        probe: Duration,
    ) -> std::result::Result<Option<ElementHandle>, PageError>;

    async fn attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> std::result::Result<Option<String>, PageError>;

    async fn click(&mut self, element: &ElementHandle) -> std::result::Result<(), PageError>;

    async fn current_address(&self) -> std::result::Result<String, PageError>;

    async fn evaluate_script(
        &self,
        query: StateQuery,
    ) -> std::result::Result<Option<serde_json::Value>, PageError>;

    /// 所有連結的原始 `href`，依文件順序
    async fn enumerate_links(&self) -> std::result::Result<Vec<String>, PageError>;

    /// 序列化後的 DOM，供樣式掃描
    async fn content_snapshot(&self) -> std::result::Result<String, PageError>;

    /// 釋放 session 及其擁有的資源
    async fn close(self: Box<Self>) -> std::result::Result<(), PageError>;
}

/// 每個 session 的瀏覽器身分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_agent: String,
}

/// 開啟獨立的渲染 session，不同嘗試之間不共用
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        identity: &SessionIdentity,
    ) -> std::result::Result<Box<dyn RenderedPage>, PageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, TransportFailure>>;

pub struct FetchResponse {
    pub status: u16,
    /// header 名稱一律小寫
    pub headers: HashMap<String, String>,
    pub body: ByteStream,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// 串流 GET，一次呼叫就是一次傳輸嘗試
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn stream_get(
        &self,
        request: FetchRequest,
    ) -> std::result::Result<FetchResponse, TransportFailure>;
}

pub trait DelayPolicy: Send + Sync {
    /// 每次嘗試前的等待
    fn pre_attempt_delay(&self) -> Duration;
    /// 失敗後到下一次嘗試之間的等待
    fn inter_attempt_backoff(&self) -> Duration;
}

pub trait IdentityPolicy: Send + Sync {
    fn user_agent(&self) -> String;
}

/// 單一導航步驟的結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    Loaded,
    TimedOut,
    Failed(String),
    /// 步驟開始前呼叫端的期限已到
    Skipped,
}

/// 供日誌與診斷使用的生命週期事件，預設不做任何事
pub trait AcquisitionObserver: Send + Sync {
    fn attempt_started(&self, _target: &Target, _attempt: u32, _max_attempts: u32) {}

    fn strategy_outcome(&self, _strategy: LoadStrategy, _outcome: &StrategyOutcome, _elapsed: Duration) {}

    fn heuristic_failed(&self, _heuristic: ExtractionHeuristic, _error: &PageError) {}

    fn candidate_rejected(&self, _heuristic: ExtractionHeuristic, _raw: &str, _reason: &str) {}

    fn artifact_resolved(&self, _artifact: &ResolvedArtifact) {}

    fn download_failed(&self, _url: &str, _reason: &str) {}

    fn download_finished(&self, _result: &DownloadResult, _elapsed: Duration) {}

    fn attempt_finished(&self, _record: &AttemptRecord) {}

    fn backing_off(&self, _delay: Duration) {}

    fn acquisition_finished(&self, _report: &AcquisitionReport) {}
}

/// 忽略所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AcquisitionObserver for NoopObserver {}
