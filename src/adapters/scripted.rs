//! 以腳本描述行為的記憶體內 session 與 fetcher
//!
//! 供測試與沒有瀏覽器的離線執行使用

use crate::domain::model::LoadStrategy;
use crate::domain::ports::{
    ByteStream, DelayPolicy, ElementHandle, FetchRequest, FetchResponse, HttpFetcher, Locator,
    RenderedPage, SessionFactory, SessionIdentity, StateQuery,
};
use crate::utils::error::{NavError, PageError, TransportFailure};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavOutcome {
    Loaded,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone)]
struct ScriptedElement {
    locator: Locator,
    /// 所在容器的 locator，`None` 代表直接在文件中
    parent: Option<Locator>,
    attributes: HashMap<String, String>,
}

/// 描述頁面內容與載入方式
#[derive(Debug, Clone)]
pub struct PageFixture {
    address: String,
    elements: Vec<ScriptedElement>,
    failing_queries: Vec<Locator>,
    slow_queries: Vec<(Locator, Duration)>,
    state: Option<serde_json::Value>,
    state_error: Option<String>,
    links: Vec<String>,
    snapshot: String,
    click_target: Option<String>,
    navigation: HashMap<LoadStrategy, NavOutcome>,
    navigation_latency: Duration,
    reveal_after: usize,
    crashed: bool,
}

impl PageFixture {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            elements: Vec::new(),
            failing_queries: Vec::new(),
            slow_queries: Vec::new(),
            state: None,
            state_error: None,
            links: Vec::new(),
            snapshot: String::new(),
            click_target: None,
            navigation: HashMap::new(),
            navigation_latency: Duration::ZERO,
            reveal_after: 0,
            crashed: false,
        }
    }

    /// 只被此 locator 匹配的可見元素
    pub fn element(mut self, locator: Locator, attributes: &[(&str, &str)]) -> Self {
        self.push_element(None, locator, attributes)
    }

    /// 只存在於 `parent` 容器內的元素
    pub fn element_within(
        self,
        parent: Locator,
        locator: Locator,
        attributes: &[(&str, &str)],
    ) -> Self {
        self.push_element(Some(parent), locator, attributes)
    }

    fn push_element(
        mut self,
        parent: Option<Locator>,
        locator: Locator,
        attributes: &[(&str, &str)],
    ) -> Self {
        self.elements.push(ScriptedElement {
            locator,
            parent,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        self
    }

    pub fn failing_query(mut self, locator: Locator) -> Self {
        self.failing_queries.push(locator);
        self
    }

    /// 查詢此 locator 前先等待 `latency`
    pub fn slow_query(mut self, locator: Locator, latency: Duration) -> Self {
        self.slow_queries.push((locator, latency));
        self
    }

    pub fn state(mut self, value: serde_json::Value) -> Self {
        self.state = Some(value);
        self
    }

    pub fn state_error(mut self, message: impl Into<String>) -> Self {
        self.state_error = Some(message.into());
        self
    }

    pub fn links(mut self, links: &[&str]) -> Self {
        self.links = links.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn snapshot(mut self, html: impl Into<String>) -> Self {
        self.snapshot = html.into();
        self
    }

    /// 點擊後頁面回報的網址
    pub fn click_leads_to(mut self, address: impl Into<String>) -> Self {
        self.click_target = Some(address.into());
        self
    }

    /// 指定策略的結果；未指定者視為載入成功
    pub fn navigation(mut self, strategy: LoadStrategy, outcome: NavOutcome) -> Self {
        self.navigation.insert(strategy, outcome);
        self
    }

    /// 每次導航耗時；超過導航期限即逾時
    pub fn navigation_latency(mut self, latency: Duration) -> Self {
        self.navigation_latency = latency;
        self
    }

    /// 瀏覽器已經掛掉：所有操作都回報 session 已關閉
    pub fn crashed(mut self) -> Self {
        self.crashed = true;
        self
    }

    /// 導航 `navigations` 次之前內容都不可見
    pub fn reveal_after(mut self, navigations: usize) -> Self {
        self.reveal_after = navigations;
        self
    }
}

/// 頁面收到的操作紀錄，透過 [`ScriptedPage::log`] 共享
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageLog {
    pub navigations: Vec<LoadStrategy>,
    pub queries: Vec<Locator>,
    pub clicks: usize,
    pub evaluations: usize,
    pub closed: bool,
}

pub struct ScriptedPage {
    fixture: PageFixture,
    address: String,
    log: Arc<Mutex<PageLog>>,
}

impl ScriptedPage {
    pub fn new(fixture: PageFixture) -> Self {
        Self {
            address: fixture.address.clone(),
            fixture,
            log: Arc::new(Mutex::new(PageLog::default())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<PageLog>> {
        self.log.clone()
    }

    fn revealed(&self) -> bool {
        lock(&self.log).navigations.len() >= self.fixture.reveal_after
    }

    fn alive(&self) -> Result<(), PageError> {
        if self.fixture.crashed {
            return Err(PageError::Closed);
        }
        Ok(())
    }

    /// 共用的查詢流程；`scope` 為 `Some` 時只看該容器內的元素
    async fn query(
        &self,
        locator: &Locator,
        scope: Option<&Locator>,
    ) -> Result<Option<ElementHandle>, PageError> {
        lock(&self.log).queries.push(locator.clone());
        self.alive()?;

        if let Some((_, latency)) = self.fixture.slow_queries.iter().find(|(l, _)| l == locator) {
            tokio::time::sleep(*latency).await;
        }
        if self.fixture.failing_queries.contains(locator) {
            return Err(PageError::Evaluation(format!(
                "query failed for {:?}",
                locator.alternatives()
            )));
        }
        if !self.revealed() {
            return Ok(None);
        }

        Ok(self
            .fixture
            .elements
            .iter()
            .position(|e| &e.locator == locator && (scope.is_none() || e.parent.as_ref() == scope))
            .map(|index| ElementHandle {
                selector: locator.alternatives()[0].clone(),
                index,
            }))
    }
}

#[async_trait]
impl RenderedPage for ScriptedPage {
    async fn navigate(
        &mut self,
        _url: &str,
        condition: LoadStrategy,
        deadline: Duration,
    ) -> Result<(), NavError> {
        lock(&self.log).navigations.push(condition);
        if self.fixture.crashed {
            return Err(NavError::Failed(PageError::Closed.to_string()));
        }

        let latency = self.fixture.navigation_latency;
        if latency > deadline {
            tokio::time::sleep(deadline).await;
            return Err(NavError::Timeout { after: deadline });
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self
            .fixture
            .navigation
            .get(&condition)
            .copied()
            .unwrap_or(NavOutcome::Loaded)
        {
            NavOutcome::Loaded => Ok(()),
            NavOutcome::TimedOut => Err(NavError::Timeout { after: deadline }),
            NavOutcome::Failed => Err(NavError::Failed("net::ERR_CONNECTION_RESET".to_string())),
        }
    }

    async fn query_visible(
        &self,
        locator: &Locator,
        _probe: Duration,
    ) -> Result<Option<ElementHandle>, PageError> {
        self.query(locator, None).await
    }

    async fn query_visible_within(
        &self,
        container: &ElementHandle,
        locator: &Locator,
        _probe: Duration,
    ) -> Result<Option<ElementHandle>, PageError> {
        let scope = self
            .fixture
            .elements
            .get(container.index)
            .map(|e| e.locator.clone())
            .ok_or_else(|| PageError::Evaluation("stale element handle".to_string()))?;
        self.query(locator, Some(&scope)).await
    }

    async fn attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, PageError> {
        let scripted = self
            .fixture
            .elements
            .get(element.index)
            .ok_or_else(|| PageError::Evaluation("stale element handle".to_string()))?;
        Ok(scripted.attributes.get(name).cloned())
    }

    async fn click(&mut self, _element: &ElementHandle) -> Result<(), PageError> {
        lock(&self.log).clicks += 1;
        if let Some(target) = &self.fixture.click_target {
            self.address = target.clone();
        }
        Ok(())
    }

    async fn current_address(&self) -> Result<String, PageError> {
        self.alive()?;
        Ok(self.address.clone())
    }

    async fn evaluate_script(
        &self,
        _query: StateQuery,
    ) -> Result<Option<serde_json::Value>, PageError> {
        lock(&self.log).evaluations += 1;
        self.alive()?;
        if let Some(message) = &self.fixture.state_error {
            return Err(PageError::Evaluation(message.clone()));
        }
        if !self.revealed() {
            return Ok(None);
        }
        Ok(self.fixture.state.clone())
    }

    async fn enumerate_links(&self) -> Result<Vec<String>, PageError> {
        self.alive()?;
        if !self.revealed() {
            return Ok(Vec::new());
        }
        Ok(self.fixture.links.clone())
    }

    async fn content_snapshot(&self) -> Result<String, PageError> {
        self.alive()?;
        if !self.revealed() {
            return Ok(String::new());
        }
        Ok(self.fixture.snapshot.clone())
    }

    async fn close(self: Box<Self>) -> Result<(), PageError> {
        lock(&self.log).closed = true;
        Ok(())
    }
}

/// [`ScriptedSessions`] 開出的一個 session
#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub identity: SessionIdentity,
    pub log: Arc<Mutex<PageLog>>,
}

/// 每個 session 都是新的 [`ScriptedPage`]；第 n 個 session 使用第 n 個
/// fixture，用完後重複最後一個
pub struct ScriptedSessions {
    fixtures: Vec<PageFixture>,
    open_failure: Option<PageError>,
    opened: Mutex<Vec<OpenedSession>>,
}

impl ScriptedSessions {
    pub fn new(fixture: PageFixture) -> Self {
        Self::sequence(vec![fixture])
    }

    pub fn sequence(fixtures: Vec<PageFixture>) -> Self {
        Self {
            fixtures,
            open_failure: None,
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: PageError) -> Self {
        Self {
            fixtures: Vec::new(),
            open_failure: Some(error),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn sessions(&self) -> Vec<OpenedSession> {
        lock(&self.opened).clone()
    }

    pub fn opened(&self) -> usize {
        lock(&self.opened).len()
    }

    pub fn closed(&self) -> usize {
        lock(&self.opened)
            .iter()
            .filter(|s| lock(&s.log).closed)
            .count()
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessions {
    async fn open(&self, identity: &SessionIdentity) -> Result<Box<dyn RenderedPage>, PageError> {
        if let Some(error) = &self.open_failure {
            return Err(error.clone());
        }

        let mut opened = lock(&self.opened);
        let fixture = self
            .fixtures
            .get(opened.len())
            .or_else(|| self.fixtures.last())
            .cloned()
            .ok_or_else(|| PageError::Launch("no page fixture scripted".to_string()))?;

        let page = ScriptedPage::new(fixture);
        opened.push(OpenedSession {
            identity: identity.clone(),
            log: page.log(),
        });
        Ok(Box::new(page))
    }
}

#[derive(Debug, Clone)]
pub enum StaticReply {
    Body {
        status: u16,
        headers: Vec<(String, String)>,
        chunks: Vec<Vec<u8>>,
    },
    /// 回應 200，內容在 `chunks` 之後中斷
    Interrupted {
        chunks: Vec<Vec<u8>>,
        failure: TransportFailure,
    },
    /// 回應 200，內容永遠不會送出
    Stalled,
    /// 完全沒有回應
    Refused(TransportFailure),
}

impl StaticReply {
    pub fn ok(body: Vec<u8>) -> Self {
        Self::chunked(200, vec![body])
    }

    pub fn status(status: u16) -> Self {
        Self::chunked(status, vec![b"error".to_vec()])
    }

    pub fn chunked(status: u16, chunks: Vec<Vec<u8>>) -> Self {
        let length: usize = chunks.iter().map(Vec::len).sum();
        Self::Body {
            status,
            headers: vec![("content-length".to_string(), length.to_string())],
            chunks,
        }
    }
}

fn chunk_stream(chunks: Vec<Vec<u8>>) -> impl futures::Stream<Item = Result<Bytes, TransportFailure>> {
    futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
}

/// 依序回應；用完後重複最後一個
pub struct StaticFetcher {
    replies: Mutex<VecDeque<StaticReply>>,
    last: Mutex<Option<StaticReply>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl StaticFetcher {
    pub fn new(replies: Vec<StaticReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        lock(&self.requests).clone()
    }

    fn next_reply(&self) -> Option<StaticReply> {
        let mut last = lock(&self.last);
        if let Some(reply) = lock(&self.replies).pop_front() {
            *last = Some(reply);
        }
        last.clone()
    }
}

#[async_trait]
impl HttpFetcher for StaticFetcher {
    async fn stream_get(&self, request: FetchRequest) -> Result<FetchResponse, TransportFailure> {
        lock(&self.requests).push(request);

        let reply = self
            .next_reply()
            .ok_or_else(|| TransportFailure::Connect("no reply scripted".to_string()))?;

        let (status, headers, body): (u16, Vec<(String, String)>, ByteStream) = match reply {
            StaticReply::Body {
                status,
                headers,
                chunks,
            } => (status, headers, chunk_stream(chunks).boxed()),
            StaticReply::Interrupted { chunks, failure } => (
                200,
                Vec::new(),
                chunk_stream(chunks)
                    .chain(futures::stream::once(async move { Err(failure) }))
                    .boxed(),
            ),
            StaticReply::Stalled => (200, Vec::new(), futures::stream::pending().boxed()),
            StaticReply::Refused(failure) => return Err(failure),
        };

        Ok(FetchResponse {
            status,
            headers: headers.into_iter().collect(),
            body,
        })
    }
}

/// 不等待，只計算被呼叫的次數
#[derive(Debug, Default)]
pub struct CountingDelays {
    pre_attempt: AtomicU32,
    backoff: AtomicU32,
}

impl CountingDelays {
    pub fn pre_attempts(&self) -> u32 {
        self.pre_attempt.load(Ordering::SeqCst)
    }

    pub fn backoffs(&self) -> u32 {
        self.backoff.load(Ordering::SeqCst)
    }
}

impl DelayPolicy for CountingDelays {
    fn pre_attempt_delay(&self) -> Duration {
        self.pre_attempt.fetch_add(1, Ordering::SeqCst);
        Duration::ZERO
    }

    fn inter_attempt_backoff(&self) -> Duration {
        self.backoff.fetch_add(1, Ordering::SeqCst);
        Duration::ZERO
    }
}
