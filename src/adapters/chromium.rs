//! 透過 chromiumoxide 驅動真實 Chromium 的渲染 session
//!
//! 每個 session 啟動自己的瀏覽器行程，cookie、快取與指紋
//! 都不會在嘗試之間共用。

use crate::domain::model::LoadStrategy;
use crate::domain::ports::{
    ElementHandle, Locator, RenderedPage, SessionFactory, SessionIdentity, StateQuery,
};
use crate::utils::error::{AcquireError, NavError, PageError};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetTimezoneOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// 資源數維持不變這麼久才算網路閒置
const QUIET_WINDOW: Duration = Duration::from_millis(500);

const STEALTH_ARGS: [&str; 8] = [
    "--disable-blink-features=AutomationControlled",
    "--disable-infobars",
    "--disable-dev-shm-usage",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-background-networking",
    "--disable-sync",
    "--no-sandbox",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserSettings {
    pub headless: bool,
    pub disable_images: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub locale: String,
    pub timezone_id: String,
    pub proxy: Option<String>,
    /// 附加在內建參數之後的額外命令列參數
    pub args: Vec<String>,
    /// `None` 時自動偵測
    pub chrome_path: Option<PathBuf>,
    /// 頁面狀態查詢使用的副檔名
    pub artifact_extension: String,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            disable_images: true,
            viewport_width: 1920,
            viewport_height: 1080,
            locale: "en-US".to_string(),
            timezone_id: "America/New_York".to_string(),
            proxy: None,
            args: Vec::new(),
            chrome_path: None,
            artifact_extension: "pdf".to_string(),
        }
    }
}

impl BrowserSettings {
    fn launch_config(&self, identity: &SessionIdentity) -> Result<BrowserConfig, PageError> {
        let mut builder = BrowserConfig::builder().viewport(Some(Viewport {
            width: self.viewport_width,
            height: self.viewport_height,
            device_scale_factor: Some(1.0),
            ..Default::default()
        }));

        if let Some(path) = &self.chrome_path {
            builder = builder.chrome_executable(path);
        }
        // with_head 代表「不要」headless
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }
        if self.disable_images {
            builder = builder.arg("--blink-settings=imagesEnabled=false");
        }

        builder = builder
            .args(STEALTH_ARGS)
            .arg(format!("--window-size={},{}", self.viewport_width, self.viewport_height))
            .arg(format!("--lang={}", self.locale))
            .arg(format!("--user-agent={}", identity.user_agent));
        for arg in &self.args {
            builder = builder.arg(arg);
        }

        builder.build().map_err(PageError::Launch)
    }
}

/// 每個 session 啟動一個瀏覽器
#[derive(Debug, Clone, Default)]
pub struct ChromiumSessions {
    settings: BrowserSettings,
}

impl ChromiumSessions {
    /// 指定的 Chrome 執行檔不存在時直接回報，不等到第一次啟動才失敗
    pub fn new(settings: BrowserSettings) -> crate::utils::error::Result<Self> {
        if let Some(path) = &settings.chrome_path {
            if !path.is_file() {
                return Err(AcquireError::BrowserError {
                    message: format!("Chrome executable not found at {}", path.display()),
                });
            }
        }
        Ok(Self { settings })
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessions {
    async fn open(&self, identity: &SessionIdentity) -> Result<Box<dyn RenderedPage>, PageError> {
        let config = self.settings.launch_config(identity)?;

        tracing::info!("Launching browser (headless={})", self.settings.headless);
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| PageError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match prepare_page(&browser, identity, &self.settings).await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler_task.abort();
                return Err(e);
            }
        };

        Ok(Box::new(ChromiumPage {
            browser,
            page,
            handler_task,
            artifact_extension: self.settings.artifact_extension.clone(),
        }))
    }
}

async fn prepare_page(
    browser: &Browser,
    identity: &SessionIdentity,
    settings: &BrowserSettings,
) -> Result<Page, PageError> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| PageError::Launch(e.to_string()))?;

    page.execute(SetUserAgentOverrideParams::new(identity.user_agent.clone()))
        .await
        .map_err(|e| PageError::Launch(e.to_string()))?;

    if let Err(e) = page
        .execute(SetTimezoneOverrideParams::new(settings.timezone_id.clone()))
        .await
    {
        tracing::warn!("Timezone override {} rejected: {}", settings.timezone_id, e);
    }

    Ok(page)
}

pub struct ChromiumPage {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    artifact_extension: String,
}

impl ChromiumPage {
    /// handler 任務結束代表瀏覽器已經斷線
    fn ensure_alive(&self) -> Result<(), PageError> {
        if self.handler_task.is_finished() {
            return Err(PageError::Closed);
        }
        Ok(())
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T, PageError> {
        self.ensure_alive()?;
        self.page
            .evaluate(script)
            .await
            .map_err(|e| PageError::Transport(e.to_string()))?
            .into_value()
            .map_err(|e| PageError::Evaluation(format!("{:?}", e)))
    }

    /// 文件目前是否滿足 `condition`；錯誤視為尚未滿足
    async fn load_state(&self) -> Option<(String, u64)> {
        self.eval::<serde_json::Value>(
            "({ state: document.readyState, resources: performance.getEntriesByType('resource').length })"
                .to_string(),
        )
        .await
        .ok()
        .and_then(|v| {
            let state = v.get("state")?.as_str()?.to_string();
            let resources = v.get("resources")?.as_u64()?;
            Some((state, resources))
        })
    }

    async fn wait_for(&self, condition: LoadStrategy) {
        let mut last_resources = None;
        let mut quiet_since: Option<Instant> = None;

        loop {
            if let Some((state, resources)) = self.load_state().await {
                let reached = match condition {
                    LoadStrategy::MinimalDom => state == "interactive" || state == "complete",
                    LoadStrategy::FullLoad => state == "complete",
                    LoadStrategy::NetworkQuiescent => {
                        if state == "complete" && last_resources == Some(resources) {
                            let since = *quiet_since.get_or_insert_with(Instant::now);
                            since.elapsed() >= QUIET_WINDOW
                        } else {
                            quiet_since = None;
                            false
                        }
                    }
                };
                if reached {
                    return;
                }
                last_resources = Some(resources);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// 反覆執行查詢腳本直到找到可見元素或 `probe` 用完
    async fn poll_visible(
        &self,
        locator: &Locator,
        script: String,
        probe: Duration,
    ) -> Result<Option<ElementHandle>, PageError> {
        let started = Instant::now();

        loop {
            let found: Option<serde_json::Value> = self.eval(script.clone()).await?;
            if let Some(found) = found {
                let alternative = found.get("alternative").and_then(|v| v.as_u64());
                let index = found.get("index").and_then(|v| v.as_u64());
                if let (Some(alternative), Some(index)) = (alternative, index) {
                    if let Some(selector) = locator.alternatives().get(alternative as usize) {
                        return Ok(Some(ElementHandle {
                            selector: selector.clone(),
                            index: index as usize,
                        }));
                    }
                }
            }
            if started.elapsed() >= probe {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(probe)).await;
        }
    }

    fn element_script(element: &ElementHandle, body: &str) -> String {
        format!(
            "(() => {{ const el = document.querySelectorAll({css})[{index}]; if (!el) return null; {body} }})()",
            css = json!(element.selector.css),
            index = element.index,
            body = body,
        )
    }
}

/// `scope` 為 `Some` 時只在該元素的子孫中搜尋；回傳的 index 一律以整份文件計算
fn visible_query_script(locator: &Locator, scope: Option<&ElementHandle>) -> String {
    let alternatives: Vec<_> = locator
        .alternatives()
        .iter()
        .map(|s| json!({ "css": s.css, "text": s.text }))
        .collect();

    let root = match scope {
        Some(scope) => format!(
            "document.querySelectorAll({})[{}]",
            json!(scope.selector.css),
            scope.index
        ),
        None => "document".to_string(),
    };

    format!(
        r#"(() => {{
            const root = {root};
            if (!root) return null;
            const alternatives = {alternatives};
            const visible = (el) => {{
                const rect = el.getBoundingClientRect();
                const style = window.getComputedStyle(el);
                return rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden' && style.display !== 'none';
            }};
            for (let a = 0; a < alternatives.length; a++) {{
                const alt = alternatives[a];
                let nodes;
                try {{ nodes = root.querySelectorAll(alt.css); }} catch (_) {{ continue; }}
                for (let i = 0; i < nodes.length; i++) {{
                    const el = nodes[i];
                    if (alt.text) {{
                        const text = (el.innerText || el.textContent || '').toLowerCase();
                        if (!text.includes(alt.text.toLowerCase())) continue;
                    }}
                    if (visible(el)) {{
                        const index = Array.prototype.indexOf.call(document.querySelectorAll(alt.css), el);
                        return {{ alternative: a, index }};
                    }}
                }}
            }}
            return null;
        }})()"#,
        root = root,
        alternatives = serde_json::Value::Array(alternatives),
    )
}

fn artifact_location_script(extension: &str) -> String {
    format!(
        r#"(() => {{
            const ext = {ext};
            const anchors = Array.from(document.querySelectorAll('a[href]'));
            const hit = anchors.find(a => a.href.includes('.' + ext));
            if (hit) return hit.href;
            for (const frame of Array.from(document.querySelectorAll('iframe, embed'))) {{
                if (frame.src && (frame.src.includes(ext) || frame.src.includes('document'))) return frame.src;
            }}
            const state = window.__INITIAL_STATE__;
            if (state && state.document && state.document.url) return {{ url: state.document.url }};
            return null;
        }})()"#,
        ext = json!(extension),
    )
}

#[async_trait]
impl RenderedPage for ChromiumPage {
    async fn navigate(
        &mut self,
        url: &str,
        condition: LoadStrategy,
        deadline: Duration,
    ) -> Result<(), NavError> {
        self.ensure_alive()
            .map_err(|e| NavError::Failed(e.to_string()))?;
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(NavError::Failed)?;

        let navigation = async {
            let response = self
                .page
                .execute(params)
                .await
                .map_err(|e| NavError::Failed(e.to_string()))?;
            if let Some(error) = response.result.error_text.clone() {
                return Err(NavError::Failed(error));
            }
            self.wait_for(condition).await;
            Ok(())
        };

        match tokio::time::timeout(deadline, navigation).await {
            Ok(result) => result,
            Err(_) => Err(NavError::Timeout { after: deadline }),
        }
    }

    async fn query_visible(
        &self,
        locator: &Locator,
        probe: Duration,
    ) -> Result<Option<ElementHandle>, PageError> {
        self.poll_visible(locator, visible_query_script(locator, None), probe)
            .await
    }

    async fn query_visible_within(
        &self,
        container: &ElementHandle,
        locator: &Locator,
        probe: Duration,
    ) -> Result<Option<ElementHandle>, PageError> {
        self.poll_visible(locator, visible_query_script(locator, Some(container)), probe)
            .await
    }

    async fn attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, PageError> {
        let body = format!("return el.getAttribute({});", json!(name));
        self.eval(Self::element_script(element, &body)).await
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<(), PageError> {
        let clicked: Option<bool> = self
            .eval(Self::element_script(element, "el.click(); return true;"))
            .await?;
        match clicked {
            Some(true) => Ok(()),
            _ => Err(PageError::Evaluation(format!(
                "element {} #{} is gone",
                element.selector.css, element.index
            ))),
        }
    }

    async fn current_address(&self) -> Result<String, PageError> {
        self.ensure_alive()?;
        self.page
            .url()
            .await
            .map_err(|e| PageError::Transport(e.to_string()))?
            .ok_or_else(|| PageError::Evaluation("page has no address".to_string()))
    }

    async fn evaluate_script(
        &self,
        query: StateQuery,
    ) -> Result<Option<serde_json::Value>, PageError> {
        let script = match query {
            StateQuery::ArtifactLocation => artifact_location_script(&self.artifact_extension),
        };
        let value: serde_json::Value = self.eval(script).await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn enumerate_links(&self) -> Result<Vec<String>, PageError> {
        self.eval(
            "Array.from(document.querySelectorAll('a[href]')).map(a => a.getAttribute('href'))"
                .to_string(),
        )
        .await
    }

    async fn content_snapshot(&self) -> Result<String, PageError> {
        self.ensure_alive()?;
        self.page
            .content()
            .await
            .map_err(|e| PageError::Transport(e.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), PageError> {
        let ChromiumPage {
            mut browser,
            page,
            handler_task,
            ..
        } = *self;

        if let Err(e) = page.close().await {
            tracing::debug!("Page close failed: {}", e);
        }
        let closed = browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| PageError::Transport(e.to_string()));
        let _ = browser.wait().await;
        handler_task.abort();
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_script_embeds_escaped_selectors() {
        let locator = Locator::css("a[href*=\".pdf\"]").or(Locator::css("button").with_text("Download"));
        let script = visible_query_script(&locator, None);
        assert!(script.contains(r#""css":"a[href*=\".pdf\"]""#));
        assert!(script.contains(r#""text":"Download""#));
        assert!(script.contains("const root = document;"));
    }

    #[test]
    fn test_scoped_query_starts_from_container() {
        let container = ElementHandle {
            selector: crate::domain::ports::Selector {
                css: ".document-viewer".to_string(),
                text: None,
            },
            index: 2,
        };
        let script = visible_query_script(&Locator::css("iframe"), Some(&container));
        assert!(script.contains(r#"const root = document.querySelectorAll(".document-viewer")[2];"#));
        assert!(script.contains("if (!root) return null;"));
    }

    #[test]
    fn test_missing_chrome_path_is_browser_error() {
        let settings = BrowserSettings {
            chrome_path: Some(PathBuf::from("/nonexistent/bin/chromium")),
            ..BrowserSettings::default()
        };
        assert!(matches!(
            ChromiumSessions::new(settings),
            Err(AcquireError::BrowserError { .. })
        ));
        assert!(ChromiumSessions::new(BrowserSettings::default()).is_ok());
    }

    #[test]
    fn test_state_script_uses_configured_extension() {
        let script = artifact_location_script("epub");
        assert!(script.contains(r#"const ext = "epub";"#));
        assert!(script.contains("__INITIAL_STATE__"));
    }

    #[tokio::test]
    #[ignore] // 需要安裝 Chrome/Chromium
    async fn test_open_navigate_and_close() {
        let sessions = ChromiumSessions::default();
        let identity = SessionIdentity {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".to_string(),
        };
        let mut page = sessions.open(&identity).await.unwrap();

        page.navigate(
            "data:text/html,<a href='/files/a.pdf'>report</a>",
            LoadStrategy::FullLoad,
            Duration::from_secs(20),
        )
        .await
        .unwrap();

        let links = page.enumerate_links().await.unwrap();
        assert_eq!(links, vec!["/files/a.pdf".to_string()]);
        page.close().await.unwrap();
    }
}
