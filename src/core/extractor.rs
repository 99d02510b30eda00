//! 依序執行的偵測鏈，從（可能只載入一半的）頁面找出檔案 URL
//!
//! 依 [`ExtractionHeuristic`] 宣告順序執行，第一個命中者勝出。
//! 除了 `ClickTriggeredDownload` 以外都只讀取頁面。

use crate::core::delay::DelayRange;
use crate::domain::model::{ExtractionHeuristic, ResolvedArtifact};
use crate::domain::ports::{AcquisitionObserver, Locator, RenderedPage, StateQuery};
use crate::utils::error::{AcquireError, PageError, Result};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorSettings {
    /// 檔案 URL 的副檔名，不含點
    pub artifact_extension: String,
    pub probe_timeout: Duration,
    /// 在已可見的檢視器容器內尋找 iframe 的時間
    pub nested_probe_timeout: Duration,
    /// 單一偵測方式的時間上限，包含查詢與點擊後等待
    pub heuristic_timeout: Duration,
    pub click_settle: DelayRange,
    /// 啟用的偵測方式；不論列出順序，一律依優先順序執行
    pub heuristics: Vec<ExtractionHeuristic>,
    pub viewer_selectors: Vec<String>,
    pub link_keywords: Vec<String>,
    /// 含 `{id}` 的 URL 樣板，用於帶有 `"documentId"` 的頁面
    pub document_id_template: Option<String>,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            artifact_extension: "pdf".to_string(),
            probe_timeout: Duration::from_secs(5),
            nested_probe_timeout: Duration::from_secs(3),
            heuristic_timeout: Duration::from_secs(20),
            click_settle: DelayRange::new(2.0, 5.0),
            heuristics: ExtractionHeuristic::ALL.to_vec(),
            viewer_selectors: vec![
                ".document-viewer".to_string(),
                ".issuu-viewer".to_string(),
                "[class*=\"viewer\"]".to_string(),
            ],
            link_keywords: vec!["pdf".to_string(), "download".to_string()],
            document_id_template: None,
        }
    }
}

/// DOM 偵測用的元素查詢
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicLocators {
    pub direct_anchor: Locator,
    pub embedded_frame: Locator,
    pub download_control: Locator,
    pub viewer_container: Locator,
    pub viewer_frame: Locator,
}

impl HeuristicLocators {
    pub fn new(settings: &ExtractorSettings) -> Self {
        let ext = settings.artifact_extension.trim_start_matches('.');

        let download_control = Locator::css("button")
            .with_text("Download")
            .or(Locator::css("a").with_text(format!("Download {}", ext.to_uppercase())))
            .or(Locator::css("button[title*=\"download\" i]"))
            .or(Locator::css("button[aria-label*=\"download\" i]"));

        Self {
            direct_anchor: Locator::css(format!("a[href*=\".{}\"]", ext)),
            embedded_frame: Locator::css(format!("iframe[src*=\"{0}\"], embed[type*=\"{0}\"]", ext)),
            download_control,
            viewer_container: Locator::any_of(settings.viewer_selectors.iter().cloned()),
            viewer_frame: Locator::css("iframe"),
        }
    }
}

/// 全頁掃描時對頁面快照使用的樣式
#[derive(Debug, Clone)]
struct SnapshotPatterns {
    bare_url: Regex,
    document_id: Regex,
    data_url: Regex,
}

impl SnapshotPatterns {
    fn new(extension: &str) -> std::result::Result<Self, regex::Error> {
        let ext = regex::escape(extension.trim_start_matches('.'));
        let bare_url = format!(r#"(?i)https?://[^\s"'<>]+\.{}(?:\?[^\s"'<>]*)?"#, ext);
        Ok(Self {
            bare_url: Regex::new(&bare_url)?,
            document_id: Regex::new(r#""documentId"\s*:\s*"([^"]+)""#)?,
            data_url: Regex::new(r#"(?i)data-[a-z-]+url=["']([^"']+)["']"#)?,
        })
    }
}

pub struct LinkExtractor {
    settings: ExtractorSettings,
    locators: HeuristicLocators,
    patterns: SnapshotPatterns,
    enabled: Vec<ExtractionHeuristic>,
    observer: Arc<dyn AcquisitionObserver>,
}

impl LinkExtractor {
    pub fn new(settings: ExtractorSettings, observer: Arc<dyn AcquisitionObserver>) -> Result<Self> {
        let patterns = SnapshotPatterns::new(&settings.artifact_extension).map_err(|e| {
            AcquireError::InvalidConfigValueError {
                field: "extract.artifact_extension".to_string(),
                value: settings.artifact_extension.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut enabled = settings.heuristics.clone();
        enabled.sort();
        enabled.dedup();

        Ok(Self {
            locators: HeuristicLocators::new(&settings),
            patterns,
            enabled,
            settings,
            observer,
        })
    }

    pub fn enabled_heuristics(&self) -> &[ExtractionHeuristic] {
        &self.enabled
    }

    pub fn locators(&self) -> &HeuristicLocators {
        &self.locators
    }

    /// 對 `page` 執行偵測鏈；相對路徑以 `source` 為基準
    pub async fn extract(
        &self,
        page: &mut dyn RenderedPage,
        source: &Url,
    ) -> Option<ResolvedArtifact> {
        for &heuristic in &self.enabled {
            let attempt = tokio::time::timeout(
                self.settings.heuristic_timeout,
                self.run_heuristic(heuristic, page),
            )
            .await;

            let raw = match attempt {
                Ok(Ok(Some(raw))) => raw,
                Ok(Ok(None)) => {
                    tracing::debug!("{} found nothing", heuristic);
                    continue;
                }
                Ok(Err(e)) => {
                    self.observer.heuristic_failed(heuristic, &e);
                    continue;
                }
                Err(_) => {
                    let e = PageError::Transport(format!(
                        "heuristic exceeded {:?}",
                        self.settings.heuristic_timeout
                    ));
                    self.observer.heuristic_failed(heuristic, &e);
                    continue;
                }
            };

            match normalize_candidate(source, &raw) {
                Ok(url) => {
                    let artifact = ResolvedArtifact {
                        url,
                        discovered_by: heuristic,
                    };
                    self.observer.artifact_resolved(&artifact);
                    return Some(artifact);
                }
                Err(reason) => self.observer.candidate_rejected(heuristic, &raw, &reason),
            }
        }

        None
    }

    async fn run_heuristic(
        &self,
        heuristic: ExtractionHeuristic,
        page: &mut dyn RenderedPage,
    ) -> std::result::Result<Option<String>, PageError> {
        match heuristic {
            ExtractionHeuristic::DirectAnchor => {
                self.visible_attribute(page, &self.locators.direct_anchor, "href", self.settings.probe_timeout)
                    .await
            }
            ExtractionHeuristic::EmbeddedViewerFrame => {
                self.visible_attribute(page, &self.locators.embedded_frame, "src", self.settings.probe_timeout)
                    .await
            }
            ExtractionHeuristic::ClickTriggeredDownload => self.click_download_control(page).await,
            ExtractionHeuristic::ViewerContainerFrame => self.viewer_frame_source(page).await,
            ExtractionHeuristic::ScriptEvaluatedState => {
                let value = page.evaluate_script(StateQuery::ArtifactLocation).await?;
                Ok(value.as_ref().and_then(url_from_state))
            }
            ExtractionHeuristic::BroadLinkScan => self.broad_scan(page).await,
        }
    }

    async fn visible_attribute(
        &self,
        page: &dyn RenderedPage,
        locator: &Locator,
        attribute: &str,
        probe: Duration,
    ) -> std::result::Result<Option<String>, PageError> {
        let Some(element) = page.query_visible(locator, probe).await? else {
            return Ok(None);
        };
        let value = page.attribute(&element, attribute).await?;
        Ok(value.filter(|v| !v.trim().is_empty()))
    }

    async fn click_download_control(
        &self,
        page: &mut dyn RenderedPage,
    ) -> std::result::Result<Option<String>, PageError> {
        let Some(control) = page
            .query_visible(&self.locators.download_control, self.settings.probe_timeout)
            .await?
        else {
            return Ok(None);
        };

        tracing::info!("Download control found ({}), clicking", control.selector.css);
        page.click(&control).await?;

        let settle = self.settings.click_settle.sample();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        let address = page.current_address().await?;
        tracing::info!("Address after click: {}", address);
        Ok(Some(address).filter(|a| !a.trim().is_empty()))
    }

    async fn viewer_frame_source(&self, page: &dyn RenderedPage) -> std::result::Result<Option<String>, PageError> {
        let Some(container) = page
            .query_visible(&self.locators.viewer_container, self.settings.probe_timeout)
            .await?
        else {
            return Ok(None);
        };
        tracing::debug!("Viewer container found ({})", container.selector.css);

        // 只看第一個可見容器裡的 iframe
        let Some(frame) = page
            .query_visible_within(
                &container,
                &self.locators.viewer_frame,
                self.settings.nested_probe_timeout,
            )
            .await?
        else {
            return Ok(None);
        };
        let src = page.attribute(&frame, "src").await?;
        Ok(src.filter(|v| !v.trim().is_empty()))
    }

    async fn broad_scan(&self, page: &dyn RenderedPage) -> std::result::Result<Option<String>, PageError> {
        let links = match page.enumerate_links().await {
            Ok(links) => links,
            Err(e) => {
                self.observer
                    .heuristic_failed(ExtractionHeuristic::BroadLinkScan, &e);
                Vec::new()
            }
        };
        tracing::debug!("Scanning {} links", links.len());

        if let Some(href) = links.into_iter().find(|href| self.mentions_keyword(href)) {
            return Ok(Some(href));
        }

        let snapshot = page.content_snapshot().await?;
        Ok(self.scan_snapshot(&snapshot))
    }

    fn mentions_keyword(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.settings
            .link_keywords
            .iter()
            .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
    }

    /// DOM 找不到可用元素時的樣式掃描
    fn scan_snapshot(&self, snapshot: &str) -> Option<String> {
        if let Some(m) = self.patterns.bare_url.find(snapshot) {
            return Some(decode_entities(m.as_str()));
        }

        if let Some(template) = &self.settings.document_id_template {
            if let Some(caps) = self.patterns.document_id.captures(snapshot) {
                tracing::info!("Found documentId {}", &caps[1]);
                return Some(template.replace("{id}", &caps[1]));
            }
        }

        self.patterns
            .data_url
            .captures_iter(snapshot)
            .map(|caps| caps[1].to_string())
            .find(|url| self.mentions_keyword(url))
            .map(|url| decode_entities(&url))
    }
}

/// 接受字串，或帶有 `url` 字串的物件
fn url_from_state(value: &serde_json::Value) -> Option<String> {
    let candidate = match value {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) => map.get("url").and_then(|v| v.as_str()),
        _ => None,
    }?;
    let trimmed = candidate.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&amp;", "&")
}

/// 以來源頁面解析 `raw`，只保留 http(s)
pub fn normalize_candidate(source: &Url, raw: &str) -> std::result::Result<Url, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty candidate".to_string());
    }

    let resolved = source
        .join(trimmed)
        .map_err(|e| format!("cannot resolve against {}: {}", source, e))?;

    match resolved.scheme() {
        "http" | "https" => Ok(resolved),
        other => Err(format!("unsupported scheme '{}'", other)),
    }
}
