#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "browser")]
use crate::adapters::chromium::BrowserSettings;
use crate::core::delay::{DelayRange, UniformDelayPolicy};
use crate::core::downloader::DownloadSettings;
use crate::core::extractor::ExtractorSettings;
use crate::core::identity::{RotatingIdentity, DEFAULT_USER_AGENTS};
use crate::core::orchestrator::AcquireSettings;
use crate::domain::model::{ExtractionHeuristic, LoadStrategy, StrategyStep};
use crate::utils::error::{AcquireError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROXY_SCHEMES: [&str; 4] = ["http", "https", "socks5", "socks5h"];

/// 完整的擷取配置。每個欄位都有預設值，空檔案也合法
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AcquireConfig {
    pub retry: RetryConfig,
    pub load: LoadConfig,
    pub extract: ExtractConfig,
    pub download: DownloadConfig,
    pub browser: BrowserConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub pre_attempt_delay: DelayRange,
    pub backoff: DelayRange,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pre_attempt_delay: DelayRange::new(2.0, 5.0),
            backoff: DelayRange::new(5.0, 10.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy: LoadStrategy,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// 依列出順序嘗試
    pub strategies: Vec<StrategyConfig>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            strategies: LoadStrategy::ALL
                .iter()
                .map(|strategy| StrategyConfig {
                    strategy: *strategy,
                    timeout_ms: 60_000,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub artifact_extension: String,
    pub probe_timeout_ms: u64,
    pub nested_probe_timeout_ms: u64,
    pub heuristic_timeout_ms: u64,
    pub click_settle: DelayRange,
    pub heuristics: Vec<ExtractionHeuristic>,
    pub viewer_selectors: Vec<String>,
    pub link_keywords: Vec<String>,
    pub document_id_template: Option<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        let defaults = ExtractorSettings::default();
        Self {
            artifact_extension: defaults.artifact_extension,
            probe_timeout_ms: millis(defaults.probe_timeout),
            nested_probe_timeout_ms: millis(defaults.nested_probe_timeout),
            heuristic_timeout_ms: millis(defaults.heuristic_timeout),
            click_settle: defaults.click_settle,
            heuristics: defaults.heuristics,
            viewer_selectors: defaults.viewer_selectors,
            link_keywords: defaults.link_keywords,
            document_id_template: defaults.document_id_template,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub timeout_ms: u64,
    /// 也會交給瀏覽器使用
    pub proxy: Option<String>,
    pub accept: String,
    pub accept_language: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let defaults = DownloadSettings::default();
        Self {
            timeout_ms: millis(defaults.timeout),
            proxy: defaults.proxy,
            accept: defaults.accept,
            accept_language: defaults.accept_language,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub disable_images: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub locale: String,
    pub timezone_id: String,
    pub args: Vec<String>,
    pub chrome_path: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            disable_images: true,
            viewport_width: 1920,
            viewport_height: 1080,
            locale: "en-US".to_string(),
            timezone_id: "America/New_York".to_string(),
            args: Vec::new(),
            chrome_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_agents: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| AcquireError::InvalidConfigValueError {
            field: name.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AcquireError::InvalidConfigValueError {
            field: name.to_string(),
            value: raw.to_string(),
            reason: "Expected true/false".to_string(),
        }),
    }
}

impl AcquireConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置，`${VAR}` 以行程環境變數替換
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::from_toml_str_with(content, |name| std::env::var(name).ok())
    }

    pub fn from_toml_str_with(
        content: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let processed = substitute_env_vars(content, &lookup)?;

        toml::from_str(&processed).map_err(|e| AcquireError::ConfigParseError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 套用環境變數覆蓋；未設定或空值不改動
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(proxy) = get("HTTP_PROXY") {
            self.download.proxy = Some(proxy.trim().to_string());
        }
        if let Some(raw) = get("PAGE_LOAD_TIMEOUT") {
            let timeout_ms: u64 = parse_env("PAGE_LOAD_TIMEOUT", &raw)?;
            for step in &mut self.load.strategies {
                step.timeout_ms = timeout_ms;
            }
            self.download.timeout_ms = timeout_ms;
        }
        if let Some(raw) = get("MAX_RETRIES") {
            self.retry.max_attempts = parse_env("MAX_RETRIES", &raw)?;
        }
        // 同一組延遲用在導覽前與點擊後
        if let Some(raw) = get("MIN_DELAY") {
            let min: f64 = parse_env("MIN_DELAY", &raw)?;
            self.retry.pre_attempt_delay.min_secs = min;
            self.extract.click_settle.min_secs = min;
        }
        if let Some(raw) = get("MAX_DELAY") {
            let max: f64 = parse_env("MAX_DELAY", &raw)?;
            self.retry.pre_attempt_delay.max_secs = max;
            self.extract.click_settle.max_secs = max;
        }
        if let Some(raw) = get("HEADLESS") {
            self.browser.headless = parse_flag("HEADLESS", &raw)?;
        }
        if let Some(raw) = get("DISABLE_IMAGES") {
            self.browser.disable_images = parse_flag("DISABLE_IMAGES", &raw)?;
        }
        if let Some(raw) = get("VIEWPORT_WIDTH") {
            self.browser.viewport_width = parse_env("VIEWPORT_WIDTH", &raw)?;
        }
        if let Some(raw) = get("VIEWPORT_HEIGHT") {
            self.browser.viewport_height = parse_env("VIEWPORT_HEIGHT", &raw)?;
        }
        if let Some(timezone) = get("TIMEZONE_ID") {
            self.browser.timezone_id = timezone.trim().to_string();
        }
        if let Some(locale) = get("LOCALE") {
            self.browser.locale = locale.trim().to_string();
        }

        Ok(())
    }

    pub fn steps(&self) -> Vec<StrategyStep> {
        self.load
            .strategies
            .iter()
            .map(|s| StrategyStep::new(s.strategy, Duration::from_millis(s.timeout_ms)))
            .collect()
    }

    pub fn extractor_settings(&self) -> ExtractorSettings {
        ExtractorSettings {
            artifact_extension: self.extract.artifact_extension.clone(),
            probe_timeout: Duration::from_millis(self.extract.probe_timeout_ms),
            nested_probe_timeout: Duration::from_millis(self.extract.nested_probe_timeout_ms),
            heuristic_timeout: Duration::from_millis(self.extract.heuristic_timeout_ms),
            click_settle: self.extract.click_settle,
            heuristics: self.extract.heuristics.clone(),
            viewer_selectors: self.extract.viewer_selectors.clone(),
            link_keywords: self.extract.link_keywords.clone(),
            document_id_template: self.extract.document_id_template.clone(),
        }
    }

    pub fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            timeout: Duration::from_millis(self.download.timeout_ms),
            proxy: self.download.proxy.clone(),
            accept: self.download.accept.clone(),
            accept_language: self.download.accept_language.clone(),
        }
    }

    pub fn acquire_settings(&self) -> AcquireSettings {
        AcquireSettings {
            steps: self.steps(),
            extractor: self.extractor_settings(),
            download: self.download_settings(),
        }
    }

    pub fn delay_policy(&self) -> UniformDelayPolicy {
        UniformDelayPolicy::new(self.retry.pre_attempt_delay, self.retry.backoff)
    }

    pub fn identity_policy(&self) -> RotatingIdentity {
        RotatingIdentity::new(self.identity.user_agents.clone())
    }

    #[cfg(feature = "browser")]
    pub fn browser_settings(&self) -> BrowserSettings {
        BrowserSettings {
            headless: self.browser.headless,
            disable_images: self.browser.disable_images,
            viewport_width: self.browser.viewport_width,
            viewport_height: self.browser.viewport_height,
            locale: self.browser.locale.clone(),
            timezone_id: self.browser.timezone_id.clone(),
            proxy: self.download.proxy.clone(),
            args: self.browser.args.clone(),
            chrome_path: self.browser.chrome_path.clone(),
            artifact_extension: self.extract.artifact_extension.clone(),
        }
    }
}

/// 替換環境變數 (例如 ${HTTP_PROXY})，未設定的保留原文
fn substitute_env_vars(content: &str, lookup: &impl Fn(&str) -> Option<String>) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| AcquireError::ConfigParseError {
        message: e.to_string(),
    })?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        lookup(var_name).unwrap_or_else(|| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}

impl Validate for AcquireConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_positive_number(
            "retry.max_attempts",
            u64::from(self.retry.max_attempts),
            1,
        )?;
        validation::validate_delay_range("retry.pre_attempt_delay", &self.retry.pre_attempt_delay)?;
        validation::validate_delay_range("retry.backoff", &self.retry.backoff)?;

        validation::validate_non_empty_list("load.strategies", &self.load.strategies)?;
        for step in &self.load.strategies {
            validation::validate_positive_number(
                &format!("load.strategies.{}.timeout_ms", step.strategy),
                step.timeout_ms,
                1,
            )?;
        }

        validation::validate_non_empty_string(
            "extract.artifact_extension",
            &self.extract.artifact_extension,
        )?;
        validation::validate_positive_number("extract.probe_timeout_ms", self.extract.probe_timeout_ms, 1)?;
        validation::validate_positive_number(
            "extract.nested_probe_timeout_ms",
            self.extract.nested_probe_timeout_ms,
            1,
        )?;
        validation::validate_positive_number(
            "extract.heuristic_timeout_ms",
            self.extract.heuristic_timeout_ms,
            self.extract.probe_timeout_ms,
        )?;
        validation::validate_delay_range("extract.click_settle", &self.extract.click_settle)?;
        validation::validate_non_empty_list("extract.heuristics", &self.extract.heuristics)?;
        if let Some(template) = &self.extract.document_id_template {
            if !template.contains("{id}") {
                return Err(AcquireError::InvalidConfigValueError {
                    field: "extract.document_id_template".to_string(),
                    value: template.clone(),
                    reason: "Template must contain an {id} placeholder".to_string(),
                });
            }
        }

        validation::validate_positive_number("download.timeout_ms", self.download.timeout_ms, 1)?;
        if let Some(proxy) = &self.download.proxy {
            validation::validate_url("download.proxy", proxy, &PROXY_SCHEMES)?;
        }

        validation::validate_range("browser.viewport_width", self.browser.viewport_width, 1, 10_000)?;
        validation::validate_range("browser.viewport_height", self.browser.viewport_height, 1, 10_000)?;
        if let Some(path) = &self.browser.chrome_path {
            validation::validate_path("browser.chrome_path", &path.to_string_lossy())?;
        }

        validation::validate_non_empty_list("identity.user_agents", &self.identity.user_agents)?;
        for agent in &self.identity.user_agents {
            validation::validate_non_empty_string("identity.user_agents", agent)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = AcquireConfig::from_toml_str_with("", env(&[])).unwrap();

        assert_eq!(config, AcquireConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.load.strategies.len(), 3);
        assert_eq!(config.identity.user_agents.len(), 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parses_sections_and_substitutes_variables() {
        let toml = r#"
            [retry]
            max_attempts = 5
            backoff = { min_secs = 1, max_secs = 2.5 }

            [load]
            strategies = [
                { strategy = "full_load", timeout_ms = 15000 },
                { strategy = "network_quiescent", timeout_ms = 30000 },
            ]

            [extract]
            heuristics = ["broad_link_scan", "direct_anchor"]
            document_id_template = "https://api.example.com/document/{id}"

            [download]
            proxy = "${TEST_PROXY}"
        "#;

        let config =
            AcquireConfig::from_toml_str_with(toml, env(&[("TEST_PROXY", "http://10.0.0.1:3128")]))
                .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff, DelayRange::new(1.0, 2.5));
        assert_eq!(
            config.steps(),
            vec![
                StrategyStep::new(LoadStrategy::FullLoad, Duration::from_secs(15)),
                StrategyStep::new(LoadStrategy::NetworkQuiescent, Duration::from_secs(30)),
            ]
        );
        assert_eq!(config.download.proxy.as_deref(), Some("http://10.0.0.1:3128"));
        assert_eq!(config.extract.heuristics.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let config =
            AcquireConfig::from_toml_str_with(include_str!("../../acquire.example.toml"), env(&[]))
                .unwrap();

        assert_eq!(config, AcquireConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_variables_are_kept_literally() {
        let config = AcquireConfig::from_toml_str_with(
            "[browser]\nlocale = \"${NOT_SET_ANYWHERE}\"",
            env(&[]),
        )
        .unwrap();
        assert_eq!(config.browser.locale, "${NOT_SET_ANYWHERE}");
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = AcquireConfig::from_toml_str_with("[retry\nmax_attempts = ", env(&[])).unwrap_err();
        assert!(matches!(err, AcquireError::ConfigParseError { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AcquireConfig::default();
        config
            .apply_env_overrides(env(&[
                ("HTTP_PROXY", "http://proxy:8080"),
                ("PAGE_LOAD_TIMEOUT", "45000"),
                ("MAX_RETRIES", "5"),
                ("MIN_DELAY", "1"),
                ("MAX_DELAY", "3"),
                ("HEADLESS", "false"),
                ("DISABLE_IMAGES", "0"),
                ("VIEWPORT_WIDTH", "1280"),
                ("TIMEZONE_ID", "Europe/Berlin"),
                ("LOCALE", ""),
            ]))
            .unwrap();

        assert_eq!(config.download.proxy.as_deref(), Some("http://proxy:8080"));
        assert!(config.load.strategies.iter().all(|s| s.timeout_ms == 45_000));
        assert_eq!(config.download.timeout_ms, 45_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.pre_attempt_delay, DelayRange::new(1.0, 3.0));
        assert_eq!(config.extract.click_settle, DelayRange::new(1.0, 3.0));
        assert!(!config.browser.headless);
        assert!(!config.browser.disable_images);
        assert_eq!(config.browser.viewport_width, 1280);
        assert_eq!(config.browser.viewport_height, 1080);
        assert_eq!(config.browser.timezone_id, "Europe/Berlin");
        // 空字串視為未設定
        assert_eq!(config.browser.locale, "en-US");
    }

    #[test]
    fn test_bad_env_value_names_the_variable() {
        let mut config = AcquireConfig::default();
        let err = config
            .apply_env_overrides(env(&[("MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(err, AcquireError::InvalidConfigValueError { field, .. } if field == "MAX_RETRIES"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AcquireConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AcquireConfig::default();
        config.load.strategies.clear();
        assert!(matches!(
            config.validate(),
            Err(AcquireError::MissingConfigError { .. })
        ));

        let mut config = AcquireConfig::default();
        config.retry.pre_attempt_delay = DelayRange::new(5.0, 2.0);
        assert!(config.validate().is_err());

        let mut config = AcquireConfig::default();
        config.retry.backoff = DelayRange::new(1e20, 1e20);
        assert!(config.validate().is_err());

        let mut config = AcquireConfig::default();
        config.download.proxy = Some("ftp://proxy".to_string());
        assert!(config.validate().is_err());

        let mut config = AcquireConfig::default();
        config.extract.document_id_template = Some("https://api.example.com/doc".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let config = AcquireConfig::default();
        let settings = config.acquire_settings();

        assert_eq!(settings.extractor, ExtractorSettings::default());
        assert_eq!(settings.download, DownloadSettings::default());
        assert_eq!(settings.steps[0].strategy, LoadStrategy::MinimalDom);
        assert_eq!(settings.steps[0].timeout, Duration::from_secs(60));
        assert_eq!(config.delay_policy(), UniformDelayPolicy::default());
    }
}
