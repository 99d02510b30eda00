use crate::domain::model::FailureKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration parse error: {message}")]
    ConfigParseError { message: String },

    #[error("Invalid value for {field} ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid target: {message}")]
    InvalidTargetError { message: String },

    #[error("Browser setup failed: {message}")]
    BrowserError { message: String },
}

impl AcquireError {
    /// CLI 顯示用的修復建議
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            AcquireError::IoError(_) => "Check that the output directory is writable",
            AcquireError::ConfigParseError { .. } => "Make sure the config file is valid TOML",
            AcquireError::InvalidConfigValueError { .. } | AcquireError::MissingConfigError { .. } => {
                "Fix the configuration value mentioned above and retry"
            }
            AcquireError::InvalidTargetError { .. } => "Pass an absolute http(s) URL as the target",
            AcquireError::BrowserError { .. } => {
                "Install Chrome/Chromium or set browser.chrome_path in the config"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AcquireError>;

/// 渲染 session 回報的導航失敗
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavError {
    /// 未在時間內達成載入條件，頁面仍可能有部分 DOM
    #[error("navigation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("navigation failed: {0}")]
    Failed(String),
}

/// 與渲染 session 溝通時的非預期錯誤；找不到元素不算 `PageError`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("browser transport failed: {0}")]
    Transport(String),

    #[error("session already closed")]
    Closed,

    #[error("session could not be opened: {0}")]
    Launch(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("proxy failed: {0}")]
    Proxy(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<&NavError> for FailureKind {
    fn from(err: &NavError) -> Self {
        match err {
            NavError::Timeout { .. } => FailureKind::NavigationTimeout,
            NavError::Failed(_) => FailureKind::NavigationError,
        }
    }
}

impl From<&TransportFailure> for FailureKind {
    fn from(err: &TransportFailure) -> Self {
        match err {
            TransportFailure::Timeout(_) => FailureKind::TransportTimeout,
            TransportFailure::Connect(_)
            | TransportFailure::Proxy(_)
            | TransportFailure::Protocol(_) => FailureKind::TransportError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_classification() {
        assert_eq!(
            FailureKind::from(&TransportFailure::Timeout("slow".into())),
            FailureKind::TransportTimeout
        );
        assert_eq!(
            FailureKind::from(&TransportFailure::Proxy("refused".into())),
            FailureKind::TransportError
        );
        assert_eq!(
            FailureKind::from(&TransportFailure::Connect("reset".into())),
            FailureKind::TransportError
        );
    }

    #[test]
    fn test_nav_error_classification() {
        let timeout = NavError::Timeout {
            after: Duration::from_secs(1),
        };
        assert_eq!(FailureKind::from(&timeout), FailureKind::NavigationTimeout);
        assert_eq!(
            FailureKind::from(&NavError::Failed("net::ERR_NAME_NOT_RESOLVED".into())),
            FailureKind::NavigationError
        );
    }

    #[test]
    fn test_browser_error_suggests_chrome_path() {
        let err = AcquireError::BrowserError {
            message: "Chrome executable not found at /opt/chrome".into(),
        };
        assert!(err.to_string().contains("/opt/chrome"));
        assert!(err.recovery_suggestion().contains("browser.chrome_path"));
    }
}
