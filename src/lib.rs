pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliArgs;
pub use config::AcquireConfig;

#[cfg(feature = "browser")]
pub use adapters::chromium::{BrowserSettings, ChromiumSessions};
pub use adapters::http::ReqwestFetcher;
pub use core::orchestrator::{AcquireSettings, AcquisitionOrchestrator};
pub use domain::model::{AcquisitionReport, DownloadResult, FailureKind, Target};
pub use utils::error::{AcquireError, Result};
pub use utils::logger::TracingObserver;
