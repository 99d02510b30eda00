pub mod delay;
pub mod downloader;
pub mod escalator;
pub mod extractor;
pub mod identity;
pub mod orchestrator;

pub use crate::domain::model::{AcquisitionReport, DownloadResult, FailureKind, Target};
pub use crate::domain::ports::{HttpFetcher, RenderedPage, SessionFactory};
pub use crate::utils::error::Result;
