use crate::domain::model::{DownloadResult, FailureKind, ResolvedArtifact};
use crate::domain::ports::{AcquisitionObserver, FetchRequest, FetchResponse, HttpFetcher};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    /// 整次傳輸的期限，包含 header 與內容
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub accept: String,
    pub accept_language: String,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            proxy: None,
            accept: "application/pdf,*/*".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
        }
    }
}

/// 與找到檔案的渲染 session 共用的請求身分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadContext {
    pub user_agent: String,
    pub referer: String,
}

impl DownloadContext {
    /// Referer 為找到檔案的頁面來源（origin）
    pub fn for_source(user_agent: impl Into<String>, source: &Url) -> Self {
        Self {
            user_agent: user_agent.into(),
            referer: format!("{}/", source.origin().ascii_serialization()),
        }
    }
}

/// 單次串流下載，重試由 orchestrator 負責
pub struct Downloader {
    settings: DownloadSettings,
    observer: Arc<dyn AcquisitionObserver>,
}

type WriteFailure = (FailureKind, String);

impl Downloader {
    pub fn new(settings: DownloadSettings, observer: Arc<dyn AcquisitionObserver>) -> Self {
        Self { settings, observer }
    }

    pub fn request_for(&self, artifact: &ResolvedArtifact, context: &DownloadContext) -> FetchRequest {
        FetchRequest {
            url: artifact.url.to_string(),
            headers: vec![
                ("User-Agent".to_string(), context.user_agent.clone()),
                ("Accept".to_string(), self.settings.accept.clone()),
                ("Accept-Language".to_string(), self.settings.accept_language.clone()),
                ("Referer".to_string(), context.referer.clone()),
            ],
            proxy: self.settings.proxy.clone(),
            timeout: self.settings.timeout,
        }
    }

    pub async fn fetch(
        &self,
        artifact: &ResolvedArtifact,
        destination: &Path,
        fetcher: &dyn HttpFetcher,
        context: &DownloadContext,
    ) -> Result<DownloadResult, FailureKind> {
        let started = Instant::now();
        let url = artifact.url.as_str();
        tracing::info!("📥 Downloading {} -> {}", url, destination.display());

        let request = self.request_for(artifact, context);
        let response = match tokio::time::timeout(self.settings.timeout, fetcher.stream_get(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(failure)) => {
                self.observer.download_failed(url, &failure.to_string());
                return Err(FailureKind::from(&failure));
            }
            Err(_) => {
                self.observer
                    .download_failed(url, &format!("no response within {:?}", self.settings.timeout));
                return Err(FailureKind::TransportTimeout);
            }
        };

        if !response.is_success() {
            self.observer
                .download_failed(url, &format!("HTTP status {}", response.status));
            return Err(FailureKind::HttpStatusError);
        }

        let part = part_path(destination);
        let remaining = self.settings.timeout.saturating_sub(started.elapsed());
        let written = tokio::time::timeout(remaining, write_body(response, destination, &part)).await;

        let failure = match written {
            Ok(Ok(bytes_written)) => {
                let result = DownloadResult {
                    bytes_written,
                    destination: destination.to_path_buf(),
                };
                self.observer.download_finished(&result, started.elapsed());
                return Ok(result);
            }
            Ok(Err(failure)) => failure,
            Err(_) => (
                FailureKind::TransportTimeout,
                format!("body not complete within {:?}", self.settings.timeout),
            ),
        };

        // 失敗時不留下半個檔案
        if let Err(e) = tokio::fs::remove_file(&part).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove {}: {}", part.display(), e);
            }
        }
        self.observer.download_failed(url, &failure.1);
        Err(failure.0)
    }
}

/// 與目的檔同目錄的 `<destination>.part`
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn io_failure(e: std::io::Error) -> WriteFailure {
    (FailureKind::IoError, e.to_string())
}

async fn write_body(
    response: FetchResponse,
    destination: &Path,
    part: &Path,
) -> Result<u64, WriteFailure> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_failure)?;
    }

    let total = response.content_length().filter(|t| *t > 0);
    let mut file = tokio::fs::File::create(part).await.map_err(io_failure)?;
    let mut body = response.body;
    let mut written: u64 = 0;
    let mut next_report: u64 = 10;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|f| (FailureKind::from(&f), f.to_string()))?;
        file.write_all(&chunk).await.map_err(io_failure)?;
        written += chunk.len() as u64;

        if let Some(total) = total {
            let percent = written.saturating_mul(100) / total;
            if percent >= next_report {
                tracing::debug!("Downloaded {}% ({}/{} bytes)", percent.min(100), written, total);
                next_report = (percent / 10 + 1) * 10;
            }
        }
    }

    file.flush().await.map_err(io_failure)?;
    drop(file);

    tokio::fs::rename(part, destination).await.map_err(io_failure)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::{StaticFetcher, StaticReply};
    use crate::domain::model::ExtractionHeuristic;
    use crate::domain::ports::NoopObserver;
    use crate::utils::error::TransportFailure;
    use tempfile::TempDir;

    fn artifact() -> ResolvedArtifact {
        ResolvedArtifact {
            url: Url::parse("https://cdn.example.com/files/report.pdf").unwrap(),
            discovered_by: ExtractionHeuristic::DirectAnchor,
        }
    }

    fn context() -> DownloadContext {
        DownloadContext::for_source(
            "agent/1.0",
            &Url::parse("https://docs.example.com/library/report?x=1").unwrap(),
        )
    }

    fn downloader(timeout: Duration) -> Downloader {
        Downloader::new(
            DownloadSettings {
                timeout,
                ..DownloadSettings::default()
            },
            Arc::new(NoopObserver),
        )
    }

    #[tokio::test]
    async fn test_streams_chunks_into_nested_destination() {
        let temp_dir = TempDir::new().unwrap();
        let destination = temp_dir.path().join("a/b/report.pdf");
        let fetcher = StaticFetcher::new(vec![StaticReply::chunked(
            200,
            vec![b"%PDF-1.7\n".to_vec(), b"body".to_vec()],
        )]);

        let result = downloader(Duration::from_secs(5))
            .fetch(&artifact(), &destination, &fetcher, &context())
            .await
            .unwrap();

        assert_eq!(result.bytes_written, 13);
        assert_eq!(std::fs::read(&destination).unwrap(), b"%PDF-1.7\nbody");
        assert!(!part_path(&destination).exists());
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_request_carries_identity_headers() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = StaticFetcher::new(vec![StaticReply::ok(b"x".to_vec())]);

        downloader(Duration::from_secs(5))
            .fetch(&artifact(), &temp_dir.path().join("r.pdf"), &fetcher, &context())
            .await
            .unwrap();

        let request = &fetcher.requests()[0];
        let header = |name: &str| {
            request
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(header("User-Agent").as_deref(), Some("agent/1.0"));
        assert_eq!(header("Referer").as_deref(), Some("https://docs.example.com/"));
        assert_eq!(header("Accept").as_deref(), Some("application/pdf,*/*"));
        assert_eq!(request.url, "https://cdn.example.com/files/report.pdf");
    }

    #[tokio::test]
    async fn test_non_success_status_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let destination = temp_dir.path().join("out/report.pdf");
        let fetcher = StaticFetcher::new(vec![StaticReply::status(403)]);

        let result = downloader(Duration::from_secs(5))
            .fetch(&artifact(), &destination, &fetcher, &context())
            .await;

        assert_eq!(result, Err(FailureKind::HttpStatusError));
        assert!(!destination.exists());
        assert!(!temp_dir.path().join("out").exists());
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_body_removes_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let destination = temp_dir.path().join("report.pdf");
        let fetcher = StaticFetcher::new(vec![StaticReply::Interrupted {
            chunks: vec![b"partial".to_vec()],
            failure: TransportFailure::Connect("connection reset".into()),
        }]);

        let result = downloader(Duration::from_secs(5))
            .fetch(&artifact(), &destination, &fetcher, &context())
            .await;

        assert_eq!(result, Err(FailureKind::TransportError));
        assert!(!destination.exists());
        assert!(!part_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let destination = temp_dir.path().join("report.pdf");
        let fetcher = StaticFetcher::new(vec![StaticReply::Stalled]);

        let result = downloader(Duration::from_millis(100))
            .fetch(&artifact(), &destination, &fetcher, &context())
            .await;

        assert_eq!(result, Err(FailureKind::TransportTimeout));
        assert!(!part_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_transport_failures_are_classified() {
        let temp_dir = TempDir::new().unwrap();
        let destination = temp_dir.path().join("report.pdf");

        let fetcher = StaticFetcher::new(vec![
            StaticReply::Refused(TransportFailure::Timeout("headers".into())),
            StaticReply::Refused(TransportFailure::Proxy("407".into())),
        ]);
        let downloader = downloader(Duration::from_secs(5));

        let first = downloader.fetch(&artifact(), &destination, &fetcher, &context()).await;
        let second = downloader.fetch(&artifact(), &destination, &fetcher, &context()).await;

        assert_eq!(first, Err(FailureKind::TransportTimeout));
        assert_eq!(second, Err(FailureKind::TransportError));
    }

    #[tokio::test]
    async fn test_destination_under_a_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let fetcher = StaticFetcher::new(vec![StaticReply::ok(b"x".to_vec())]);

        let result = downloader(Duration::from_secs(5))
            .fetch(&artifact(), &blocker.join("report.pdf"), &fetcher, &context())
            .await;

        assert_eq!(result, Err(FailureKind::IoError));
    }

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("out/report.pdf")),
            PathBuf::from("out/report.pdf.part")
        );
    }
}
