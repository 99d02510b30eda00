use crate::config::AcquireConfig;
use crate::utils::error::Result;
use crate::utils::validation::{self, Validate};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "artifact-acquire")]
#[command(about = "Locate and download a document artifact from a JavaScript-heavy page")]
pub struct CliArgs {
    #[arg(help = "Page that hosts the document")]
    pub url: String,

    #[arg(help = "Where the artifact is written")]
    pub output: PathBuf,

    #[arg(long, help = "TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Override retry.max_attempts")]
    pub max_attempts: Option<u32>,

    #[arg(long, help = "Give up after this many seconds overall")]
    pub deadline_secs: Option<u64>,

    #[arg(long, help = "Proxy for both the browser and the download")]
    pub proxy: Option<String>,

    #[arg(long, help = "Show the browser window")]
    pub headed: bool,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,
}

impl CliArgs {
    /// 先讀檔案（可選），再套環境變數，最後套命令列參數
    pub fn load_config(&self, env: impl Fn(&str) -> Option<String>) -> Result<AcquireConfig> {
        let mut config = match &self.config {
            Some(path) => AcquireConfig::from_file(path)?,
            None => AcquireConfig::default(),
        };
        config.apply_env_overrides(env)?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut AcquireConfig) {
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(proxy) = &self.proxy {
            config.download.proxy = Some(proxy.clone());
        }
        if self.headed {
            config.browser.headless = false;
        }
    }

    /// `--verbose` 或 `DEBUG=true`
    pub fn verbose(&self, env: impl Fn(&str) -> Option<String>) -> bool {
        self.verbose
            || env("DEBUG")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
    }
}

impl Validate for CliArgs {
    fn validate(&self) -> Result<()> {
        validation::validate_url("url", &self.url, &["http", "https"])?;
        validation::validate_path("output", &self.output.to_string_lossy())?;
        if let Some(deadline) = self.deadline_secs {
            validation::validate_positive_number("deadline_secs", deadline, 1)?;
        }
        Ok(())
    }
}
