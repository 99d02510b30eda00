use artifact_acquire::utils::{logger, validation::Validate};
use artifact_acquire::{
    AcquisitionOrchestrator, ChromiumSessions, CliArgs, ReqwestFetcher, Target, TracingObserver,
};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = CliArgs::parse();
    let env = |name: &str| std::env::var(name).ok();

    // 初始化日誌
    logger::init_cli_logger(args.verbose(env));

    tracing::info!("Starting artifact-acquire");
    tracing::debug!("CLI args: {:?}", args);

    // 驗證參數與配置
    let prepared = args.validate().and_then(|_| {
        let config = args.load_config(env)?;
        let target = Target::new(&args.url, &args.output)?;
        let sessions = ChromiumSessions::new(config.browser_settings())?;
        Ok((config, target, sessions))
    });
    let (config, target, sessions) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::error!("❌ Configuration validation failed: {}", e);
            tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let orchestrator = AcquisitionOrchestrator::new(
        sessions,
        ReqwestFetcher::new(),
        config.acquire_settings(),
        Arc::new(config.identity_policy()),
        Arc::new(TracingObserver),
    )?;

    let deadline = args
        .deadline_secs
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let report = orchestrator
        .run(&target, config.retry.max_attempts, &config.delay_policy(), deadline)
        .await;

    match report.outcome {
        Ok(result) => {
            println!("✅ Downloaded {} bytes", result.bytes_written);
            println!("📁 Output saved to: {}", result.destination.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(kind) => {
            eprintln!(
                "❌ Could not acquire {} after {} attempt(s): {}",
                target.source_url,
                report.attempts.len(),
                kind
            );
            Ok(ExitCode::from(EXIT_FAILURE))
        }
    }
}
