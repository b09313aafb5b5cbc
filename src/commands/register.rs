use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use tavreg_core::config::AppConfig;
use tavreg_registration::{
    CsvSink, EngineConfig, HeadlessBrowser, OcrSolverClient, RegistrationEngine, TempMailClient,
};

pub async fn run(config: AppConfig, count: u32) -> Result<()> {
    let mut succeeded = 0u32;
    let mut failed = 0u32;

    for n in 1..=count {
        info!(run = n, total = count, "registration run starting");

        // Fresh browser session per run; leftover cookies would let the
        // site link consecutive sign-ups
        let browser = HeadlessBrowser::new(&config.browser)?;
        let mailbox = TempMailClient::new(&config.mailbox)?;
        let solver = OcrSolverClient::new(
            config.captcha.solver_url.clone(),
            config.captcha.solver_attempts,
        )?;
        let sink = CsvSink::new(&config.sink.csv_path);

        let engine = RegistrationEngine::new(
            browser,
            mailbox,
            solver,
            sink,
            EngineConfig::from_app(&config),
        );

        match engine.run().await {
            Ok(report) => {
                println!("{}", report.summary());
                if report.is_success() {
                    succeeded += 1;
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                warn!(run = n, error = %e, "run aborted");
                failed += 1;
            }
        }

        if n < count {
            tokio::time::sleep(Duration::from_secs(config.retry.retry_interval_secs)).await;
        }
    }

    println!("\n╔══════════════════════════════════════╗");
    println!("║        Registration Summary          ║");
    println!("╠══════════════════════════════════════╣");
    println!("║ Runs:        {:>20}    ║", count);
    println!("║ Succeeded:   {:>20}    ║", succeeded);
    println!("║ Failed:      {:>20}    ║", failed);
    println!("╚══════════════════════════════════════╝\n");

    Ok(())
}
