use std::process::ExitCode;

use clap::Parser;
use envconfig::Envconfig;

use starter_api::app;
use starter_api::config::{Args, Config};
use starter_api::logging::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_guard = init_tracing(config.debug);
    let service = config.service_config(&args);

    let code = match app::run(&config, service).await {
        Ok(report) => match report.into_result() {
            Ok(()) => {
                tracing::info!("{} stopped", app::SERVICE_NAME);
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "{} stopped after listener failure", app::SERVICE_NAME);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "{} failed to start", app::SERVICE_NAME);
            ExitCode::FAILURE
        }
    };

    // Flushes buffered log lines; nothing may log after this.
    drop(log_guard);
    code
}
