use std::process::ExitCode;

use clap::Parser;

use selfheal_qa::cli::{self, Cli};
use selfheal_qa::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", render_error(&e));
            return ExitCode::from(2);
        }
    };

    // Keep the file writer alive until exit
    let _log_guard = logging::init(&config);
    if let Some(dir) = &config.log_dir {
        logging::install_crash_hook(dir);
    }

    tracing::info!("Starting selfheal-qa v{}", env!("CARGO_PKG_VERSION"));

    match cli::execute(args, config).await {
        Ok(outcome) => {
            match serde_json::to_string_pretty(&outcome.output) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to render output");
                    return ExitCode::from(2);
                }
            }
            if outcome.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "Command failed");
            eprintln!("{}", render_error(&e));
            ExitCode::from(2)
        }
    }
}

fn render_error(e: &selfheal_qa::error::AppError) -> String {
    serde_json::to_string_pretty(e).unwrap_or_else(|_| e.to_string())
}
