use clap::Parser;
use tracing::{debug, error};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod commands;
mod config;
mod error;
mod headers;

use cli::{CliArgs, Command, ConfigAction};
use commands::GetOptions;
use config::AppConfig;
use error::AppError;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    let mut app_config = AppConfig::load(args.config.as_deref())?;
    app_config.apply(&args.overrides);

    // Held until the failure below has been logged, so it reaches --log-file.
    let _guard = init_logging(&args, &app_config)?;
    debug!(config = ?app_config, "Configuration loaded");

    log_failure(run(args.command, app_config).await)
}

fn log_failure<T>(result: Result<T, AppError>) -> Result<T, AppError> {
    if let Err(e) = &result {
        error!(error = ?e, "Application failed");
    }
    result
}

async fn run(command: Command, app_config: AppConfig) -> Result<(), AppError> {
    match command {
        Command::Config { action } => match action {
            ConfigAction::Show => commands::show_config(&app_config),
            ConfigAction::Path => commands::show_config_path(),
        },
        Command::Get {
            urls,
            force,
            offline,
            headers,
        } => {
            let loader = commands::open_loader(app_config.loader, offline)?;
            let result = commands::get(
                &loader,
                GetOptions {
                    urls: &urls,
                    force,
                    headers: &headers,
                },
            )
            .await;
            loader.shutdown();
            result
        }
        Command::Gc { force } => {
            let loader = commands::open_loader(app_config.loader, false)?;
            commands::gc(&loader, force)
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`, which
/// wins over the configured level.
fn init_logging(args: &CliArgs, config: &AppConfig) -> Result<Option<WorkerGuard>, AppError> {
    let default_level = if args.verbose {
        "debug"
    } else {
        config.log_level.as_deref().unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| AppError::InvalidInput(format!("invalid log level: {e}")))?;

    let builder = FmtSubscriber::builder().with_env_filter(filter);

    let guard = match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let subscriber = builder
                .with_writer(MakeWriterExt::and(std::io::stderr, writer))
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| AppError::Initialization(e.to_string()))?;
            Some(guard)
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| AppError::Initialization(e.to_string()))?;
            None
        }
    };

    Ok(guard)
}
