use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, ValueEnum};
use prune_images::{config::Configuration, output::ProgramOutput};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Opt {
    /// YAML configuration files, applied in order
    #[clap(short, long, value_parser)]
    config: Vec<PathBuf>,

    /// Force a dry run whatever the configuration says
    #[clap(long)]
    dry_run: bool,

    #[clap(long, value_enum, default_value_t = LogFormat::Text, env = "PRUNE_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("Unable to listen for shutdown signal: {err}");
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Shutdown requested, finishing in-flight deletions");
    cancel.cancel();
}

async fn execute(options: Opt, cancel: CancellationToken) -> ProgramOutput {
    let mut config = match Configuration::config(Configuration::figment(options.config)) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return ProgramOutput::from_config_error(&err);
        }
    };

    if options.dry_run {
        config.dry_run = true;
    }

    let result = prune_images::run(&config, cancel).await;
    if let Err(err) = &result {
        error!("Prune run failed: {err}");
    }

    ProgramOutput::from_run(result, config.strict)
}

#[tokio::main]
async fn main() -> ExitCode {
    let options = Opt::parse();
    init_logging(options.log_format);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let output = execute(options, cancel).await;

    match serde_json::to_string(&output) {
        Ok(json) => println!("{json}"),
        Err(err) => error!("Unable to serialize result: {err}"),
    }

    match output.success {
        true => ExitCode::SUCCESS,
        false => ExitCode::FAILURE,
    }
}
