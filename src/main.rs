use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::HumanBytes;
use modelfetch::{
    fetch::{local_status, partial},
    ConfigBuilder, FetchConfig, FetchError, Fetcher, FileConfig, LocalState, SessionReport, UrlStrategy,
};
use tracing_subscriber::EnvFilter;

mod progress;

use progress::ProgressObserver;

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "modelfetch", about = "Fetch model weight files with resumable, retried downloads")]
struct Cli {
    /// Optional path to a config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Destination directory for models (overrides MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Base URL for models without an override (overrides MODEL_URL)
    #[arg(long, global = true)]
    model_url: Option<String>,

    /// Model file to fetch; repeat for several (overrides MODEL_NAMES)
    #[arg(long = "model", value_name = "NAME", global = true)]
    models: Vec<String>,

    /// Fixed download URL for one model
    #[arg(long = "override", value_name = "NAME=URL", global = true)]
    overrides: Vec<String>,

    /// Print the session report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Exit 0 when some models fail (fatal errors still fail)
    #[arg(long, global = true)]
    allow_partial: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Download every missing model (default)
    Fetch,
    /// Show where each model would be downloaded from
    Plan,
    /// Show which models are already present
    Status,
    /// Remove leftover partial downloads
    Clean,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(error_exit_code(&err))
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("MODELFETCH_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Fatal errors from the library carry their own code; anything else is 2.
fn error_exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<FetchError>().map_or(2, FetchError::exit_code)
}

fn session_exit_code(report: &SessionReport, allow_partial: bool) -> u8 {
    if report.is_success() || allow_partial {
        0
    } else {
        1
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<FetchConfig> {
    let mut builder = ConfigBuilder::new();
    if let Some(path) = &cli.config {
        let file = FileConfig::load(path).map_err(FetchError::from)?;
        builder = builder.file(file);
    }
    let config = builder
        .env(|key| std::env::var(key).ok())
        .model_dir(cli.model_dir.clone())
        .model_url(cli.model_url.clone())
        .model_names(cli.models.clone())
        .overrides(cli.overrides.as_slice())
        .and_then(|b| b.build())
        .map_err(FetchError::from)?;
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    let specs = config.specs().map_err(FetchError::from)?;

    match cli.command.unwrap_or(Commands::Fetch) {
        Commands::Fetch => {
            let observer = Arc::new(ProgressObserver::new(cli.json));
            let fetcher = Fetcher::new(config)?.observer(observer);

            let report = tokio::select! {
                report = fetcher.fetch_all(&specs) => report?,
                _ = shutdown_signal() => {
                    // The session future has been dropped, which removed its partial files.
                    tracing::warn!("interrupted, partial downloads removed");
                    return Ok(ExitCode::from(EXIT_INTERRUPTED));
                }
            };

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report).context("serializing report")?);
            } else {
                eprint!("{}", report.render());
            }

            if !report.is_success() && cli.allow_partial {
                tracing::warn!(failed = ?report.failed_names(), "continuing despite failed models");
            }
            Ok(ExitCode::from(session_exit_code(&report, cli.allow_partial)))
        }
        Commands::Plan => {
            let catalog = config.catalog();
            for spec in &specs {
                let source = match catalog.strategy(&spec.name) {
                    UrlStrategy::Fixed(_) => "override".yellow(),
                    UrlStrategy::BaseJoin => "base".dimmed(),
                };
                println!("{}\t{}\t{}", spec.name, source, spec.source_url);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let states = local_status(&config.model_dir, &specs).await;
            let missing = states.iter().filter(|(_, s)| *s == LocalState::Missing).count();
            if cli.json {
                let rows: Vec<_> = states
                    .iter()
                    .map(|(spec, state)| serde_json::json!({ "name": spec.name, "local": state }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows).context("serializing status")?);
            } else {
                for (spec, state) in &states {
                    match state {
                        LocalState::Present { size } => {
                            println!("{} {} ({})", "✓".green(), spec.name, HumanBytes(*size))
                        }
                        LocalState::Missing => println!("{} {}", "✗".red(), spec.name),
                    }
                }
            }
            Ok(if missing == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Clean => {
            let removed = partial::sweep(&config.model_dir)
                .with_context(|| format!("cleaning {}", config.model_dir.display()))?;
            println!("removed {removed} partial file(s) from {}", config.model_dir.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelfetch::{ArtifactReport, ArtifactStatus, ConfigError};

    fn report(statuses: &[ArtifactStatus]) -> SessionReport {
        let artifacts = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| ArtifactReport {
                name: format!("m{i}.bin"),
                url: format!("http://host/m{i}.bin"),
                status: status.clone(),
                attempts: 1,
                size: 10,
            })
            .collect();
        SessionReport { artifacts }
    }

    #[test]
    fn session_codes() {
        let ok = report(&[ArtifactStatus::AlreadySatisfied, ArtifactStatus::Completed]);
        let partial = report(&[ArtifactStatus::Completed, ArtifactStatus::Failed { reason: "503".into() }]);

        assert_eq!(session_exit_code(&ok, false), 0);
        assert_eq!(session_exit_code(&partial, false), 1);
        assert_eq!(session_exit_code(&partial, true), 0);
        assert_eq!(session_exit_code(&SessionReport::default(), false), 0);
    }

    #[test]
    fn fatal_error_codes() {
        let build_err = reqwest::Client::new().get("not a url").build().unwrap_err();
        let missing_client = anyhow::Error::from(FetchError::ClientUnavailable(build_err));
        assert_eq!(error_exit_code(&missing_client), 127);

        let bad_config = anyhow::Error::from(FetchError::from(ConfigError::ZeroAttempts));
        assert_eq!(error_exit_code(&bad_config), 2);

        let other = anyhow::anyhow!("serializing report");
        assert_eq!(error_exit_code(&other), 2);
        assert_eq!(EXIT_INTERRUPTED, 130);
    }
}
