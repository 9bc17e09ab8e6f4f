use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand, ValueEnum};
use crop_health::{
    config::ServiceConfig,
    error::{ServiceError, TrainingError},
    service::{BatchRequest, FetchRequest, PolygonRequest, PredictRequest},
    start_service, train_model,
    training::{RunMode, TrainingOptions},
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "crop-health", version, about = "Parcel vegetation health from Sentinel-2 bands")]
struct Cli {
    #[command(flatten)]
    config: ServiceConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fit the model on the historical exports and write the artifacts.
    Train {
        #[arg(long)]
        bands_csv: PathBuf,
        #[arg(long)]
        soil_csv: PathBuf,
        #[arg(long, value_enum, default_value_t = RunModeArg::Parallel)]
        run_mode: RunModeArg,
    },
    /// Score one sample: `{bands, soil?, month?}`.
    Predict {
        /// JSON request file, `-` for stdin.
        #[arg(long, default_value = "-")]
        input: PathBuf,
    },
    /// Acquire bands for a polygon and score them: `{polygon, soil?, date_from?, date_to?}`.
    PredictPolygon {
        #[arg(long, default_value = "-")]
        input: PathBuf,
    },
    /// Score many samples: `{samples: [...]}`.
    PredictBatch {
        #[arg(long, default_value = "-")]
        input: PathBuf,
    },
    /// Acquire bands without scoring: `{polygon, date_from?, date_to?}`.
    FetchBands {
        #[arg(long, default_value = "-")]
        input: PathBuf,
    },
    ModelInfo,
    /// Service health and imagery connection state.
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum RunModeArg {
    Single,
    Parallel,
}

impl From<RunModeArg> for RunMode {
    fn from(arg: RunModeArg) -> Self {
        match arg {
            RunModeArg::Single => RunMode::SingleThreaded,
            RunModeArg::Parallel => RunMode::Parallel,
        }
    }
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Failed to read {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid request: {0}")]
    Request(#[source] serde_json::Error),

    #[error("Failed to write output: {0}")]
    Output(#[from] serde_json::Error),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Service(e) if e.is_unavailable() => ExitCode::from(3),
            CliError::Service(_) | CliError::Request(_) | CliError::Input { .. } => {
                ExitCode::from(2)
            }
            _ => ExitCode::FAILURE,
        }
    }
}

fn read_request<T: DeserializeOwned>(input: &Path) -> Result<T, CliError> {
    let text = if input == Path::new("-") {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .map_err(|source| CliError::Input {
                path: input.to_path_buf(),
                source,
            })?;
        text
    } else {
        fs::read_to_string(input).map_err(|source| CliError::Input {
            path: input.to_path_buf(),
            source,
        })?
    };
    serde_json::from_str(&text).map_err(CliError::Request)
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    // A closed stdout is not worth a failure exit once the result is computed.
    let _ = writeln!(stdout);
    Ok(())
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.config;
    match cli.command {
        Command::Train {
            bands_csv,
            soil_csv,
            run_mode,
        } => {
            let options = TrainingOptions {
                run_mode: run_mode.into(),
                ..TrainingOptions::default()
            };
            let metadata = train_model(&bands_csv, &soil_csv, &config, &options)?;
            print_json(&metadata)
        }
        Command::Predict { input } => {
            let request: PredictRequest = read_request(&input)?;
            print_json(&start_service(&config).predict(&request)?)
        }
        Command::PredictPolygon { input } => {
            let request: PolygonRequest = read_request(&input)?;
            print_json(&start_service(&config).predict_polygon(&request)?)
        }
        Command::PredictBatch { input } => {
            let request: BatchRequest = read_request(&input)?;
            print_json(&start_service(&config).predict_batch(request.samples)?)
        }
        Command::FetchBands { input } => {
            let request: FetchRequest = read_request(&input)?;
            print_json(&start_service(&config).fetch_bands(&request)?)
        }
        Command::ModelInfo => print_json(&start_service(&config).model_info()?),
        Command::Status => {
            let context = start_service(&config);
            context.connect_imagery();
            print_json(&serde_json::json!({
                "health": context.health(),
                "imagery": context.imagery_status(),
            }))
        }
    }
}

fn main() -> ExitCode {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .try_init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            e.exit_code()
        }
    }
}
