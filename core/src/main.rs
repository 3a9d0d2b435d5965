//! ESTIMATION: run the recursive filters on a simulated constant-velocity target.
//!
//! Settings come either from command-line flags or from a settings file
//! (TOML/JSON/YAML) given with `--config`. Results are written as CSV.

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::{error, info};

use estimation::config::{FilterSettings, FilterType, create_filter};
use estimation::integrator::{IntegratorMethod, IntegratorSettings};
use estimation::parameters::{ConstantParameterReference, CustomParameters};
use estimation::sim::{ConstantVelocityScenario, EstimationResult, position_rmse, run_filter};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Recursive state estimation with linear, extended and unscented Kalman filters."
)]
struct Cli {
    /// Filter settings file (TOML/JSON/YAML); overrides the filter flags of `run`
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "run",
        about = "Filter a simulated constant-velocity target",
        long_about = "Simulate a one-dimensional constant-velocity target with seeded Gaussian process and measurement noise, filter the position measurements and write the estimates as CSV."
    )]
    Run(RunArgs),
    #[command(name = "config", about = "Write a template filter settings file")]
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Output CSV file
    #[arg(short, long, default_value = "estimation.csv")]
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = FilterType::Unscented)]
    filter: FilterType,
    /// Unscented tuning preset (wan_van_der_merwe, lisano_born_axelrad, challa_moore_rogers, custom)
    #[arg(long)]
    preset: Option<ConstantParameterReference>,
    /// Custom alpha; selects the custom preset unless --preset is given
    #[arg(long)]
    alpha: Option<f64>,
    /// Custom kappa; selects the custom preset unless --preset is given
    #[arg(long)]
    kappa: Option<f64>,
    /// Integrate the continuous-time model with RK4 at this step size
    #[arg(long)]
    integrator_step: Option<f64>,
    #[arg(long, default_value_t = 100)]
    steps: usize,
    #[arg(long, default_value_t = 1.0)]
    dt: f64,
    #[arg(long, default_value_t = 0.1)]
    process_std: f64,
    #[arg(long, default_value_t = 0.5)]
    measurement_std: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Output settings file; format chosen by extension
    #[arg(short, long, default_value = "filter.toml")]
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = FilterType::Unscented)]
    filter: FilterType,
}

/// Initialize the logger with the specified configuration
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn run(args: &RunArgs, config: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let scenario = ConstantVelocityScenario {
        dt: args.dt,
        steps: args.steps,
        process_std: args.process_std,
        measurement_std: args.measurement_std,
        seed: args.seed,
        ..Default::default()
    };
    let settings = match config {
        Some(path) => {
            info!("loading filter settings from {}", path.display());
            FilterSettings::from_file(path)?
        }
        None => {
            let reference = args.preset.unwrap_or(if args.alpha.is_some() || args.kappa.is_some() {
                ConstantParameterReference::Custom
            } else {
                ConstantParameterReference::default()
            });
            let integrator = args
                .integrator_step
                .map(|h| IntegratorSettings::new(IntegratorMethod::RungeKutta4, h));
            scenario.settings(
                args.filter,
                reference,
                CustomParameters {
                    alpha: args.alpha,
                    kappa: args.kappa,
                },
                integrator,
            )
        }
    };
    let models = if settings.integrator.is_some() {
        scenario.derivative_models()
    } else {
        scenario.models()
    };
    let samples = scenario.generate()?;
    let mut filter = create_filter(&settings, models)?;
    let results = run_filter(filter.as_mut(), &samples);
    let (estimate, measured) = position_rmse(&results);
    info!("position RMSE: filter {estimate:.4}, measurement {measured:.4}");
    EstimationResult::to_csv(&results, &args.output)?;
    info!(
        "wrote {} rows to {}",
        results.len(),
        args.output.display()
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    match &cli.command {
        Command::Run(args) => {
            if let Err(e) = run(args, cli.config.as_ref()) {
                error!("run failed: {e}");
                return Err(e);
            }
        }
        Command::Config(args) => {
            let settings = FilterSettings {
                filter_type: args.filter,
                ..Default::default()
            };
            settings.to_file(&args.output)?;
            info!("wrote template settings to {}", args.output.display());
        }
    }
    Ok(())
}
