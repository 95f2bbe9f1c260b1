//! ROADTRACK: road-network constrained vehicle tracking from GPS fixes.
//!
//! - `run`: track a CSV of fixes over a JSON road network and write one estimate per fix.
//!   Settings come from a TOML/JSON configuration file, with command-line flags taking
//!   precedence.
//! - `simulate`: write a small demonstration network and a noisy drive along it.
//! - `template`: write a configuration file with every default filled in.
//! - `estimators`: list the motion estimators that can be named in a configuration.
use anyhow::{Context, Result, bail};
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::Write;
use std::path::PathBuf;

use roadtrack::filter::FilterConfig;
use roadtrack::graph::RoadNetwork;
use roadtrack::kalman::registered_estimators;
use roadtrack::particle::ParticleResamplingStrategy;
use roadtrack::path::Path as RoadPath;
use roadtrack::sim::{
    ObservationRecord, RoadNetworkFile, RoadRecord, RunConfig, run, simulate_drive,
};
use roadtrack::{GeoCoordinate, LocalProjection, Point2};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Road-network constrained vehicle tracking with a particle filter."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level of the tracker (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: log::LevelFilter,

    /// Write the log to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Track a file of GPS fixes
    Run(RunArgs),
    /// Write a demonstration road network and simulated fixes
    Simulate(SimulateArgs),
    /// Write a configuration template
    Template {
        /// Output file; the extension selects TOML or JSON
        #[arg(short, long, default_value = "roadtrack.toml")]
        output: PathBuf,
    },
    /// List the registered motion estimators
    Estimators,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Configuration file (TOML/JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// CSV of fixes with time, latitude and longitude columns
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Output CSV of estimates
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// JSON road network
    #[arg(short, long)]
    network: Option<PathBuf>,
    /// Number of particles
    #[arg(long)]
    particles: Option<usize>,
    /// Random seed
    #[arg(long)]
    seed: Option<u64>,
    /// Motion estimator tag
    #[arg(long)]
    estimator: Option<String>,
    #[arg(long, value_enum)]
    resampling: Option<ParticleResamplingStrategy>,
    /// Score particles in parallel
    #[arg(long)]
    parallel: bool,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Directory receiving roads.json and fixes.csv
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
    /// Origin latitude in degrees
    #[arg(long, default_value_t = 39.9526)]
    latitude: f64,
    /// Origin longitude in degrees
    #[arg(long, default_value_t = -75.1652)]
    longitude: f64,
    /// Speed in m/s
    #[arg(long, default_value_t = 12.0)]
    speed: f64,
    /// GPS noise standard deviation in meters
    #[arg(long, default_value_t = 5.0)]
    noise: f64,
    /// Number of fixes, one per second
    #[arg(long, default_value_t = 60)]
    count: usize,
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

/// Log the tracker at `level` and everything else at no more than warnings.
fn init_logger(level: log::LevelFilter, log_file: Option<&PathBuf>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.min(log::LevelFilter::Warn))
        .filter_module("roadtrack", level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    if let Some(path) = log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn run_command(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => {
            let (Some(input), Some(output), Some(network)) =
                (args.input.clone(), args.output.clone(), args.network.clone())
            else {
                bail!("without --config, --input, --output and --network are required");
            };
            RunConfig {
                input,
                output,
                network,
                origin: None,
                filter: FilterConfig::default(),
            }
        }
    };
    if let Some(input) = args.input {
        config.input = input;
    }
    if let Some(output) = args.output {
        config.output = output;
    }
    if let Some(network) = args.network {
        config.network = network;
    }
    if let Some(particles) = args.particles {
        config.filter.particles = particles;
    }
    if let Some(seed) = args.seed {
        config.filter.seed = seed;
    }
    if let Some(estimator) = args.estimator {
        config.filter.estimator = estimator;
    }
    if let Some(resampling) = args.resampling {
        config.filter.resampling = resampling;
    }
    config.filter.parallel |= args.parallel;
    let written = run(&config).with_context(|| format!("tracking {} failed", config.input.display()))?;
    info!("done: {} estimates", written);
    Ok(())
}

/// An L-shaped pair of two-way roads: 800 m east, then 600 m north.
fn simulate_command(args: SimulateArgs) -> Result<()> {
    let origin = GeoCoordinate::new(args.latitude, args.longitude);
    let projection = LocalProjection::new(origin);
    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(800.0, 0.0),
        Point2::new(800.0, 600.0),
    ];
    let roads = corners
        .windows(2)
        .map(|w| {
            let a = projection.unproject(&w[0]);
            let b = projection.unproject(&w[1]);
            RoadRecord {
                geometry: vec![[a.latitude, a.longitude], [b.latitude, b.longitude]],
                two_way: true,
            }
        })
        .collect();
    let network = RoadNetworkFile { roads };
    let graph = network.build(&projection)?;
    let east = graph.nearby_edges(&Point2::new(400.0, 0.0), 1.0);
    let north = graph.nearby_edges(&Point2::new(800.0, 300.0), 1.0);
    let forward = |edges: &[std::sync::Arc<roadtrack::path::RoadEdge>], dx: f64, dy: f64| {
        edges
            .iter()
            .find(|e| {
                let d = e.end() - e.start();
                d.x * dx + d.y * dy > 0.0
            })
            .cloned()
    };
    let (Some(first), Some(second)) = (forward(&east, 1.0, 0.0), forward(&north, 0.0, 1.0)) else {
        bail!("demonstration network is missing a road");
    };
    let path = RoadPath::from_road_edges(&[first, second], false);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .context("invalid start time")?;
    let fixes = simulate_drive(
        &path,
        args.speed,
        1.0,
        args.count,
        args.noise,
        start,
        &projection,
        &mut rng,
    )?;
    std::fs::create_dir_all(&args.output)?;
    let network_file = args.output.join("roads.json");
    let fixes_file = args.output.join("fixes.csv");
    network.to_json(&network_file)?;
    let records: Vec<ObservationRecord> = fixes
        .iter()
        .map(|f| ObservationRecord::from_observation(&f.observation))
        .collect();
    ObservationRecord::to_csv(&records, &fixes_file)?;
    info!(
        "wrote {} and {} fixes to {}",
        network_file.display(),
        records.len(),
        fixes_file.display()
    );
    Ok(())
}

fn template_command(output: PathBuf) -> Result<()> {
    let config = RunConfig {
        input: PathBuf::from("fixes.csv"),
        output: PathBuf::from("estimates.csv"),
        network: PathBuf::from("roads.json"),
        origin: None,
        filter: FilterConfig::default(),
    };
    let text = match output.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::to_string_pretty(&config)?,
        Some("toml") => toml::to_string_pretty(&config)?,
        _ => bail!("template must be a .toml or .json file"),
    };
    std::fs::write(&output, text)?;
    info!("wrote configuration template to {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.log_level, cli.log_file.as_ref())?;
    match cli.command {
        Command::Run(args) => run_command(args),
        Command::Simulate(args) => simulate_command(args),
        Command::Template { output } => template_command(output),
        Command::Estimators => {
            for tag in registered_estimators() {
                println!("{}", tag);
            }
            Ok(())
        }
    }
}
