//! CLI entry point for tripscope.
//!
//! Loads the trip and zone tables, builds the joined view and runs grouped
//! statistics, top-N rankings, seeded splits or a live session driven by
//! selections read from stdin.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use tripscope::backend::{Backend, BasicClient, BearerToken, Deadline, HttpBackend, LocalBackend};
use tripscope::config::Config;
use tripscope::engine::AggregationEngine;
use tripscope::join::{GeoJoinView, JoinedView};
use tripscope::loader::{load_trips, load_zones};
use tripscope::model::Literal;
use tripscope::output::{print_json, print_pretty, write_csv};
use tripscope::partition::PartitionSampler;
use tripscope::query::{AggregationRequest, DerivedExpr, Predicate, Statistic};
use tripscope::result::AggregationResult;
use tripscope::session::{Dependent, Params, ReactiveSession, param};
use tripscope::{ExploreError, Result as ExploreResult};

const BANDS: [f64; 5] = [0.1, 0.25, 0.5, 0.75, 0.9];

#[derive(Parser)]
#[command(name = "tripscope")]
#[command(about = "Grouped statistics over trip records joined to zones", long_about = None)]
struct Cli {
    /// Trip fact table (CSV, optionally .csv.gz)
    #[arg(long, default_value = "data/trips.csv")]
    trips: PathBuf,

    /// Zone dimension table (CSV)
    #[arg(long, default_value = "data/zones.csv")]
    zones: PathBuf,

    /// JSON config file; TRIPSCOPE_* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trip-time count, mean and percentile bands per pickup hour for one route
    Stats {
        /// Pickup zone id or neighborhood
        pickup: String,

        /// Dropoff zone id or neighborhood
        dropoff: String,

        /// Also write the result to this CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Log the result as JSON instead of printing a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Busiest dropoff neighborhoods for a pickup
    Top {
        /// Pickup zone id or neighborhood
        pickup: String,

        #[arg(short, long, default_value_t = 10)]
        n: usize,
    },
    /// Seeded train/test split of one route, reporting partition sizes
    Split {
        /// Pickup zone id or neighborhood
        pickup: String,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Partition fractions as name=fraction
        #[arg(short, long, value_parser = parse_fraction, default_values = ["train=0.8", "test=0.2"])]
        fraction: Vec<(String, f64)>,
    },
    /// Live session: each stdin line `pickup,dropoff` recomputes the stats
    Watch,
}

fn parse_fraction(raw: &str) -> Result<(String, f64)> {
    let (name, fraction) = raw
        .split_once('=')
        .with_context(|| format!("expected name=fraction, got '{raw}'"))?;
    let fraction = fraction
        .trim()
        .parse()
        .with_context(|| format!("'{fraction}' is not a number"))?;
    Ok((name.trim().to_string(), fraction))
}

/// Numeric selections address zone ids, anything else a neighborhood.
fn selection(raw: &str) -> Literal {
    match raw.trim().parse::<i64>() {
        Ok(id) => Literal::Int(id),
        Err(_) => Literal::Text(raw.trim().to_string()),
    }
}

fn endpoint_filter(endpoint: &str, value: &Literal) -> Predicate {
    match value {
        Literal::Int(_) => Predicate::eq(&format!("{endpoint}_zone_id"), value.clone()),
        _ => Predicate::eq(&format!("{endpoint}_neighborhood"), value.clone()),
    }
}

/// Trip time per pickup hour between the `pickup` and `dropoff` selections.
fn route_stats(params: &Params) -> ExploreResult<AggregationRequest> {
    AggregationRequest::new()
        .filter(endpoint_filter("pickup", param(params, "pickup")?))?
        .filter(endpoint_filter("dropoff", param(params, "dropoff")?))?
        .derive(
            "trip_time",
            DerivedExpr::seconds_between("pickup_datetime", "dropoff_datetime"),
        )?
        .derive("pickup_hour", DerivedExpr::hour_of("pickup_datetime"))?
        .group_by(["pickup_hour"])?
        .count()?
        .aggregate("trip_time", Statistic::Mean)?
        .percentiles("trip_time", &BANDS)
}

fn busiest_dropoffs(pickup: &Literal, n: usize) -> ExploreResult<AggregationRequest> {
    AggregationRequest::new()
        .filter(endpoint_filter("pickup", pickup))?
        .group_by(["dropoff_neighborhood"])?
        .count()?
        .aggregate("fare_amount", Statistic::Mean)?
        .top_n(n)
}

fn backend(config: &Config) -> Result<Box<dyn Backend>> {
    let timeout = config.backend_timeout();
    match &config.backend_url {
        Some(url) => {
            info!(url = %url, "Using remote aggregation service");
            match &config.backend_token {
                Some(token) => {
                    let client = BearerToken::new(BasicClient::new(), token)?;
                    Ok(Box::new(Deadline::new(HttpBackend::new(client, url)?, timeout)))
                }
                None => Ok(Box::new(Deadline::new(
                    HttpBackend::new(BasicClient::new(), url)?,
                    timeout,
                ))),
            }
        }
        None => {
            info!(workers = config.workers, "Using local backend");
            Ok(Box::new(Deadline::new(LocalBackend::new(config.workers), timeout)))
        }
    }
}

/// Prints every result the session publishes.
struct TablePrinter;

impl Dependent for TablePrinter {
    fn on_ready(&self, result: &Arc<AggregationResult>) {
        let sorted = result.as_ref().clone().sorted_by_key();
        print_pretty(&sorted);
    }

    fn on_error(&self, error: &ExploreError) {
        error!(error = %error, "Computation failed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/tripscope.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("tripscope.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?.with_env()?,
        None => Config::from_env()?,
    };

    let facts = load_trips(&cli.trips)?;
    let zones = load_zones(&cli.zones)?;
    let views = GeoJoinView::new();
    let view = views.build(&config.view_name, &facts, &zones)?;
    drop(facts);

    let engine = Arc::new(AggregationEngine::new(backend(&config)?, config.row_cap));

    match cli.command {
        Commands::Stats {
            pickup,
            dropoff,
            output,
            json,
        } => {
            let params = Params::from([
                ("pickup".to_string(), selection(&pickup)),
                ("dropoff".to_string(), selection(&dropoff)),
            ]);
            let result = engine
                .execute(&route_stats(&params)?, &view)
                .await?
                .sorted_by_key();

            if json {
                print_json(&result)?;
            } else {
                print_pretty(&result);
            }
            if let Some(path) = output {
                write_csv(&path, &result)?;
                info!(path = %path.display(), "Result written");
            }
        }
        Commands::Top { pickup, n } => {
            let request = busiest_dropoffs(&selection(&pickup), n)?;
            let result = engine.execute(&request, &view).await?;
            print_pretty(&result);
        }
        Commands::Split {
            pickup,
            seed,
            fraction,
        } => {
            split(&view, &selection(&pickup), seed, &fraction)?;
        }
        Commands::Watch => {
            watch(engine, view).await?;
        }
    }

    Ok(())
}

fn split(view: &JoinedView, pickup: &Literal, seed: u64, fractions: &[(String, f64)]) -> Result<()> {
    let fractions: Vec<(&str, f64)> = fractions.iter().map(|(n, f)| (n.as_str(), *f)).collect();
    let filter = [endpoint_filter("pickup", pickup)];
    let partitions = PartitionSampler::split(view, &filter, &fractions, seed)?;

    for (name, partition) in &partitions {
        info!(partition = %name, rows = partition.len(), seed, "Partition");
        println!("{name}\t{}", partition.len());
    }
    Ok(())
}

#[tracing::instrument(skip_all)]
async fn watch(engine: Arc<AggregationEngine<Box<dyn Backend>>>, view: JoinedView) -> Result<()> {
    let session = ReactiveSession::new(engine, view, Arc::new(route_stats));
    session.register(Arc::new(TablePrinter)).await?;
    info!("Enter selections as pickup,dropoff (empty line or EOF to stop)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((pickup, dropoff)) = line.split_once(',') else {
            warn!(line, "Expected pickup,dropoff");
            continue;
        };
        let changes = [
            ("pickup".to_string(), selection(pickup)),
            ("dropoff".to_string(), selection(dropoff)),
        ];
        if let Err(e) = session.set_params(changes).await {
            warn!(error = %e, "Selection rejected");
        }
    }

    let phase = session.settled().await;
    info!(%phase, "Input closed, ending session");
    session.end().await;
    Ok(())
}
