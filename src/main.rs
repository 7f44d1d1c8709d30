//! CLI entry point for the transit tracker.
//!
//! `run` tracks live AVL feeds and publishes GTFS-realtime continuously,
//! `replay` pushes a recorded CSV of reports through the same pipeline, and
//! `inspect` summarizes any GTFS-realtime feed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_tracker::{
    avl::{AvlSource, CsvAvlSource, GtfsRtAvlSource, read_reports},
    config::CoreConfig,
    feed::{FeedGenerator, FeedPublisher, FeedSink, FileSink, S3Sink, spawn_publisher},
    fetch::{
        BasicClient,
        auth::{ApiKey, UrlParam},
    },
    output::{append_record, print_json, print_pretty},
    parser::{encode_feed, read_feed},
    pipeline::{
        Ingestor, ReportProcessor, spawn_expiry_task, spawn_schedule_watcher, spawn_source_worker,
        spawn_stat_handoff,
    },
    schedule::{ScheduleHandle, load_schedule_file},
    stats::FeedStats,
    store::VehicleStateStore,
    travel_time::{
        CsvStatRepository, S3StatArchive, TravelTimeModel, TravelTimeRepository,
        repository::write_atomic,
    },
};

#[derive(Parser)]
#[command(name = "transit_tracker")]
#[command(about = "Real-time vehicle tracking and arrival prediction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track live AVL sources and publish a GTFS-realtime feed
    Run {
        /// JSON tracking config; defaults apply to anything left out
        #[arg(short, long)]
        config: Option<String>,

        /// JSON schedule document, reloaded when it changes
        #[arg(short, long)]
        schedule: String,

        /// GTFS-realtime VehiclePositions URL to poll (repeatable)
        #[arg(long = "avl-url")]
        avl_urls: Vec<String>,

        /// CSV of AVL reports to ingest once (repeatable)
        #[arg(long = "avl-csv")]
        avl_csvs: Vec<String>,

        /// Send AVL_API_KEY in this header on every AVL request
        #[arg(long, conflicts_with = "api_key_param")]
        api_key_header: Option<String>,

        /// Send AVL_API_KEY as this URL query parameter instead
        #[arg(long)]
        api_key_param: Option<String>,

        /// Where the encoded feed is written each cycle
        #[arg(short, long, default_value = "feed/gtfs_rt.pb")]
        feed_out: String,

        /// Optional: S3 bucket to upload the feed and stats archive to
        #[arg(long)]
        s3_bucket: Option<String>,

        #[arg(long, default_value = "realtime/gtfs_rt.pb")]
        s3_feed_key: String,

        /// Travel-time stats CSV used when no S3 archive key is given
        #[arg(long, default_value = "data/travel_times.csv")]
        stats_file: String,

        /// Optional: keep travel-time stats as a gzip CSV under this S3 key
        #[arg(long, requires = "s3_bucket")]
        stats_s3_key: Option<String>,

        /// Optional: CSV file to append per-cycle feed stats to
        #[arg(long)]
        feed_log: Option<String>,

        /// How often the schedule file is checked for changes
        #[arg(long, default_value_t = 60)]
        schedule_poll_secs: u64,
    },
    /// Push a CSV of recorded AVL reports through the pipeline
    Replay {
        #[arg(short, long)]
        config: Option<String>,

        #[arg(short, long)]
        schedule: String,

        /// CSV of AVL reports
        #[arg(value_name = "FILE")]
        input: String,

        /// Feed reflecting the state after the last report
        #[arg(short, long, default_value = "replay.pb")]
        feed_out: String,

        /// Travel-time stats to seed from and write back to
        #[arg(long, default_value = "replay_travel_times.csv")]
        stats_file: String,
    },
    /// Summarize a GTFS-realtime feed from a file or URL
    Inspect {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// Optional: CSV file to append the summary to
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/transit_tracker.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_tracker.log"));

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

    match cli.command {
        Commands::Run {
            config,
            schedule,
            avl_urls,
            avl_csvs,
            api_key_header,
            api_key_param,
            feed_out,
            s3_bucket,
            s3_feed_key,
            stats_file,
            stats_s3_key,
            feed_log,
            schedule_poll_secs,
        } => {
            let config = load_config(config.as_deref())?;
            let auth = AvlAuth::from_args(api_key_header, api_key_param)?;

            let mut sources: Vec<Box<dyn AvlSource>> = Vec::new();
            let retention = chrono::Duration::seconds(config.store.silence_timeout_secs);
            for url in &avl_urls {
                sources.push(auth.source(url, retention)?);
            }
            for path in &avl_csvs {
                sources.push(Box::new(CsvAvlSource::new(path.clone())));
            }
            if sources.is_empty() {
                warn!("No AVL sources given, the feed will stay empty");
            }

            let s3_client = match &s3_bucket {
                Some(bucket) => {
                    info!(bucket = %bucket, "S3 upload enabled");
                    let aws = aws_config::load_from_env().await;
                    Some(aws_sdk_s3::Client::new(&aws))
                }
                None => None,
            };
            let repository: Arc<dyn TravelTimeRepository> =
                match (&s3_client, &s3_bucket, &stats_s3_key) {
                    (Some(client), Some(bucket), Some(key)) => {
                        Arc::new(S3StatArchive::new(client.clone(), bucket.clone(), key.clone()))
                    }
                    _ => Arc::new(CsvStatRepository::new(stats_file)),
                };

            let mut publisher_sinks: Vec<Box<dyn FeedSink>> =
                vec![Box::new(FileSink::new(feed_out))];
            if let (Some(client), Some(bucket)) = (&s3_client, &s3_bucket) {
                publisher_sinks.push(Box::new(S3Sink::new(client.clone(), bucket.clone(), s3_feed_key)));
            }

            run(RunSetup {
                config,
                schedule,
                sources,
                repository,
                sinks: publisher_sinks,
                feed_log,
                schedule_poll: Duration::from_secs(schedule_poll_secs),
            })
            .await?;
        }
        Commands::Replay {
            config,
            schedule,
            input,
            feed_out,
            stats_file,
        } => {
            let config = load_config(config.as_deref())?;
            replay(config, &schedule, &input, &feed_out, &stats_file).await?;
        }
        Commands::Inspect { source, output } => {
            let stats = match read_feed(&BasicClient::new(), &source).await {
                Ok(feed) => FeedStats::from_feed(&feed).with_name(&source),
                Err(e) => {
                    error!(source = %source, error = %e, "Cannot read feed");
                    FeedStats::from_error(&source, "read_error", &e.to_string())
                }
            };
            print_pretty(&stats);
            print_json(&stats)?;
            if let Some(path) = output {
                append_record(&path, &stats)?;
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<CoreConfig> {
    match path {
        Some(path) => CoreConfig::load(path),
        None => Ok(CoreConfig::default()),
    }
}

/// How AVL HTTP requests are authenticated. The key itself comes from the
/// `AVL_API_KEY` environment variable, never from the command line.
enum AvlAuth {
    None,
    Header(String, String),
    Param(String, String),
}

impl AvlAuth {
    fn from_args(header: Option<String>, param: Option<String>) -> Result<Self> {
        let key = || std::env::var("AVL_API_KEY").context("AVL_API_KEY must be set for AVL auth");
        Ok(match (header, param) {
            (Some(name), _) => Self::Header(name, key()?),
            (None, Some(name)) => Self::Param(name, key()?),
            (None, None) => Self::None,
        })
    }

    fn source(&self, url: &str, retention: chrono::Duration) -> Result<Box<dyn AvlSource>> {
        let name = format!("gtfs-rt:{url}");
        Ok(match self {
            Self::None => Box::new(GtfsRtAvlSource::new(name, BasicClient::new(), url).with_retention(retention)),
            Self::Header(header, key) => {
                let client = ApiKey::new(BasicClient::new(), header, key)?;
                Box::new(GtfsRtAvlSource::new(name, client, url).with_retention(retention))
            }
            Self::Param(param, key) => {
                let client = UrlParam::new(BasicClient::new(), param, key)?;
                Box::new(GtfsRtAvlSource::new(name, client, url).with_retention(retention))
            }
        })
    }
}

struct RunSetup {
    config: CoreConfig,
    schedule: String,
    sources: Vec<Box<dyn AvlSource>>,
    repository: Arc<dyn TravelTimeRepository>,
    sinks: Vec<Box<dyn FeedSink>>,
    feed_log: Option<String>,
    schedule_poll: Duration,
}

/// Loads a schedule and seeds the travel-time model, then wires the
/// processor that every lane shares.
async fn build_processor(
    config: &CoreConfig,
    schedule_path: &str,
    repository: &dyn TravelTimeRepository,
) -> Result<(Arc<ReportProcessor>, Arc<ScheduleHandle>)> {
    let path = schedule_path.to_string();
    let graph = tokio::task::spawn_blocking(move || load_schedule_file(&path)).await??;
    let schedule = Arc::new(ScheduleHandle::new(graph));

    let model = Arc::new(TravelTimeModel::new(config.travel_times.clone()));
    match repository.load().await {
        Ok(stats) => {
            model.seed(&stats);
            info!(buckets = stats.len(), "Travel-time model seeded");
        }
        Err(e) => warn!(error = %e, "Cannot load travel-time history, starting empty"),
    }

    let store = Arc::new(VehicleStateStore::new(config.store.max_vehicles));
    let processor = Arc::new(ReportProcessor::new(
        config.clone(),
        Arc::clone(&schedule),
        model,
        store,
    ));
    Ok((processor, schedule))
}

#[tracing::instrument(skip_all, fields(schedule = %setup.schedule))]
async fn run(setup: RunSetup) -> Result<()> {
    let RunSetup {
        config,
        schedule,
        sources,
        repository,
        sinks,
        feed_log,
        schedule_poll,
    } = setup;

    let (processor, schedule_handle) =
        build_processor(&config, &schedule, repository.as_ref()).await?;
    let (ingestor, mut lanes) = Ingestor::start(Arc::clone(&processor), &config.ingest);
    let metrics = ingestor.metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poll = Duration::from_secs(config.ingest.poll_interval_secs);
    let workers: Vec<_> = sources
        .into_iter()
        .map(|source| spawn_source_worker(source, ingestor.clone(), poll, shutdown_rx.clone()))
        .collect();

    let mut publisher = FeedPublisher::new(
        "tracker",
        FeedGenerator::new(config.feed.stopped_at_distance_m, config.prediction.grace_secs),
        Arc::clone(processor.store()),
        schedule_handle,
    );
    for sink in sinks {
        publisher = publisher.with_sink(sink);
    }
    if let Some(path) = feed_log {
        publisher = publisher.with_stats_log(path);
    }
    let publisher = Arc::new(publisher);

    let background = vec![
        spawn_publisher(
            Arc::clone(&publisher),
            Duration::from_secs(config.feed.publish_interval_secs),
            shutdown_rx.clone(),
        ),
        spawn_expiry_task(Arc::clone(&processor), shutdown_rx.clone()),
        spawn_stat_handoff(
            Arc::clone(processor.travel_times()),
            repository,
            Duration::from_secs(config.feed.stat_handoff_secs),
            shutdown_rx.clone(),
        ),
        spawn_schedule_watcher(Arc::clone(&processor), schedule, schedule_poll, shutdown_rx),
    ];

    info!(sources = workers.len(), "Tracking started. Press Ctrl+C to stop.");

    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Cannot listen for Ctrl+C");
            }
            info!("Shutdown requested");
            None
        }
        fatal = lanes.fatal() => fatal,
    };

    // Sources stop first so the lanes can drain what is already queued.
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    drop(ingestor);
    lanes.drain().await;
    publisher.publish_once().await;
    for task in background {
        let _ = task.await;
    }

    print_json(&metrics.snapshot())?;

    match fatal {
        Some(e) => Err(e).context("tracking stopped on a fatal error"),
        None => Ok(()),
    }
}

#[tracing::instrument(skip(config))]
async fn replay(
    config: CoreConfig,
    schedule: &str,
    input: &str,
    feed_out: &str,
    stats_file: &str,
) -> Result<()> {
    let repository = CsvStatRepository::new(stats_file);
    let (processor, _) = build_processor(&config, schedule, &repository).await?;

    let path = input.to_string();
    let reports = tokio::task::spawn_blocking(move || read_reports(&path)).await??;
    let Some(last_at) = reports.last().map(|r| r.timestamp) else {
        warn!("No reports to replay");
        return Ok(());
    };
    info!(reports = reports.len(), "Replaying");

    let (ingestor, lanes) = Ingestor::start(Arc::clone(&processor), &config.ingest);
    let metrics = ingestor.metrics();
    for report in reports {
        ingestor.submit(report).await?;
    }
    drop(ingestor);
    lanes.drain().await;

    let generator = FeedGenerator::new(config.feed.stopped_at_distance_m, config.prediction.grace_secs);
    let generated = generator.generate(&processor.schedule(), &processor.store().snapshot(), last_at);
    write_atomic(feed_out, &encode_feed(&generated.message)).await?;

    let mut stats = FeedStats::from_feed(&generated.message).with_name(input);
    stats.skipped_records = generated.skipped.len();
    print_json(&stats)?;

    repository.store(&processor.travel_times().snapshot()).await?;
    print_json(&metrics.snapshot())?;
    Ok(())
}
