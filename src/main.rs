use anyhow::Context;
use clap::{Parser, Subcommand};
use graph_streams::config::{self, DEFAULT_DATABASE};
use graph_streams::kafka::{SinkConsumer, TopicValidator};
use graph_streams::routing::SourceConfiguration;
use graph_streams::sink::{LoggingWriter, SinkHandler};
use graph_streams::RawConfig;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SINK_ENABLED: &str = "streams.sink.enabled";

#[derive(Parser, Debug)]
#[command(name = "graph-streams")]
#[command(about = "Graph database change streams to Kafka, and Kafka to graph writes", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long = "set", value_name = "KEY=VALUE", help = "Override a configuration key")]
    set: Vec<String>,

    #[arg(long, default_value = DEFAULT_DATABASE, help = "Database to resolve the configuration for")]
    database: String,

    #[arg(long, default_value = DEFAULT_DATABASE, help = "Name of the default database")]
    default_database: String,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved broker properties, sink templates and source routes
    Resolve,
    /// List configured sink topics missing on the broker
    Topics {
        #[arg(long, default_value_t = 30, help = "Seconds to wait for the first topic poll")]
        timeout: u64,
    },
    /// Consume the sink topics and log each statement instead of writing it
    Sink,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    let raw = load_config(&args)?;
    let is_default_db = args.database == args.default_database;
    info!(
        database = %args.database,
        default = is_default_db,
        keys = raw.len(),
        "Configuration loaded"
    );

    match args.command {
        Command::Resolve => resolve(&raw, &args.database, is_default_db),
        Command::Topics { timeout } => topics(&raw, &args.database, is_default_db, timeout).await,
        Command::Sink => sink(&raw, &args.database, is_default_db).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<RawConfig> {
    let mut raw = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            RawConfig::from_file(path).with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => RawConfig::new(),
    };
    for entry in &args.set {
        let (key, value) = RawConfig::parse_override(entry)?;
        raw.set(key, value);
    }
    Ok(raw)
}

fn resolve(raw: &RawConfig, database: &str, is_default_db: bool) -> anyhow::Result<()> {
    let (kafka, topics) = config::resolve(raw, database, is_default_db)?;
    let source = SourceConfiguration::resolve(raw, database, is_default_db)?;

    let resolved = json!({
        "database": database,
        "kafka": kafka.as_properties(),
        "sink": topics.cypher_topics(),
        "source": {
            "enabled": source.enabled,
            "keyStrategy": format!("{:?}", source.key_strategy),
            "topics": source.routes.topics(),
            "routes": source.routes,
        },
    });
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

async fn topics(raw: &RawConfig, database: &str, is_default_db: bool, timeout: u64) -> anyhow::Result<()> {
    let (kafka, topics) = config::resolve_validated(raw, database, is_default_db).await?;
    let validator = TopicValidator::from_config(&kafka, topics.topics())?;

    validator.start().await?;
    if tokio::time::timeout(Duration::from_secs(timeout), validator.wait_for_polls(1))
        .await
        .is_err()
    {
        warn!("No topic poll completed within {}s", timeout);
    }

    for topic in validator.invalid_topics() {
        println!("{topic}");
    }
    validator.stop().await?;
    Ok(())
}

async fn sink(raw: &RawConfig, database: &str, is_default_db: bool) -> anyhow::Result<()> {
    if !raw.get_bool(SINK_ENABLED, true)? {
        info!("Sink disabled by `{}`", SINK_ENABLED);
        return Ok(());
    }

    let (kafka, topics) = config::resolve_validated(raw, database, is_default_db).await?;
    let consumer = SinkConsumer::new(&kafka, &topics).context("Failed to start the sink consumer")?;
    let validator = TopicValidator::from_config(&kafka, topics.topics())?;
    let handler = SinkHandler::new(topics, LoggingWriter);
    validator.start().await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        signal.cancel();
    });

    validator.wait_for_polls(1).await;
    let invalid = validator.invalid_topics();
    if !invalid.is_empty() {
        warn!(topics = ?invalid, "Sink topics not found on the broker");
    }

    info!(topics = ?consumer.topics(), "Starting dry-run sink");
    let result = consumer.run(&handler, shutdown).await;
    validator.stop().await?;
    result?;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("graph_streams=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("graph_streams=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}
