pub mod channels;
pub mod clock;
pub mod config;
pub mod error;
pub mod mppt;
pub mod options;
pub mod prelude;
pub mod scheduler;
pub mod sink;
pub mod stations;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use crate::clock::TokioClock;
use crate::mppt::session::TcpConnector;
use crate::scheduler::Scheduler;
use crate::sink::{Database, DatabaseChannel, DatalogWriter, LogLine, Sink};

use std::sync::Arc;
use tokio::task::JoinHandle;

fn init_logging(level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {}", e);
    }
}

/// The configured record sinks plus the databases behind the channel sink.
pub struct Sinks {
    pub sinks: Vec<Sink>,
    pub databases: Vec<Database>,
    pub database_channel: Option<DatabaseChannel>,
}

/// Builds the configured sinks. All databases share one channel sink, so every
/// record is sent once and each inserter sees it once.
pub fn build_sinks(config: &ConfigWrapper, channels: &Channels, registry: &SchemaRegistry) -> Result<Sinks> {
    let mut sinks: Vec<Sink> = Vec::new();

    if config.log_line() {
        sinks.push(LogLine::new().into());
    }

    if let Some(path) = config.datalog_file() {
        sinks.push(DatalogWriter::new(path)?.into());
    }

    let databases: Vec<Database> = config
        .enabled_databases()
        .map(|db| Database::new(db.clone(), channels.clone(), registry))
        .collect();

    let database_channel = if databases.is_empty() {
        None
    } else {
        let channel = DatabaseChannel::new(channels.clone());
        sinks.push(channel.clone().into());
        Some(channel)
    };
    info!("  {} sinks configured, {} databases", sinks.len(), databases.len());

    Ok(Sinks {
        sinks,
        databases,
        database_channel,
    })
}

fn start_databases(databases: &[Database]) -> Vec<JoinHandle<()>> {
    databases
        .iter()
        .map(|database| {
            let receiver = database.subscribe();
            let task = database.clone();
            tokio::spawn(async move {
                if let Err(e) = task.start(receiver).await {
                    error!("Database task failed: {}", e);
                }
            })
        })
        .collect()
}

pub async fn app(shutdown_rx: broadcast::Receiver<()>, options: Options) -> Result<()> {
    let config = match ConfigWrapper::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            error!("Failed to load config {}: {:?}", options.config_file, err);
            return Err(err);
        }
    };

    init_logging(config.loglevel());
    info!("mppt-bridge {} starting with config file: {}", CARGO_PKG_VERSION, options.config_file);
    config.log_summary();

    let registry = match SchemaRegistry::load() {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!("register table is invalid: {}", err);
            return Err(err.into());
        }
    };

    let channels = Channels::new();

    info!("Initializing sinks...");
    let Sinks {
        sinks,
        databases,
        database_channel,
    } = build_sinks(&config, &channels, &registry)?;
    let database_handles = start_databases(&databases);

    let connector = TcpConnector {
        use_tcp_nodelay: config.use_tcp_nodelay(),
    };
    let scheduler = Scheduler::new(config.clone(), registry, connector, TokioClock, sinks);

    let result = if options.once {
        scheduler.run_once().await
    } else {
        scheduler.run(shutdown_rx).await
    };

    info!("Stopping databases...");
    if let Some(channel) = &database_channel {
        channel.stop();
    }
    for handle in database_handles {
        if let Err(e) = handle.await {
            error!("Error waiting for database task: {}", e);
        }
    }

    match scheduler.stats.lock() {
        Ok(stats) => stats.print_summary(),
        Err(_) => warn!("poll stats unavailable"),
    }

    info!("Application shutdown complete");
    result
}
