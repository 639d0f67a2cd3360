pub mod channels;
pub mod config;
pub mod datalog_writer;
pub mod device;
pub mod device_cache;
pub mod error;
pub mod influx;
pub mod instance;
pub mod modbus;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod sunspec;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::datalog_writer::DatalogWriter;
use crate::device_cache::{DeviceCache, SqliteStore};
use crate::influx::Influx;
use crate::instance::InstanceGuard;
use crate::modbus::{RegisterTransport, TcpConnector, TokioSleeper, Transport, TransportSettings};
use crate::mqtt::{Mqtt, MqttSink};
use crate::options::Options;
use crate::scheduler::{ScheduleSettings, Scheduler};
use crate::sink::SinkBinding;
use crate::stats::{PollStats, SharedStats};
use crate::sunspec::{FlagLookup, ModelReader, ModelSchema, ReaderSettings};

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long sinks get to drain after the pollers have stopped.
const SINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-lived parts of a running bridge, torn down in reverse order of
/// the data flow.
pub struct Components {
    pub schedulers: Vec<JoinHandle<()>>,
    pub transport: Arc<Transport>,
    pub mqtt: Option<(Mqtt, JoinHandle<()>)>,
    pub influx: Option<(Influx, JoinHandle<()>)>,
    pub store: SqliteStore,
    pub shared_stats: SharedStats,
}

impl Components {
    /// Pollers finish their in-flight device first, then connections are
    /// closed, then sinks flush.
    pub async fn stop(self, stop_pollers: broadcast::Sender<()>) {
        info!("Stopping all components...");

        let _ = stop_pollers.send(());
        for handle in self.schedulers {
            if let Err(e) = handle.await {
                error!("Error waiting for poller task: {}", e);
            }
        }

        self.transport.close().await;

        if let Some((influx, handle)) = self.influx {
            influx.stop();
            if tokio::time::timeout(SINK_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("InfluxDB sender did not finish in {:?}", SINK_DRAIN_TIMEOUT);
            }
        }
        if let Some((mqtt, handle)) = self.mqtt {
            mqtt.stop();
            if tokio::time::timeout(SINK_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("MQTT client did not finish in {:?}", SINK_DRAIN_TIMEOUT);
            }
        }

        self.store.close().await;

        if let Ok(stats) = self.shared_stats.lock() {
            stats.print_summary();
        }
        info!("Shutdown complete");
    }
}

pub fn init_logging(level: &str) {
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

fn load_schema(config: &ConfigWrapper) -> Result<(Arc<ModelSchema>, Arc<FlagLookup>)> {
    let general = config.general();

    let schema = match general.schema_file() {
        Some(file) => ModelSchema::from_file(file)?,
        None => ModelSchema::builtin()?,
    };
    info!("Model schema: {} models", schema.len());

    let flags = match general.flags_file() {
        Some(file) => FlagLookup::from_file(file)?,
        None => FlagLookup::builtin()?,
    };

    Ok((Arc::new(schema), Arc::new(flags)))
}

/// Main application entry point: runs until `shutdown_rx` fires.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, options: Options) -> Result<()> {
    let config = match ConfigWrapper::new(options.config_file.clone()) {
        Ok(config) => {
            init_logging(&config.loglevel());
            config
        }
        Err(err) => {
            init_logging("info");
            error!("Failed to load config {}: {:?}", options.config_file, err);
            return Err(err);
        }
    };

    info!("sunspec-bridge {} starting", CARGO_PKG_VERSION);
    info!("Reading configuration from {}", options.config_file);
    config.log_summary();

    let general = config.general();
    let _instance = InstanceGuard::acquire(general.pid_file(), options.force)?;

    let (schema, flags) = load_schema(&config)?;

    let store = SqliteStore::open(general.cache_file()).await?;
    let cache =
        Arc::new(DeviceCache::load(Arc::new(store.clone()), general.float_tolerance()).await?);

    let channels = Channels::new();
    let shared_stats = PollStats::shared();

    let datalog = general.datalog_file().map(DatalogWriter::new).transpose()?;

    let transport = Arc::new(Transport::new(
        Arc::new(TcpConnector),
        Arc::new(TokioSleeper),
        TransportSettings::from_config(&config),
        shared_stats.clone(),
    ));

    info!("Initializing sinks...");
    let mut sinks = Vec::new();

    let mqtt = if config.mqtt().enabled() {
        let mqtt = Mqtt::new(config.clone(), channels.clone(), shared_stats.clone());
        let runner = mqtt.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = runner.start().await {
                error!("MQTT task failed: {}", e);
            }
        });
        sinks.push(SinkBinding::new(
            Arc::new(MqttSink::new(&channels, config.mqtt().retain())),
            general.publish_mode(),
        ));
        Some((mqtt, handle))
    } else {
        info!("mqtt disabled, skipping");
        None
    };

    let influx = if config.influx().enabled() {
        let influx = Influx::new(config.clone(), channels.clone(), shared_stats.clone());
        let runner = influx.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = runner.start().await {
                error!("InfluxDB task failed: {}", e);
            }
        });
        sinks.push(SinkBinding::new(
            Arc::new(influx.clone()),
            config.influx_publish_mode(),
        ));
        Some((influx, handle))
    } else {
        info!("influx disabled, skipping");
        None
    };

    if sinks.is_empty() {
        warn!("no sinks enabled, values will only be cached");
    }

    let (stop_pollers, _) = broadcast::channel(1);
    let mut schedulers = Vec::new();
    for class in options.device.classes() {
        let reader = ModelReader::new(
            transport.clone(),
            schema.clone(),
            flags.clone(),
            ReaderSettings::from_config(&config, class),
        )
        .with_datalog(datalog.clone());

        let scheduler = Scheduler::new(
            class,
            config.device_ids(class),
            Arc::new(reader),
            cache.clone(),
            sinks.clone(),
            ScheduleSettings::from_config(&config, class),
            shared_stats.clone(),
        );

        let stop = stop_pollers.subscribe();
        schedulers.push(tokio::spawn(async move {
            if let Err(e) = scheduler.start(stop).await {
                error!("{} poller failed: {}", class, e);
            }
        }));
    }

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;
    info!("Shutdown signal received, stopping components...");

    let components = Components {
        schedulers,
        transport,
        mqtt,
        influx,
        store,
        shared_stats,
    };
    components.stop(stop_pollers).await;

    Ok(())
}
