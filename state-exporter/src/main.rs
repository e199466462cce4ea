use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use state_exporter::app::{app, listen, setup_metrics_recorder};
use state_exporter::config::{Config, LogFormat};
use state_exporter::destination::influxdb::{
    InfluxDbClient, InfluxDbExportStatusSink, InfluxDbStateRepository,
};
use state_exporter::destination::{ExportStatusSink, StateRepository};
use state_exporter::exporter::{ExporterPorts, StateExporter};
use state_exporter::health::HealthRegistry;
use state_exporter::properties::ExportConfiguration;
use state_exporter::scheduler::{Clock, JobScheduler, SystemClock};
use state_exporter::source::api::ApiMetadataProvider;
use state_exporter::source::sql::SqlStateProvider;
use state_exporter::strategy::ProcessingStrategyResolver;

const EXPORT_JOB: &str = "exporter";

fn setup_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level.parse()?)
        .from_env_lossy();

    let log_layer = match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_filter(filter).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed(),
    };
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

async fn shutdown() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutdown signal received");
    Ok(())
}

fn build_exporter(config: &Config, clock: Arc<dyn Clock>) -> Result<StateExporter> {
    let settings = config
        .exporter_settings()
        .wrap_err("invalid exporter settings")?;
    let pipeline = ExportConfiguration::load(&config.config_location)
        .wrap_err("invalid export configuration")?
        .into_pipeline();
    let timeout = config.http_timeout_ms.0;

    let influxdb = InfluxDbClient::new(
        &config.influxdb.url,
        &config.influxdb.org,
        &config.influxdb.token,
        timeout,
    )
    .wrap_err("failed to create InfluxDB client")?;
    let repository: Arc<dyn StateRepository> = Arc::new(InfluxDbStateRepository::new(
        influxdb.clone(),
        &config.influxdb.bucket,
    ));
    let status_sink = config.influxdb.status_bucket().map(|bucket| {
        let sink: Arc<dyn ExportStatusSink> =
            Arc::new(InfluxDbExportStatusSink::new(influxdb.clone(), bucket));
        sink
    });
    if status_sink.is_none() {
        info!("no status bucket configured, export statuses will not be stored");
    }

    let ports = ExporterPorts {
        metadata: Arc::new(ApiMetadataProvider::new(
            &config.homeassistant_url,
            &config.homeassistant_token,
            timeout,
        )
        .wrap_err("failed to create Home Assistant client")?),
        source: Arc::new(SqlStateProvider::new(
            &config.database_url,
            config.max_db_connections,
        )
        .wrap_err("failed to create database pool")?),
        repository: Arc::clone(&repository),
        status_sink,
    };

    let strategy_resolver = ProcessingStrategyResolver::new(
        repository,
        chrono::Duration::from_std(config.lag_threshold_ms.0)?,
    );

    Ok(StateExporter::new(
        ports,
        pipeline,
        strategy_resolver,
        settings,
        clock,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    setup_tracing(&config)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let exporter = Arc::new(build_exporter(&config, Arc::clone(&clock))?);
    let interval = config.export_interval_ms.0;

    let liveness = HealthRegistry::new("liveness");
    let exporter_liveness =
        liveness.register(EXPORT_JOB, chrono::Duration::from_std(interval * 4)?);

    let metrics = setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;
    let http_server = tokio::spawn(listen(app(liveness, Some(metrics)), config.bind()));

    if config.export_on_startup {
        info!("running startup export");
        exporter.export().await;
    }
    exporter_liveness.report_healthy();

    let mut scheduler = JobScheduler::new(clock);
    scheduler.schedule_job(EXPORT_JOB, interval, move || {
        let exporter = Arc::clone(&exporter);
        let liveness = exporter_liveness.clone();
        async move {
            let status = exporter.export().await;
            liveness.report_healthy();
            match status.error {
                None => Ok(()),
                Some(error) => Err(error),
            }
        }
    })?;

    tokio::select! {
        res = http_server => {
            error!("http server exited");
            if let Ok(Err(e)) = res {
                error!("server failed with: {}", e)
            }
        }
        res = shutdown() => {
            if let Err(e) = res {
                warn!("failed to listen for shutdown signals: {}", e);
            }
        }
    }

    scheduler.shutdown().await;
    info!("exiting");
    Ok(())
}
