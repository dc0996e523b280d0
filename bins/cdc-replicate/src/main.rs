//! Process entry point for the CDC replication engine: parses the CLI,
//! loads and validates the pipeline configuration, wires the three
//! concurrent tasks from spec.md §5 (Source Driver+Decoder+Filters,
//! Batcher, metrics endpoint), and owns the single cancellation token
//! every task observes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use cdc_connectors::{MongoSourceDriver, MysqlSourceDriver, SharedSchemaCache, StarrocksSink};
use cdc_core::channel::bounded;
use cdc_core::config::PipelineConfig;
use cdc_core::error::CdcError;
use cdc_core::filter::FilterChain;
use cdc_core::logger::LoggerHandle;
use cdc_core::msg::SourceKind;
use cdc_core::position::PositionStore;
use cdc_core::rule::RuleTable;
use cdc_core::traits::SourceDriver;
use cdc_core::Batcher;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line surface from spec.md §6.
#[derive(Parser, Debug)]
#[command(name = "cdc-replicate")]
#[command(about = "Tails an upstream binlog/change-stream and replicates it to a StarRocks sink")]
struct Args {
    /// Pipeline configuration file.
    #[arg(long = "config")]
    config: PathBuf,

    /// Diagnostic selector; does not affect replication.
    #[arg(long = "output")]
    output: Option<String>,

    /// Metrics endpoint port.
    #[arg(long = "http-port", default_value_t = 6166)]
    http_port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!(error = %err, "cdc-replicate exiting with a fatal error");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    if let Some(output) = &args.output {
        info!(output, "diagnostic output selector set (informational only)");
    }

    let (config, warnings) =
        PipelineConfig::load(&args.config).context("loading pipeline configuration")?;
    for warning in &warnings {
        warn!("{warning}");
    }
    info!(pipeline = %config.name, "starting pipeline");

    let rules = RuleTable::build(&config.rules).context("building rule table")?;
    let filters = FilterChain::build(&config.filters).context("building filter chain")?;
    let schema_cache = Arc::new(SharedSchemaCache::new());

    let cancel = CancellationToken::new();

    let (mut source, position): (Box<dyn SourceDriver>, PositionStore) =
        if let Some(mysql) = &config.mysql {
            let driver = MysqlSourceDriver::new(
                &mysql.host,
                mysql.port,
                &mysql.username,
                &mysql.password,
                filters,
            );
            driver
                .populate_schema_cache(&rules, &schema_cache)
                .await
                .context("populating schema cache from mysql")?;
            let position = PositionStore::load(config.position_file_path(), SourceKind::Binlog, || {
                futures_block_on(driver.current_gtid_set())
            })
            .context("loading position store")?;
            (Box::new(driver), position)
        } else {
            let mongo = config
                .mongo
                .as_ref()
                .expect("config guarantees mysql or mongo is present");
            let driver = MongoSourceDriver::connect(
                &mongo.host,
                mongo.port,
                &mongo.username,
                &mongo.password,
                filters,
            )
            .await
            .context("connecting to mongo")?;
            driver.populate_schema_cache(&rules, &schema_cache);
            let position = PositionStore::load(config.position_file_path(), SourceKind::Stream, || {
                futures_block_on(driver.current_resume_token())
            })
            .context("loading position store")?;
            (Box::new(driver), position)
        };

    let sink = Box::new(StarrocksSink::new(
        &config.starrocks.host,
        config.starrocks.port,
        &config.starrocks.username,
        &config.starrocks.password,
    ));

    let flush_delay = Duration::from_secs(config.sync_param.flush_delay_second);
    let resume_from = position.current().clone();
    let mut batcher = Batcher::new(sink, position, schema_cache.clone(), flush_delay);

    let (tx, rx) = bounded(config.sync_param.channel_size);

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")?;

    let source_cancel = cancel.clone();
    let source_logger = LoggerHandle::new("source-driver");
    let source_task = tokio::spawn(async move {
        source
            .run(tx, &rules, resume_from, source_cancel.clone())
            .await
            .map_err(|e| {
                let fatal = source_logger.fatal(e);
                source_cancel.cancel();
                fatal
            })
    });

    let batcher_cancel = cancel.clone();
    let batcher_logger = LoggerHandle::new("batcher");
    let batcher_task = tokio::spawn(async move {
        batcher
            .run(rx, batcher_cancel.clone())
            .await
            .map_err(|e| {
                let fatal = batcher_logger.fatal(e);
                batcher_cancel.cancel();
                fatal
            })
    });

    let metrics_cancel = cancel.clone();
    let http_port = args.http_port;
    let metrics_task = tokio::spawn(async move {
        serve_metrics(http_port, metrics_handle, metrics_cancel).await
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move { watch_signals(signal_cancel).await });

    let (source_result, batcher_result) = tokio::join!(source_task, batcher_task);
    cancel.cancel();
    let _ = metrics_task.await;

    source_result.context("source driver task panicked")?.map_err(as_anyhow)?;
    batcher_result.context("batcher task panicked")?.map_err(as_anyhow)?;
    Ok(())
}

fn as_anyhow(err: CdcError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

/// Waits for a future without actually suspending the running task — this
/// pipeline's only pre-loop bootstrap call needs a plain synchronous
/// closure signature (`PositionStore::load`'s `bootstrap` parameter), and
/// the bootstrap queries themselves are single round trips run once at
/// startup before either T1 or T2 begins, so blocking the async runtime
/// briefly here is acceptable.
fn futures_block_on<F: std::future::Future<Output = Result<cdc_core::msg::Cursor, CdcError>>>(
    fut: F,
) -> Result<cdc_core::msg::Cursor, CdcError> {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
}

/// T3: exposes `GET /metrics` rendered from the process-wide Prometheus
/// recorder (spec.md §6). Isolated from the replication path — a bind or
/// accept failure here is logged but never cancels the pipeline.
async fn serve_metrics(
    port: u16,
    handle: metrics_exporter_prometheus::PrometheusHandle,
    cancel: CancellationToken,
) {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(error = %e, port, "metrics endpoint failed to bind, continuing without it");
            return;
        }
    };
    info!(port, "metrics endpoint listening");

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                warn!(error = %e, "metrics endpoint stopped unexpectedly");
            }
        }
        _ = cancel.cancelled() => {
            info!("metrics endpoint shutting down");
        }
    }
}

/// Single cancellation source fed by every signal the spec names
/// (SIGINT, SIGTERM, SIGHUP, SIGQUIT), collapsing the duplicate
/// `Ctx().Done()` select arm noted in spec.md §9 into one token.
async fn watch_signals(cancel: CancellationToken) {
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("installing SIGHUP handler");
    let mut sigquit = signal(SignalKind::quit()).expect("installing SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sighup.recv() => info!("received SIGHUP"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
