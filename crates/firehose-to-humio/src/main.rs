// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use firehose_nozzle::{
    cache::MemoryCache,
    config::{
        EventFilter, NozzleConfig, SinkConfig, DEFAULT_DISPATCH_CONCURRENCY,
        DEFAULT_MAX_BATCH_SIZE,
    },
    dispatch::RetryStrategy,
    nozzle::{Nozzle, NozzleHandle},
    sink::HumioClient,
    source::{spawn_ndjson_reader, ChannelSource},
};

const ENVELOPE_BUFFER: usize = 1024;

/// Drains platform firehose envelopes (newline delimited JSON on stdin) into a
/// Humio dataspace.
#[derive(Debug, Parser)]
#[command(name = "firehose-to-humio", version)]
struct Args {
    #[arg(long, env = "HUMIO_HOST")]
    humio_host: String,

    #[arg(long, env = "HUMIO_DATASPACE")]
    humio_dataspace: String,

    #[arg(long, env = "HUMIO_INGEST_TOKEN", hide_env_values = true)]
    humio_ingest_token: String,

    /// Request timeout towards Humio, clamped to 1s..=60s.
    #[arg(long, env = "HUMIO_REQUEST_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    humio_request_timeout: Duration,

    /// Longest time an event waits before its batch is flushed.
    #[arg(long, env = "HUMIO_BATCH_TIME", default_value = "5s", value_parser = humantime::parse_duration)]
    batch_time: Duration,

    #[arg(long, env = "HUMIO_MAX_BATCH_SIZE", default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    max_batch_size: usize,

    /// Comma separated event kinds not to forward: LOG, HTTP, METRIC.
    #[arg(long, env = "EVENT_FILTER", default_value = "")]
    event_filter: EventFilter,

    #[arg(long, env = "CF_ENVIRONMENT", default_value = "cf")]
    environment: String,

    #[arg(long, env = "NOZZLE_INSTANCE", default_value = "0")]
    instance: String,

    /// Periodically ship the nozzle's own delivery counters.
    #[arg(long, env = "LOG_EVENT_COUNT", default_value_t = false)]
    log_event_count: bool,

    #[arg(long, env = "LOG_EVENT_COUNT_INTERVAL", default_value = "60s", value_parser = humantime::parse_duration)]
    log_event_count_interval: Duration,

    #[arg(long, env = "DISPATCH_CONCURRENCY", default_value_t = DEFAULT_DISPATCH_CONCURRENCY)]
    dispatch_concurrency: usize,

    /// Attempts per batch before its events are counted lost.
    #[arg(long, env = "DISPATCH_ATTEMPTS", default_value_t = 3)]
    dispatch_attempts: u32,

    #[arg(long, env = "DISPATCH_BACKOFF", default_value = "500ms", value_parser = humantime::parse_duration)]
    dispatch_backoff: Duration,

    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn nozzle_config(&self) -> NozzleConfig {
        let retry_strategy = if self.dispatch_backoff.is_zero() {
            RetryStrategy::Immediate(self.dispatch_attempts)
        } else {
            RetryStrategy::LinearBackoff(
                self.dispatch_attempts,
                u64::try_from(self.dispatch_backoff.as_millis()).unwrap_or(u64::MAX),
            )
        };
        NozzleConfig {
            batch_time: self.batch_time,
            max_batch_size: self.max_batch_size,
            dispatch_concurrency: self.dispatch_concurrency,
            retry_strategy,
            event_filter: self.event_filter,
            log_event_count: self.log_event_count,
            log_event_count_interval: self.log_event_count_interval,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", args.log_level.to_lowercase());
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level {:?}: {e}", args.log_level);
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let sink_config = match SinkConfig::new(
        args.humio_host.clone(),
        args.humio_dataspace.clone(),
        args.humio_ingest_token.clone(),
        args.humio_request_timeout,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid Humio settings: {e}");
            return ExitCode::FAILURE;
        }
    };
    let sink = match HumioClient::new(&sink_config) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!("Failed to create the Humio client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cache = Arc::new(MemoryCache::new(args.environment.clone(), args.instance.clone()));
    let (source, source_handle) = ChannelSource::new(ENVELOPE_BUFFER);
    spawn_ndjson_reader(tokio::io::stdin(), source_handle);

    let nozzle = match Nozzle::new(Arc::new(args.nozzle_config()), source, cache, sink) {
        Ok(nozzle) => nozzle,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let handle = nozzle.handle();
    tokio::spawn(wait_for_shutdown(handle.clone()));
    #[cfg(unix)]
    tokio::spawn(dump_on_signal(handle));

    info!(
        "Forwarding firehose events to {}",
        sink_config.ingest_url()
    );
    match nozzle.start().await {
        Ok(termination) => {
            info!("Nozzle stopped: {termination:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Nozzle failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_shutdown(handle: NozzleHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received interrupt, shutting down");
                }
                handle.shutdown();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
        }
        info!("Received interrupt, shutting down");
    }
    handle.shutdown();
}

#[cfg(unix)]
async fn dump_on_signal(handle: NozzleHandle) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut user1 = match signal(SignalKind::user_defined1()) {
        Ok(user1) => user1,
        Err(e) => {
            error!("Failed to install SIGUSR1 handler: {e}");
            return;
        }
    };
    while user1.recv().await.is_some() {
        let stats = handle.stats();
        info!(
            "Diagnostics: state {:?}, {} received, {} sent, {} lost, {} deliveries in flight",
            handle.state(),
            stats.received,
            stats.sent,
            stats.lost,
            handle.in_flight()
        );
    }
}
