// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Immutable nozzle configuration.
//!
//! Values are built once at startup (the binary fills them from flags and
//! environment variables) and shared with the engine behind an `Arc`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::dispatch::RetryStrategy;
use crate::envelope::EventType;

pub const DEFAULT_BATCH_TIME: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
/// Upper limit of events per ingest request.
pub const MAX_BATCH_SIZE_CEILING: usize = 10_000;
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 8;
pub const DEFAULT_LOG_EVENT_COUNT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch time must be greater than zero")]
    InvalidBatchTime,

    #[error("max batch size must be between 1 and 10000, got {0}")]
    InvalidMaxBatchSize(usize),

    #[error("dispatch concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("event count interval must be greater than zero")]
    InvalidEventCountInterval,

    #[error("unknown event kind in filter: {0}")]
    UnknownEventKind(String),

    #[error("{0} must not be empty")]
    MissingSinkSetting(&'static str),
}

/// Event kinds the operator asked not to forward.
///
/// Parsed from a comma separated list of `LOG`, `HTTP` and `METRIC`. Metric
/// kinds are never forwarded, `METRIC` is accepted so existing deployments
/// keep working.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub exclude_log: bool,
    pub exclude_http: bool,
    pub exclude_metric: bool,
}

impl EventFilter {
    pub fn excludes(&self, event_type: EventType) -> bool {
        match event_type {
            EventType::LogMessage | EventType::Error => self.exclude_log,
            EventType::HttpStartStop => self.exclude_http,
            EventType::ValueMetric | EventType::CounterEvent | EventType::ContainerMetric => {
                self.exclude_metric
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == EventFilter::default()
    }
}

impl FromStr for EventFilter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut filter = EventFilter::default();
        for kind in s.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            match kind.to_uppercase().as_str() {
                "LOG" => filter.exclude_log = true,
                "HTTP" => filter.exclude_http = true,
                "METRIC" => filter.exclude_metric = true,
                _ => return Err(ConfigError::UnknownEventKind(kind.to_string())),
            }
        }
        Ok(filter)
    }
}

/// Settings of the routing engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NozzleConfig {
    /// Longest time an event waits in a pending batch.
    pub batch_time: Duration,
    /// Events per batch that trigger an immediate flush.
    pub max_batch_size: usize,
    /// Number of ingest requests allowed in flight at once.
    pub dispatch_concurrency: usize,
    pub retry_strategy: RetryStrategy,
    pub event_filter: EventFilter,
    /// Periodically ship the nozzle's own delivery counters.
    pub log_event_count: bool,
    pub log_event_count_interval: Duration,
    /// Bound on draining pending and in-flight batches at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for NozzleConfig {
    fn default() -> Self {
        NozzleConfig {
            batch_time: DEFAULT_BATCH_TIME,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            retry_strategy: RetryStrategy::LinearBackoff(3, 500),
            event_filter: EventFilter::default(),
            log_event_count: false,
            log_event_count_interval: DEFAULT_LOG_EVENT_COUNT_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl NozzleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_time.is_zero() {
            return Err(ConfigError::InvalidBatchTime);
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_CEILING {
            return Err(ConfigError::InvalidMaxBatchSize(self.max_batch_size));
        }
        if self.dispatch_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.log_event_count && self.log_event_count_interval.is_zero() {
            return Err(ConfigError::InvalidEventCountInterval);
        }
        Ok(())
    }
}

/// Where and how batches are delivered.
#[derive(Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub host: String,
    pub dataspace: String,
    pub ingest_token: String,
    pub request_timeout: Duration,
}

impl SinkConfig {
    /// Request timeouts outside of 1..=60 seconds are clamped.
    pub fn new(
        host: impl Into<String>,
        dataspace: impl Into<String>,
        ingest_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let host = host.into();
        let dataspace = dataspace.into();
        let ingest_token = ingest_token.into();
        if host.trim().is_empty() {
            return Err(ConfigError::MissingSinkSetting("Humio host"));
        }
        if dataspace.trim().is_empty() {
            return Err(ConfigError::MissingSinkSetting("Humio dataspace"));
        }
        if ingest_token.trim().is_empty() {
            return Err(ConfigError::MissingSinkSetting("Humio ingest token"));
        }

        let clamped = request_timeout.clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT);
        if clamped != request_timeout {
            warn!(
                "Humio request timeout {:?} is out of range, using {:?}",
                request_timeout, clamped
            );
        }

        Ok(SinkConfig {
            host,
            dataspace,
            ingest_token,
            request_timeout: clamped,
        })
    }

    pub fn ingest_url(&self) -> String {
        format!(
            "{}/api/v1/dataspaces/{}/ingest",
            self.host.trim_end_matches('/'),
            self.dataspace
        )
    }
}

// The ingest token is a credential and stays out of logs.
impl fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkConfig")
            .field("host", &self.host)
            .field("dataspace", &self.dataspace)
            .field("ingest_token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
