// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic self-reporting of the nozzle's delivery counters.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::Batch;
use crate::cache::MetadataCache;
use crate::counters::DeliveryStats;
use crate::dispatch::{Accounting, Dispatcher};
use crate::envelope::EventType;
use crate::event::{Attributes, CounterAttributes, Event};

const COUNTER_KEY_PREFIX: &str = "nozzle.stats";

pub struct StatsReporter {
    dispatcher: Dispatcher,
    cache: Arc<dyn MetadataCache>,
    interval: Duration,
    last: DeliveryStats,
}

impl StatsReporter {
    pub fn new(dispatcher: Dispatcher, cache: Arc<dyn MetadataCache>, interval: Duration) -> Self {
        StatsReporter {
            dispatcher,
            cache,
            interval,
            last: DeliveryStats::default(),
        }
    }

    /// Reports every interval until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("NOZZLE | Stopping event count reporter");
                    return;
                }
                _ = ticker.tick() => {
                    let batch = self.report();
                    self.dispatcher.dispatch(batch, Accounting::Untracked).await;
                }
            }
        }
    }

    /// Builds one counter event per delivery counter with the change since
    /// the previous report.
    pub fn report(&mut self) -> Batch {
        let current = self.dispatcher.counters().snapshot();
        let previous = std::mem::replace(&mut self.last, current);
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let events = [
            ("eventsReceived", previous.received, current.received),
            ("eventsSent", previous.sent, current.sent),
            ("eventsLost", previous.lost, current.lost),
        ]
        .into_iter()
        .map(|(name, before, total)| {
            self.counter_event(&timestamp, name, total.saturating_sub(before), total)
        })
        .collect();

        Batch::new(EventType::CounterEvent.as_str(), events)
    }

    fn counter_event(&self, timestamp: &str, name: &str, delta: u64, total: u64) -> Event {
        Event {
            timestamp: timestamp.to_string(),
            attributes: Attributes {
                event_type: EventType::CounterEvent.as_str().to_string(),
                timestamp: timestamp.to_string(),
                environment: self.cache.environment_name(),
                nozzle_instance: self.cache.instance_name(),
                counter: Some(CounterAttributes {
                    name: name.to_string(),
                    delta,
                    total,
                    key: format!("{COUNTER_KEY_PREFIX}.{name}"),
                }),
                ..Default::default()
            },
        }
    }
}
