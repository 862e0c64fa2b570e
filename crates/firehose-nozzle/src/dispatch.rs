// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, concurrent delivery of batches to the sink.
//!
//! Every background delivery holds one semaphore permit for its whole life,
//! retries included. When all permits are taken [`Dispatcher::dispatch`] waits,
//! which pauses the router and lets the stream push back on the platform.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::batch::Batch;
use crate::counters::DeliveryCounters;
use crate::event::Events;
use crate::sink::SinkClient;

/// How often a failed push is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Number of attempts, back to back.
    Immediate(u32),
    /// Number of attempts, waiting `delay_ms * attempt` after each failure.
    LinearBackoff(u32, u64),
}

impl RetryStrategy {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(n) | RetryStrategy::LinearBackoff(n, _) => (*n).max(1),
        }
    }

    fn delay_after(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate(_) => None,
            RetryStrategy::LinearBackoff(_, delay_ms) => {
                Some(Duration::from_millis(delay_ms.saturating_mul(u64::from(attempt))))
            }
        }
    }
}

/// Whether a batch counts towards the delivery counters. The nozzle's own
/// statistics are shipped untracked so they do not count themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accounting {
    Tracked,
    Untracked,
}

#[derive(Clone)]
pub struct Dispatcher {
    sink: Arc<dyn SinkClient>,
    counters: DeliveryCounters,
    retry_strategy: RetryStrategy,
    permits: Arc<Semaphore>,
    capacity: u32,
}

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn SinkClient>,
        counters: DeliveryCounters,
        retry_strategy: RetryStrategy,
        concurrency: usize,
    ) -> Self {
        let capacity = u32::try_from(concurrency.max(1)).unwrap_or(u32::MAX);
        Dispatcher {
            sink,
            counters,
            retry_strategy,
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub fn counters(&self) -> &DeliveryCounters {
        &self.counters
    }

    /// Starts delivering `batch` in the background once a slot is free.
    /// Empty batches are skipped.
    pub async fn dispatch(&self, batch: Batch, accounting: Accounting) -> Option<JoinHandle<bool>> {
        if batch.is_empty() {
            return None;
        }
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(
                    "DISPATCH | Dropping {} {} events, no delivery slot available: {e}",
                    batch.len(),
                    batch.event_type()
                );
                if accounting == Accounting::Tracked {
                    self.counters.add_lost(batch.len() as u64);
                }
                return None;
            }
        };

        self.open(&batch, accounting);
        let this = self.clone();
        Some(tokio::spawn(async move {
            let delivered = this.send(batch, accounting).await;
            drop(permit);
            delivered
        }))
    }

    /// Delivers `batch` on the calling task, retrying per the configured
    /// strategy. Returns whether the sink accepted it.
    pub async fn deliver(&self, batch: Batch, accounting: Accounting) -> bool {
        if batch.is_empty() {
            return true;
        }
        self.open(&batch, accounting);
        self.send(batch, accounting).await
    }

    fn open(&self, batch: &Batch, accounting: Accounting) {
        if accounting == Accounting::Tracked {
            self.counters.begin(batch.len() as u64);
        }
    }

    async fn send(&self, batch: Batch, accounting: Accounting) -> bool {
        let size = batch.len() as u64;
        let event_type = batch.event_type().to_string();
        let events = Events::new(batch.into_events());
        let attempts = self.retry_strategy.attempts();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.push(&events).await {
                Ok(()) => {
                    debug!("DISPATCH | Delivered {size} {event_type} events");
                    if accounting == Accounting::Tracked {
                        self.counters.settle_sent(size);
                    }
                    return true;
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "DISPATCH | Attempt {attempt}/{attempts} for {size} {event_type} events failed: {e}"
                    );
                    if let Some(delay) = self.retry_strategy.delay_after(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    error!(
                        "DISPATCH | Dropping {size} {event_type} events after {attempt} attempts: {e}"
                    );
                    if accounting == Accounting::Tracked {
                        self.counters.settle_lost(size);
                    }
                    return false;
                }
            }
        }
    }

    /// Sends an operator-facing message. Failures are logged, never retried.
    pub async fn alert(&self, message: &str) {
        if let Err(e) = self.sink.alert(message).await {
            error!("DISPATCH | Failed to send alert: {e}");
        }
    }

    /// Number of background deliveries currently holding a slot.
    pub fn in_flight(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.permits.available_permits())
    }

    /// Gives up on every tracked delivery still running and counts its events
    /// as lost. Returns the number of events abandoned.
    pub fn abandon(&self) -> u64 {
        self.counters.abandon()
    }

    /// Waits until every background delivery has finished.
    pub async fn wait_idle(&self) {
        match self.permits.acquire_many(self.capacity).await {
            Ok(all) => drop(all),
            Err(e) => error!("DISPATCH | Failed to wait for deliveries: {e}"),
        }
    }
}
