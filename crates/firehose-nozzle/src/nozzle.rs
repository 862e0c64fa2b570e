// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The routing and batching engine.
//!
//! One control loop reacts to whichever comes first: an envelope, a flush
//! tick, a stream error or an operator shutdown. Envelopes are transformed and
//! appended to per-type pending batches; a batch leaves the loop either when it
//! reaches `max_batch_size` or on the next tick, and is handed to the
//! [`Dispatcher`], which may block the loop while every delivery slot is busy.
//!
//! ```text
//!   Running ──shutdown──> Draining ──pending delivered / timeout──> Terminated
//!      │                                                               ^
//!      ├──stream error──> Draining ──pending delivered inline──────────┤
//!      └──stream ended──────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::PendingBatches;
use crate::cache::MetadataCache;
use crate::config::NozzleConfig;
use crate::counters::{DeliveryCounters, DeliveryStats};
use crate::dispatch::{Accounting, Dispatcher};
use crate::envelope::Envelope;
use crate::error::NozzleError;
use crate::sink::SinkClient;
use crate::source::{Connection, StreamError, StreamSource};
use crate::stats::StatsReporter;
use crate::transform::Transformer;

pub const SLOW_CONSUMER_ALERT: &str =
    "Disconnected because nozzle couldn't keep up. Please try scaling up the nozzle.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NozzleState {
    Running,
    Draining,
    Terminated,
}

/// Why a nozzle run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The operator asked the nozzle to stop.
    Shutdown,
    /// The stream source ran out of envelopes.
    SourceClosed,
}

/// Control and inspection of a running nozzle from other tasks.
#[derive(Clone)]
pub struct NozzleHandle {
    cancel: CancellationToken,
    state: watch::Receiver<NozzleState>,
    dispatcher: Dispatcher,
}

impl NozzleHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> NozzleState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.dispatcher.counters().snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Resolves once the nozzle reached [`NozzleState::Terminated`].
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        // An error means the nozzle was dropped, which is terminal too.
        let _ = state.wait_for(|s| *s == NozzleState::Terminated).await;
    }
}

pub struct Nozzle<S: StreamSource> {
    config: Arc<NozzleConfig>,
    source: S,
    cache: Arc<dyn MetadataCache>,
    transformer: Transformer,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    state: watch::Sender<NozzleState>,
    // Keeps the channel open so state updates never fail.
    state_rx: watch::Receiver<NozzleState>,
}

impl<S: StreamSource> Nozzle<S> {
    pub fn new(
        config: Arc<NozzleConfig>,
        source: S,
        cache: Arc<dyn MetadataCache>,
        sink: Arc<dyn SinkClient>,
    ) -> Result<Self, NozzleError> {
        config.validate()?;
        let dispatcher = Dispatcher::new(
            sink,
            DeliveryCounters::new(),
            config.retry_strategy,
            config.dispatch_concurrency,
        );
        let (state, state_rx) = watch::channel(NozzleState::Running);
        Ok(Nozzle {
            transformer: Transformer::new(cache.clone(), config.event_filter),
            config,
            source,
            cache,
            dispatcher,
            cancel: CancellationToken::new(),
            state,
            state_rx,
        })
    }

    pub fn handle(&self) -> NozzleHandle {
        NozzleHandle {
            cancel: self.cancel.clone(),
            state: self.state_rx.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Runs the nozzle until it is shut down, the source ends or the stream
    /// fails.
    pub async fn start(mut self) -> Result<Termination, NozzleError> {
        info!(
            "NOZZLE | Starting with batch time {:?}, max batch size {}, dispatch concurrency {}",
            self.config.batch_time, self.config.max_batch_size, self.config.dispatch_concurrency
        );
        self.cache.initialize();
        let connection = self.source.connect();

        let stats_cancel = self.cancel.child_token();
        if self.config.log_event_count {
            let reporter = StatsReporter::new(
                self.dispatcher.clone(),
                self.cache.clone(),
                self.config.log_event_count_interval,
            );
            tokio::spawn(reporter.run(stats_cancel.clone()));
        }

        let result = self.route_events(connection).await;

        stats_cancel.cancel();
        self.state.send_replace(NozzleState::Terminated);
        let stats = self.dispatcher.counters().snapshot();
        info!(
            "NOZZLE | Stopped: {} received, {} sent, {} lost",
            stats.received, stats.sent, stats.lost
        );
        result
    }

    async fn route_events(&mut self, mut connection: Connection) -> Result<Termination, NozzleError> {
        let mut pending = PendingBatches::new(self.config.max_batch_size);
        let batch_time = self.config.batch_time;
        let mut ticker = interval_at(Instant::now() + batch_time, batch_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("NOZZLE | Shutdown requested");
                    self.drain(pending).await;
                    return Ok(Termination::Shutdown);
                }
                _ = ticker.tick() => {
                    for batch in pending.take_all() {
                        debug!("NOZZLE | Flushing {} {} events on timer", batch.len(), batch.event_type());
                        self.dispatcher.dispatch(batch, Accounting::Tracked).await;
                    }
                }
                envelope = connection.events.recv() => {
                    let Some(envelope) = envelope else {
                        // A source that fails and then hangs up leaves the error queued.
                        if let Ok(err) = connection.errors.try_recv() {
                            self.fail(&err, &mut pending).await;
                            return Err(NozzleError::Stream(err));
                        }
                        info!("NOZZLE | Firehose stream ended");
                        self.finish(&mut pending).await;
                        self.close_source().await;
                        return Ok(Termination::SourceClosed);
                    };
                    self.route(&envelope, &mut pending).await;
                }
                Some(err) = connection.errors.recv() => {
                    // Envelopes read before the failure are still delivered.
                    while let Ok(envelope) = connection.events.try_recv() {
                        self.route(&envelope, &mut pending).await;
                    }
                    self.fail(&err, &mut pending).await;
                    return Err(NozzleError::Stream(err));
                }
            }
        }
    }

    async fn route(&self, envelope: &Envelope, pending: &mut PendingBatches) {
        self.dispatcher.counters().add_received(1);
        if let Some(event) = self.transformer.transform(envelope) {
            if let Some(batch) = pending.push(event) {
                debug!("NOZZLE | Flushing full batch of {} {} events", batch.len(), batch.event_type());
                self.dispatcher.dispatch(batch, Accounting::Tracked).await;
            }
        }
    }

    /// Operator shutdown: stop reading, then deliver what is pending within
    /// `shutdown_timeout`. Events still undelivered at the deadline count as
    /// lost.
    async fn drain(&mut self, mut pending: PendingBatches) {
        self.state.send_replace(NozzleState::Draining);
        self.close_source().await;

        let batches = pending.take_all();
        let mut undispatched: u64 = batches.iter().map(|b| b.len() as u64).sum();
        let dispatcher = self.dispatcher.clone();
        let delivery = async {
            for batch in batches {
                let size = batch.len() as u64;
                dispatcher.dispatch(batch, Accounting::Tracked).await;
                undispatched -= size;
            }
            dispatcher.wait_idle().await;
        };
        if timeout(self.config.shutdown_timeout, delivery).await.is_ok() {
            info!("NOZZLE | Pending batches delivered");
            return;
        }

        let in_flight = self.dispatcher.in_flight();
        let abandoned = self.dispatcher.abandon();
        self.dispatcher.counters().add_lost(undispatched);
        warn!(
            "NOZZLE | Shutdown timeout of {:?} elapsed, abandoning {} in-flight deliveries, {} events lost",
            self.config.shutdown_timeout,
            in_flight,
            abandoned + undispatched
        );
    }

    async fn fail(&mut self, err: &StreamError, pending: &mut PendingBatches) {
        self.state.send_replace(NozzleState::Draining);
        error!("NOZZLE | Error while reading from the firehose: {err}");
        if err.is_slow_consumer() {
            error!("NOZZLE | {SLOW_CONSUMER_ALERT}");
            self.dispatcher.alert(SLOW_CONSUMER_ALERT).await;
        }
        self.finish(pending).await;
        self.close_source().await;
    }

    /// Delivers pending batches on this task and waits for background ones.
    async fn finish(&mut self, pending: &mut PendingBatches) {
        for batch in pending.take_all() {
            self.dispatcher.deliver(batch, Accounting::Tracked).await;
        }
        self.dispatcher.wait_idle().await;
    }

    async fn close_source(&mut self) {
        if let Err(e) = self.source.close().await {
            error!("NOZZLE | Failed to close the firehose consumer: {e}");
        }
    }
}
