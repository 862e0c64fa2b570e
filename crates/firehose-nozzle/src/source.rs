// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Where envelopes come from.
//!
//! A [`StreamSource`] hands the router two channels: decoded envelopes and
//! terminal stream errors. Closing the envelope channel means the upstream
//! ended cleanly.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::Envelope;

const POLICY_VIOLATION: &str = "close 1008 (policy violation)";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The platform dropped the subscription because the nozzle fell behind.
    #[error("websocket: close 1008 (policy violation): {0}")]
    PolicyViolation(String),

    #[error("{0}")]
    Other(String),
}

impl StreamError {
    pub fn is_slow_consumer(&self) -> bool {
        match self {
            StreamError::PolicyViolation(_) => true,
            StreamError::Other(message) => message.contains(POLICY_VIOLATION),
        }
    }
}

/// Receiving ends of one subscription.
#[derive(Debug)]
pub struct Connection {
    pub events: mpsc::Receiver<Envelope>,
    pub errors: mpsc::Receiver<StreamError>,
}

#[async_trait]
pub trait StreamSource: Send {
    /// Opens the subscription. Called once per nozzle run.
    fn connect(&mut self) -> Connection;

    /// Stops the subscription. Must be safe to call more than once.
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// A source fed through a [`SourceHandle`], used by the binary's stdin reader
/// and by tests.
#[derive(Debug)]
pub struct ChannelSource {
    connection: Option<Connection>,
    closed: CancellationToken,
}

/// Producer side of a [`ChannelSource`]. Dropping every handle ends the stream.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    events: mpsc::Sender<Envelope>,
    errors: mpsc::Sender<StreamError>,
    closed: CancellationToken,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (ChannelSource, SourceHandle) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let closed = CancellationToken::new();
        let source = ChannelSource {
            connection: Some(Connection {
                events: events_rx,
                errors: errors_rx,
            }),
            closed: closed.clone(),
        };
        let handle = SourceHandle {
            events: events_tx,
            errors: errors_tx,
            closed,
        };
        (source, handle)
    }
}

#[async_trait]
impl StreamSource for ChannelSource {
    fn connect(&mut self) -> Connection {
        match self.connection.take() {
            Some(connection) => connection,
            None => {
                // A second connect gets a subscription that is already over.
                let (_, events) = mpsc::channel(1);
                let (_, errors) = mpsc::channel(1);
                Connection { events, errors }
            }
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        debug!("NOZZLE | Closing channel source");
        self.closed.cancel();
        Ok(())
    }
}

impl SourceHandle {
    /// Returns false once the consumer is gone or the source was closed.
    pub async fn send(&self, envelope: Envelope) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        tokio::select! {
            sent = self.events.send(envelope) => sent.is_ok(),
            () = self.closed.cancelled() => false,
        }
    }

    /// Reports a terminal stream error.
    pub async fn fail(&self, error: StreamError) -> bool {
        self.errors.send(error).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the consumer closes the source.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Feeds newline delimited JSON envelopes from `reader` into `handle`.
///
/// Lines that fail to decode are skipped. End of input ends the stream; a read
/// error is reported on the error channel.
pub fn spawn_ndjson_reader<R>(reader: R, handle: SourceHandle) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                () = handle.closed() => return,
            };
            match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&line) {
                        Ok(envelope) => {
                            if !handle.send(envelope).await {
                                return;
                            }
                        }
                        Err(e) => warn!("NOZZLE | Skipping malformed envelope: {e}"),
                    }
                }
                Ok(None) => {
                    debug!("NOZZLE | Envelope input reached end of stream");
                    return;
                }
                Err(e) => {
                    handle.fail(StreamError::Other(e.to_string())).await;
                    return;
                }
            }
        }
    })
}
