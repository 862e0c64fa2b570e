// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, PoisonError};

/// Lifetime delivery totals of one nozzle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Envelopes read from the stream.
    pub received: u64,
    /// Events acknowledged by the sink.
    pub sent: u64,
    /// Events dropped after the sink gave up on them, or abandoned at shutdown.
    pub lost: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    stats: DeliveryStats,
    /// Tracked events handed to a delivery that has not settled yet.
    outstanding: u64,
    abandoned: bool,
}

/// Shared, cheaply clonable counters updated by the router and the dispatcher.
///
/// Tracked deliveries are opened with [`DeliveryCounters::begin`] and closed
/// with [`DeliveryCounters::settle_sent`] or [`DeliveryCounters::settle_lost`].
/// [`DeliveryCounters::abandon`] books everything still open as lost; later
/// settlements are then ignored so no event is counted twice.
#[derive(Debug, Clone, Default)]
pub struct DeliveryCounters {
    inner: Arc<Mutex<Ledger>>,
}

impl DeliveryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_received(&self, n: u64) {
        self.update(|l| l.stats.received += n);
    }

    /// Books events that never reached a delivery as lost.
    pub fn add_lost(&self, n: u64) {
        self.update(|l| l.stats.lost += n);
    }

    pub fn begin(&self, n: u64) {
        self.update(|l| {
            if l.abandoned {
                l.stats.lost += n;
            } else {
                l.outstanding += n;
            }
        });
    }

    pub fn settle_sent(&self, n: u64) {
        self.update(|l| {
            if !l.abandoned {
                l.outstanding = l.outstanding.saturating_sub(n);
                l.stats.sent += n;
            }
        });
    }

    pub fn settle_lost(&self, n: u64) {
        self.update(|l| {
            if !l.abandoned {
                l.outstanding = l.outstanding.saturating_sub(n);
                l.stats.lost += n;
            }
        });
    }

    /// Counts every open delivery as lost and returns how many events that was.
    pub fn abandon(&self) -> u64 {
        let mut ledger = self.lock();
        let open = std::mem::take(&mut ledger.outstanding);
        ledger.stats.lost += open;
        ledger.abandoned = true;
        open
    }

    pub fn outstanding(&self) -> u64 {
        self.lock().outstanding
    }

    pub fn snapshot(&self) -> DeliveryStats {
        self.lock().stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Ledger)) {
        f(&mut self.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_totals() {
        let counters = DeliveryCounters::new();
        let other = counters.clone();
        counters.add_received(3);
        other.begin(3);
        other.settle_sent(2);
        other.settle_lost(1);

        assert_eq!(
            counters.snapshot(),
            DeliveryStats {
                received: 3,
                sent: 2,
                lost: 1
            }
        );
        assert_eq!(counters.outstanding(), 0);
    }

    #[test]
    fn abandon_books_open_deliveries_once() {
        let counters = DeliveryCounters::new();
        counters.add_received(6);
        counters.begin(2);
        counters.begin(3);
        counters.settle_sent(2);

        assert_eq!(counters.abandon(), 3);
        // The abandoned delivery finishing late does not count again.
        counters.settle_sent(3);
        // Neither does one that starts after the deadline.
        counters.begin(1);
        counters.settle_sent(1);

        assert_eq!(
            counters.snapshot(),
            DeliveryStats {
                received: 6,
                sent: 2,
                lost: 4
            }
        );
        assert_eq!(counters.outstanding(), 0);
    }
}
