// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per event-type partitions of events waiting to be shipped.
//!
//! Each partition fills independently. A partition that reaches the size
//! threshold is handed back by [`PendingBatches::push`] and restarts empty;
//! [`PendingBatches::take_all`] hands back every non-empty partition for time
//! based and final flushes.

use std::collections::BTreeMap;
use std::mem;

use crate::event::Event;

/// Events of a single type that are shipped together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    event_type: String,
    events: Vec<Event>,
}

impl Batch {
    pub fn new(event_type: impl Into<String>, events: Vec<Event>) -> Self {
        Batch {
            event_type: event_type.into(),
            events,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug)]
pub struct PendingBatches {
    max_batch_size: usize,
    partitions: BTreeMap<String, Vec<Event>>,
}

impl PendingBatches {
    pub fn new(max_batch_size: usize) -> Self {
        PendingBatches {
            max_batch_size: max_batch_size.max(1),
            partitions: BTreeMap::new(),
        }
    }

    /// Appends `event` to its partition and returns the partition when it is
    /// full.
    pub fn push(&mut self, event: Event) -> Option<Batch> {
        let partition = self
            .partitions
            .entry(event.event_type().to_string())
            .or_default();
        partition.push(event);
        if partition.len() < self.max_batch_size {
            return None;
        }
        let events = mem::take(partition);
        let event_type = events
            .first()
            .map(|e| e.event_type().to_string())
            .unwrap_or_default();
        Some(Batch::new(event_type, events))
    }

    pub fn take_all(&mut self) -> Vec<Batch> {
        mem::take(&mut self.partitions)
            .into_iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(event_type, events)| Batch::new(event_type, events))
            .collect()
    }

    /// Number of events across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Attributes;

    fn event(event_type: &str, n: usize) -> Event {
        Event {
            timestamp: format!("t{n}"),
            attributes: Attributes {
                event_type: event_type.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn full_partition_is_released_and_restarts() {
        let mut pending = PendingBatches::new(2);
        assert_eq!(pending.push(event("LogMessage", 0)), None);
        assert_eq!(pending.push(event("HttpStartStop", 1)), None);

        let batch = pending.push(event("LogMessage", 2)).expect("full batch");
        assert_eq!(batch.event_type(), "LogMessage");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.events()[0].timestamp, "t0");
        assert_eq!(batch.events()[1].timestamp, "t2");

        assert_eq!(pending.len(), 1);
        assert_eq!(pending.push(event("LogMessage", 3)), None);
    }

    #[test]
    fn take_all_drains_every_non_empty_partition() {
        let mut pending = PendingBatches::new(10);
        pending.push(event("LogMessage", 0));
        pending.push(event("Error", 1));
        pending.push(event("LogMessage", 2));

        let batches = pending.take_all();
        let sizes: Vec<_> = batches.iter().map(|b| (b.event_type(), b.len())).collect();
        assert_eq!(sizes, vec![("Error", 1), ("LogMessage", 2)]);
        assert!(pending.is_empty());
        assert!(pending.take_all().is_empty());
    }

    #[test]
    fn size_one_releases_every_event() {
        let mut pending = PendingBatches::new(1);
        let batch = pending.push(event("Error", 0)).expect("full batch");
        assert_eq!(batch.into_events().len(), 1);
        assert!(pending.take_all().is_empty());
    }
}
