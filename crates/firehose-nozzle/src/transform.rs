// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelope to normalized event mapping.
//!
//! [`Transformer::transform`] is total: it never fails, missing fields become
//! empty strings or zeros. Each recognized envelope yields exactly one
//! [`Event`]; excluded kinds yield nothing, and kinds the nozzle does not
//! forward are reported as "uncategorized message" on the process log.
//!
//! Attribution costs one synchronous cache lookup per envelope that carries an
//! application id and nothing otherwise.

use std::sync::Arc;

use chrono::{SecondsFormat, TimeZone, Utc};
use tracing::info;

use crate::cache::MetadataCache;
use crate::config::EventFilter;
use crate::envelope::{Envelope, ErrorEvent, HttpStartStop, LogMessage, Payload};
use crate::event::{Attributes, Entity, ErrorAttributes, Event, HttpAttributes, LogAttributes};

/// Renders nanoseconds since the unix epoch as an RFC3339 UTC timestamp with
/// whole-second precision.
pub fn format_timestamp(nanos: i64) -> String {
    Utc.timestamp_nanos(nanos)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Clone)]
pub struct Transformer {
    cache: Arc<dyn MetadataCache>,
    filter: EventFilter,
}

impl Transformer {
    pub fn new(cache: Arc<dyn MetadataCache>, filter: EventFilter) -> Self {
        Transformer { cache, filter }
    }

    pub fn transform(&self, envelope: &Envelope) -> Option<Event> {
        if envelope
            .event_type()
            .is_some_and(|event_type| self.filter.excludes(event_type))
        {
            return None;
        }

        let mut attributes = self.base_attributes(envelope);
        match &envelope.payload {
            Payload::LogMessage(m) => add_log_attributes(&mut attributes, m),
            Payload::HttpStartStop(h) => add_http_attributes(&mut attributes, h),
            Payload::Error(e) => add_error_attributes(&mut attributes, e),
            Payload::ValueMetric(_)
            | Payload::CounterEvent(_)
            | Payload::ContainerMetric(_)
            | Payload::Other(_) => {
                info!(envelope = %envelope, "uncategorized message");
                return None;
            }
        }

        if let Some(app_id) = envelope.app_id() {
            self.attribute(&mut attributes, app_id);
        }

        Some(Event {
            timestamp: attributes.timestamp.clone(),
            attributes,
        })
    }

    fn base_attributes(&self, envelope: &Envelope) -> Attributes {
        Attributes {
            event_type: envelope
                .event_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            timestamp: format_timestamp(envelope.timestamp.unwrap_or_default()),
            deployment: envelope.deployment.clone().unwrap_or_default(),
            environment: self.cache.environment_name(),
            job: envelope.job.clone().unwrap_or_default(),
            index: envelope.index.clone().unwrap_or_default(),
            ip: envelope.ip.clone().unwrap_or_default(),
            tags: envelope.tags.clone(),
            nozzle_instance: self.cache.instance_name(),
            ..Default::default()
        }
    }

    fn attribute(&self, attributes: &mut Attributes, app_id: String) {
        let info = self.cache.app_info(&app_id);
        attributes.org = Entity::new(info.org_id, info.org);
        attributes.space = Entity::new(info.space_id, info.space);
        attributes.app = Entity::new(app_id, info.name);
    }
}

fn add_log_attributes(attributes: &mut Attributes, m: &LogMessage) {
    let source_type = m.source_type.clone().unwrap_or_default();
    let (message_type, source_type_key) = match m.message_type {
        Some(t) => (t.as_str().to_string(), format!("{source_type}-{}", t.as_str())),
        None => (String::new(), String::new()),
    };

    attributes.log = Some(LogAttributes {
        message: m.message.clone().unwrap_or_default(),
        message_type,
        timestamp: format_timestamp(m.timestamp.unwrap_or_default()),
        source_type,
        source_instance: m.source_instance.clone().unwrap_or_default(),
        source_type_key,
    });
}

fn add_http_attributes(attributes: &mut Attributes, h: &HttpStartStop) {
    attributes.http = Some(HttpAttributes {
        start_timestamp: format_timestamp(h.start_timestamp.unwrap_or_default()),
        stop_timestamp: format_timestamp(h.stop_timestamp.unwrap_or_default()),
        request_id: h.request_id.map(|id| id.to_string()).unwrap_or_default(),
        peer_type: h.peer_type.unwrap_or_default().as_str().to_string(),
        method: h.method.clone().unwrap_or_else(|| "GET".to_string()),
        uri: h.uri.clone().unwrap_or_default(),
        remote_address: h.remote_address.clone().unwrap_or_default(),
        user_agent: h.user_agent.clone().unwrap_or_default(),
        status_code: h.status_code.unwrap_or_default(),
        content_length: h.content_length.unwrap_or_default(),
        instance_index: h.instance_index.unwrap_or_default(),
        instance_id: h.instance_id.clone().unwrap_or_default(),
        forwarded: h.forwarded.join(","),
    });
}

fn add_error_attributes(attributes: &mut Attributes, e: &ErrorEvent) {
    attributes.error = Some(ErrorAttributes {
        source: e.source.clone().unwrap_or_default(),
        code: e.code.unwrap_or_default(),
        message: e.message.clone().unwrap_or_default(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AppInfo;
    use crate::envelope::{ContainerMetric, MessageType, PeerType, PlatformUuid, ValueMetric};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    struct CountingCache {
        lookups: AtomicUsize,
    }

    impl CountingCache {
        fn new() -> Self {
            CountingCache {
                lookups: AtomicUsize::new(0),
            }
        }
    }

    impl MetadataCache for CountingCache {
        fn initialize(&self) {}

        fn app_info(&self, app_guid: &str) -> AppInfo {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            AppInfo {
                name: format!("name-of-{app_guid}"),
                org: "acme".to_string(),
                org_id: "org-1".to_string(),
                space: "prod".to_string(),
                space_id: "space-1".to_string(),
            }
        }

        fn environment_name(&self) -> String {
            "dev".to_string()
        }

        fn instance_name(&self) -> String {
            "nozzle0".to_string()
        }
    }

    fn transformer(filter: EventFilter) -> (Transformer, Arc<CountingCache>) {
        let cache = Arc::new(CountingCache::new());
        (Transformer::new(cache.clone(), filter), cache)
    }

    #[test]
    fn log_message_without_app_id() {
        let (transformer, cache) = transformer(EventFilter::default());
        let mut envelope = Envelope::new(Payload::LogMessage(LogMessage {
            message_type: Some(MessageType::Out),
            ..Default::default()
        }));
        envelope.timestamp = Some(1_000_000_000);

        let event = transformer.transform(&envelope).expect("log message is forwarded");

        assert_eq!(event.timestamp, "1970-01-01T00:00:01Z");
        assert_eq!(event.attributes.event_type, "LogMessage");
        assert_eq!(event.attributes.environment, "dev");
        assert_eq!(event.attributes.nozzle_instance, "nozzle0");
        let log = event.attributes.log.as_ref().expect("log attributes");
        assert_eq!(log.message_type, "OUT");
        assert_eq!(log.source_type_key, "-OUT");
        assert!(event.attributes.org.is_empty());
        assert!(event.attributes.space.is_empty());
        assert!(event.attributes.app.is_empty());
        assert_eq!(cache.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn log_message_with_app_id_is_attributed_with_one_lookup() {
        let (transformer, cache) = transformer(EventFilter::default());
        let envelope = Envelope::new(Payload::LogMessage(LogMessage {
            message: Some("hello".to_string()),
            message_type: Some(MessageType::Err),
            source_type: Some("APP/PROC/WEB".to_string()),
            app_id: Some("app-1".to_string()),
            ..Default::default()
        }));

        let event = transformer.transform(&envelope).expect("forwarded");

        assert_eq!(cache.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(event.attributes.org, Entity::new("org-1", "acme"));
        assert_eq!(event.attributes.space, Entity::new("space-1", "prod"));
        assert_eq!(event.attributes.app, Entity::new("app-1", "name-of-app-1"));
        let log = event.attributes.log.expect("log attributes");
        assert_eq!(log.message, "hello");
        assert_eq!(log.source_type_key, "APP/PROC/WEB-ERR");
    }

    #[test]
    fn http_start_stop_fills_http_block() {
        let (transformer, cache) = transformer(EventFilter::default());
        let mut envelope = Envelope::new(Payload::HttpStartStop(HttpStartStop {
            start_timestamp: Some(1_500_000_000),
            stop_timestamp: Some(2_000_000_000),
            peer_type: Some(PeerType::Server),
            method: Some("POST".to_string()),
            uri: Some("/v2/apps".to_string()),
            status_code: Some(201),
            content_length: Some(42),
            application_id: Some(PlatformUuid { low: 1, high: 2 }),
            forwarded: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            ..Default::default()
        }));
        envelope.deployment = Some("cf".to_string());
        envelope.ip = Some("10.0.16.4".to_string());

        let event = transformer.transform(&envelope).expect("forwarded");

        assert_eq!(event.attributes.event_type, "HttpStartStop");
        assert_eq!(event.attributes.deployment, "cf");
        assert_eq!(event.attributes.ip, "10.0.16.4");
        assert_eq!(cache.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(
            event.attributes.app.id,
            "01000000-0000-0000-0200-000000000000"
        );
        let http = event.attributes.http.expect("http attributes");
        assert_eq!(http.start_timestamp, "1970-01-01T00:00:01Z");
        assert_eq!(http.stop_timestamp, "1970-01-01T00:00:02Z");
        assert_eq!(http.peer_type, "Server");
        assert_eq!(http.method, "POST");
        assert_eq!(http.status_code, 201);
        assert_eq!(http.forwarded, "10.0.0.1,10.0.0.2");
        assert_eq!(http.request_id, "");
    }

    #[test]
    fn empty_http_start_stop_degrades_to_defaults() {
        let (transformer, _) = transformer(EventFilter::default());
        let envelope = Envelope::new(Payload::HttpStartStop(HttpStartStop::default()));

        let event = transformer.transform(&envelope).expect("forwarded");

        let http = event.attributes.http.expect("http attributes");
        assert_eq!(http.peer_type, "Client");
        assert_eq!(http.method, "GET");
        assert_eq!(http.start_timestamp, "1970-01-01T00:00:00Z");
        assert_eq!(event.timestamp, "1970-01-01T00:00:00Z");
    }

    #[test]
    fn error_envelope_fills_error_block() {
        let (transformer, _) = transformer(EventFilter::default());
        let envelope = Envelope::new(Payload::Error(ErrorEvent {
            source: Some("cc".to_string()),
            code: Some(500),
            message: Some("boom".to_string()),
        }));

        let event = transformer.transform(&envelope).expect("forwarded");

        assert_eq!(event.attributes.event_type, "Error");
        assert_eq!(
            event.attributes.error,
            Some(ErrorAttributes {
                source: "cc".to_string(),
                code: 500,
                message: "boom".to_string(),
            })
        );
        assert!(event.attributes.log.is_none());
    }

    #[test]
    fn filtered_kinds_produce_nothing() {
        let (transformer, _) = transformer("LOG,HTTP".parse().expect("filter"));
        for payload in [
            Payload::LogMessage(LogMessage::default()),
            Payload::Error(ErrorEvent::default()),
            Payload::HttpStartStop(HttpStartStop::default()),
        ] {
            assert_eq!(transformer.transform(&Envelope::new(payload)), None);
        }
    }

    #[test]
    #[traced_test]
    fn unrecognized_kind_is_logged_as_uncategorized() {
        let (transformer, _) = transformer(EventFilter::default());
        let envelope = Envelope::new(Payload::Other("Envelope_10".to_string()));

        assert_eq!(transformer.transform(&envelope), None);
        assert!(logs_contain("uncategorized message"));
        assert!(logs_contain("eventType:Envelope_10"));
    }

    #[test]
    #[traced_test]
    fn metrics_are_not_forwarded() {
        let (transformer, _) = transformer(EventFilter::default());
        let envelope = Envelope::new(Payload::ValueMetric(ValueMetric::default()));

        assert_eq!(transformer.transform(&envelope), None);
        assert!(logs_contain("eventType:ValueMetric"));

        let envelope = Envelope::new(Payload::ValueMetric(ValueMetric {
            name: Some("cpu_load".to_string()),
            value: Some(0.75),
            unit: Some("ratio".to_string()),
        }));
        assert_eq!(transformer.transform(&envelope), None);
        assert!(logs_contain("name:\"cpu_load\""));
        assert!(logs_contain("value:0.75"));
        assert!(logs_contain("unit:\"ratio\""));
    }

    #[test]
    fn attribution_follows_the_envelope_app_id() {
        let (transformer, cache) = transformer(EventFilter::default());

        let envelope = Envelope::new(Payload::ContainerMetric(ContainerMetric {
            application_id: Some("app-guid".to_string()),
            ..Default::default()
        }));
        assert_eq!(transformer.transform(&envelope), None);
        assert_eq!(cache.lookups.load(Ordering::SeqCst), 0);

        let envelope = Envelope::new(Payload::HttpStartStop(HttpStartStop {
            application_id: Some(PlatformUuid { low: 1, high: 2 }),
            ..Default::default()
        }));
        let event = transformer.transform(&envelope).expect("event");
        assert_eq!(Some(event.attributes.app.id), envelope.app_id());
        assert_eq!(cache.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timestamp_is_formatted_in_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_timestamp(1_000_000_000), "1970-01-01T00:00:01Z");
        assert_eq!(format_timestamp(1_999_999_999), "1970-01-01T00:00:01Z");
        assert_eq!(format_timestamp(-1), "1969-12-31T23:59:59Z");
        assert_eq!(
            format_timestamp(1_700_000_000_123_456_789),
            "2023-11-14T22:13:20Z"
        );
    }

    proptest! {
        #[test]
        fn transform_is_deterministic(nanos in any::<i64>(), message in ".*") {
            let (transformer, _) = transformer(EventFilter::default());
            let mut envelope = Envelope::new(Payload::LogMessage(LogMessage {
                message: Some(message),
                ..Default::default()
            }));
            envelope.timestamp = Some(nanos);

            let first = transformer.transform(&envelope).expect("forwarded");
            let second = transformer.transform(&envelope).expect("forwarded");
            prop_assert_eq!(&first.timestamp, &format_timestamp(nanos));
            prop_assert_eq!(first, second);
        }
    }
}
