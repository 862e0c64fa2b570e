// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw firehose envelopes as they arrive from the stream source.
//!
//! An [`Envelope`] carries the fields common to every platform event (origin,
//! deployment, job, index, ip, tags, timestamp) plus exactly one [`Payload`].
//! Every field the platform marks optional stays an `Option` here so a
//! partially populated envelope never fails to decode; the transformer turns
//! missing values into empty strings and zeros.
//!
//! Payload kinds the nozzle does not forward (metrics, unknown kinds) are still
//! representable so the router can log them instead of dropping them silently.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// Event kinds of the platform's firehose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    HttpStartStop,
    LogMessage,
    ValueMetric,
    CounterEvent,
    Error,
    ContainerMetric,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::HttpStartStop => "HttpStartStop",
            EventType::LogMessage => "LogMessage",
            EventType::ValueMetric => "ValueMetric",
            EventType::CounterEvent => "CounterEvent",
            EventType::Error => "Error",
            EventType::ContainerMetric => "ContainerMetric",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "HttpStartStop" => Some(EventType::HttpStartStop),
            "LogMessage" => Some(EventType::LogMessage),
            "ValueMetric" => Some(EventType::ValueMetric),
            "CounterEvent" => Some(EventType::CounterEvent),
            "Error" => Some(EventType::Error),
            "ContainerMetric" => Some(EventType::ContainerMetric),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 128-bit identifier as the platform encodes it: two little-endian words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct PlatformUuid {
    #[serde(default)]
    pub low: u64,
    #[serde(default)]
    pub high: u64,
}

impl fmt::Display for PlatformUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let low = self.low.to_le_bytes();
        let high = self.high.to_le_bytes();
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex(&low[0..4]),
            hex(&low[4..6]),
            hex(&low[6..8]),
            hex(&high[0..2]),
            hex(&high[2..8]),
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MessageType {
    #[serde(rename = "OUT")]
    Out,
    #[serde(rename = "ERR")]
    Err,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Out => "OUT",
            MessageType::Err => "ERR",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum PeerType {
    #[default]
    Client,
    Server,
}

impl PeerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerType::Client => "Client",
            PeerType::Server => "Server",
        }
    }
}

/// A single line of application or platform component output.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogMessage {
    pub message: Option<String>,
    pub message_type: Option<MessageType>,
    pub timestamp: Option<i64>,
    pub app_id: Option<String>,
    /// APP, RTR, STG, ...
    pub source_type: Option<String>,
    pub source_instance: Option<String>,
}

/// The full lifecycle of one HTTP request as seen by the router.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpStartStop {
    pub start_timestamp: Option<i64>,
    pub stop_timestamp: Option<i64>,
    pub request_id: Option<PlatformUuid>,
    pub peer_type: Option<PeerType>,
    pub method: Option<String>,
    pub uri: Option<String>,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
    pub status_code: Option<i32>,
    pub content_length: Option<i64>,
    pub application_id: Option<PlatformUuid>,
    pub instance_index: Option<i32>,
    pub instance_id: Option<String>,
    pub forwarded: Vec<String>,
}

/// An error reported by a platform component.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorEvent {
    pub source: Option<String>,
    pub code: Option<i32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValueMetric {
    pub name: Option<String>,
    pub value: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CounterEvent {
    pub name: Option<String>,
    pub delta: Option<u64>,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerMetric {
    pub application_id: Option<String>,
    pub instance_index: Option<i32>,
    pub cpu_percentage: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

/// Kind-specific content of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    LogMessage(LogMessage),
    HttpStartStop(HttpStartStop),
    Error(ErrorEvent),
    ValueMetric(ValueMetric),
    CounterEvent(CounterEvent),
    ContainerMetric(ContainerMetric),
    /// An event kind this build does not know about. Holds the raw tag.
    Other(String),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Other(String::new())
    }
}

impl Payload {
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Payload::LogMessage(_) => Some(EventType::LogMessage),
            Payload::HttpStartStop(_) => Some(EventType::HttpStartStop),
            Payload::Error(_) => Some(EventType::Error),
            Payload::ValueMetric(_) => Some(EventType::ValueMetric),
            Payload::CounterEvent(_) => Some(EventType::CounterEvent),
            Payload::ContainerMetric(_) => Some(EventType::ContainerMetric),
            Payload::Other(_) => None,
        }
    }

    fn type_name(&self) -> &str {
        match self {
            Payload::Other(name) => name,
            known => known.event_type().map_or("", |t| t.as_str()),
        }
    }
}

/// One unit of the firehose stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "WireEnvelope")]
pub struct Envelope {
    pub origin: Option<String>,
    /// Nanoseconds since the unix epoch.
    pub timestamp: Option<i64>,
    pub deployment: Option<String>,
    pub job: Option<String>,
    pub index: Option<String>,
    pub ip: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Envelope {
            payload,
            ..Default::default()
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        self.payload.event_type()
    }

    /// Identifier of the application that owns this event, when it has one.
    pub fn app_id(&self) -> Option<String> {
        match &self.payload {
            Payload::LogMessage(m) => m.app_id.clone(),
            Payload::HttpStartStop(h) => h.application_id.map(|id| id.to_string()),
            Payload::ContainerMetric(c) => c.application_id.clone(),
            _ => None,
        }
    }
}

/// Compact text form used when an envelope is logged rather than forwarded.
impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eventType:{} ", self.payload.type_name())?;
        let fields = [
            ("origin", &self.origin),
            ("deployment", &self.deployment),
            ("job", &self.job),
            ("index", &self.index),
            ("ip", &self.ip),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                write!(f, "{name}:{value:?} ")?;
            }
        }
        if let Some(ts) = self.timestamp {
            write!(f, "timestamp:{ts} ")?;
        }
        for (key, value) in &self.tags {
            write!(f, "tags:<key:{key:?} value:{value:?}> ")?;
        }
        write_payload(&mut TextFields(f), &self.payload)
    }
}

/// Writes `name:value ` pairs for the values that are present.
struct TextFields<'a, 'b>(&'a mut fmt::Formatter<'b>);

impl TextFields<'_, '_> {
    fn quoted(&mut self, name: &str, value: Option<&str>) -> fmt::Result {
        match value {
            Some(value) => write!(self.0, "{name}:{value:?} "),
            None => Ok(()),
        }
    }

    fn plain(&mut self, name: &str, value: Option<impl fmt::Display>) -> fmt::Result {
        match value {
            Some(value) => write!(self.0, "{name}:{value} "),
            None => Ok(()),
        }
    }

    fn open(&mut self, name: &str) -> fmt::Result {
        write!(self.0, "{name}:<")
    }

    fn close(&mut self) -> fmt::Result {
        self.0.write_str("> ")
    }
}

fn write_payload(out: &mut TextFields<'_, '_>, payload: &Payload) -> fmt::Result {
    match payload {
        Payload::LogMessage(m) => {
            out.open("logMessage")?;
            out.quoted("message", m.message.as_deref())?;
            out.plain("messageType", m.message_type.map(|t| t.as_str()))?;
            out.plain("timestamp", m.timestamp)?;
            out.quoted("appId", m.app_id.as_deref())?;
            out.quoted("sourceType", m.source_type.as_deref())?;
            out.quoted("sourceInstance", m.source_instance.as_deref())?;
        }
        Payload::HttpStartStop(h) => {
            out.open("httpStartStop")?;
            out.plain("startTimestamp", h.start_timestamp)?;
            out.plain("stopTimestamp", h.stop_timestamp)?;
            out.plain("requestId", h.request_id)?;
            out.plain("peerType", h.peer_type.map(|t| t.as_str()))?;
            out.quoted("method", h.method.as_deref())?;
            out.quoted("uri", h.uri.as_deref())?;
            out.quoted("remoteAddress", h.remote_address.as_deref())?;
            out.quoted("userAgent", h.user_agent.as_deref())?;
            out.plain("statusCode", h.status_code)?;
            out.plain("contentLength", h.content_length)?;
            out.plain("applicationId", h.application_id)?;
            out.plain("instanceIndex", h.instance_index)?;
            out.quoted("instanceId", h.instance_id.as_deref())?;
            for hop in &h.forwarded {
                out.quoted("forwarded", Some(hop.as_str()))?;
            }
        }
        Payload::Error(e) => {
            out.open("error")?;
            out.quoted("source", e.source.as_deref())?;
            out.plain("code", e.code)?;
            out.quoted("message", e.message.as_deref())?;
        }
        Payload::ValueMetric(m) => {
            out.open("valueMetric")?;
            out.quoted("name", m.name.as_deref())?;
            out.plain("value", m.value)?;
            out.quoted("unit", m.unit.as_deref())?;
        }
        Payload::CounterEvent(c) => {
            out.open("counterEvent")?;
            out.quoted("name", c.name.as_deref())?;
            out.plain("delta", c.delta)?;
            out.plain("total", c.total)?;
        }
        Payload::ContainerMetric(c) => {
            out.open("containerMetric")?;
            out.quoted("applicationId", c.application_id.as_deref())?;
            out.plain("instanceIndex", c.instance_index)?;
            out.plain("cpuPercentage", c.cpu_percentage)?;
            out.plain("memoryBytes", c.memory_bytes)?;
            out.plain("diskBytes", c.disk_bytes)?;
        }
        // Only the tag of an unknown kind is known.
        Payload::Other(_) => return Ok(()),
    }
    out.close()
}

/// JSON shape of an envelope: a type tag plus one optional body per kind,
/// mirroring the platform's own encoding.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireEnvelope {
    event_type: String,
    origin: Option<String>,
    timestamp: Option<i64>,
    deployment: Option<String>,
    job: Option<String>,
    index: Option<String>,
    ip: Option<String>,
    tags: BTreeMap<String, String>,
    log_message: Option<LogMessage>,
    http_start_stop: Option<HttpStartStop>,
    error: Option<ErrorEvent>,
    value_metric: Option<ValueMetric>,
    counter_event: Option<CounterEvent>,
    container_metric: Option<ContainerMetric>,
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        // A tag without its body degrades to an empty body of that kind.
        let payload = match EventType::from_name(&wire.event_type) {
            Some(EventType::LogMessage) => {
                Payload::LogMessage(wire.log_message.unwrap_or_default())
            }
            Some(EventType::HttpStartStop) => {
                Payload::HttpStartStop(wire.http_start_stop.unwrap_or_default())
            }
            Some(EventType::Error) => Payload::Error(wire.error.unwrap_or_default()),
            Some(EventType::ValueMetric) => {
                Payload::ValueMetric(wire.value_metric.unwrap_or_default())
            }
            Some(EventType::CounterEvent) => {
                Payload::CounterEvent(wire.counter_event.unwrap_or_default())
            }
            Some(EventType::ContainerMetric) => {
                Payload::ContainerMetric(wire.container_metric.unwrap_or_default())
            }
            None => Payload::Other(wire.event_type),
        };

        Envelope {
            origin: wire.origin,
            timestamp: wire.timestamp,
            deployment: wire.deployment,
            job: wire.job,
            index: wire.index,
            ip: wire.ip,
            tags: wire.tags,
            payload,
        }
    }
}
