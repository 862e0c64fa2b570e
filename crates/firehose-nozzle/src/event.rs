// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Normalized events and the Humio ingest document that carries them.
//!
//! The ingest API takes a JSON array of `{ "tags": {...}, "events": [...] }`
//! documents. Every event has a top-level RFC3339 `timestamp` and an
//! `attributes` object; kind-specific attributes are nested under `log`,
//! `http`, `error` or `counter` so only the block matching the event kind is
//! ever serialized.

use std::collections::BTreeMap;

use serde::Serialize;

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

/// Identity of an organization, space or application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Entity {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Entity {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.name.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogAttributes {
    pub message: String,
    #[serde(rename = "messagetype")]
    pub message_type: String,
    pub timestamp: String,
    #[serde(rename = "sourcetype")]
    pub source_type: String,
    #[serde(rename = "sourceinst")]
    pub source_instance: String,
    #[serde(rename = "sourcetypekey")]
    pub source_type_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpAttributes {
    #[serde(rename = "starttimestamp")]
    pub start_timestamp: String,
    #[serde(rename = "stoptimestamp")]
    pub stop_timestamp: String,
    #[serde(rename = "requestid")]
    pub request_id: String,
    #[serde(rename = "peertype")]
    pub peer_type: String,
    pub method: String,
    pub uri: String,
    #[serde(rename = "remoteaddr")]
    pub remote_address: String,
    #[serde(rename = "ua")]
    pub user_agent: String,
    #[serde(rename = "statuscode")]
    pub status_code: i32,
    #[serde(rename = "contentlength")]
    pub content_length: i64,
    #[serde(rename = "instanceindex")]
    pub instance_index: i32,
    #[serde(rename = "instanceid")]
    pub instance_id: String,
    pub forwarded: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorAttributes {
    pub source: String,
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub code: i32,
    pub message: String,
}

/// Delivery statistics reported by the nozzle about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterAttributes {
    pub name: String,
    pub delta: u64,
    pub total: u64,
    #[serde(rename = "counterkey")]
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Attributes {
    #[serde(rename = "eventtype")]
    pub event_type: String,
    pub timestamp: String,
    pub deployment: String,
    #[serde(rename = "env")]
    pub environment: String,
    pub job: String,
    pub index: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(rename = "instance")]
    pub nozzle_instance: String,
    pub org: Entity,
    pub space: Entity,
    pub app: Entity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogAttributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpAttributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorAttributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<CounterAttributes>,
}

/// A sink-ready event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Event {
    pub timestamp: String,
    pub attributes: Attributes,
}

impl Event {
    pub fn event_type(&self) -> &str {
        &self.attributes.event_type
    }
}

/// Attribution summary attached to a whole ingest document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tags {
    #[serde(rename = "orgname", skip_serializing_if = "String::is_empty")]
    pub org_name: String,
    #[serde(rename = "orgid", skip_serializing_if = "String::is_empty")]
    pub org_id: String,
    #[serde(rename = "spacename", skip_serializing_if = "String::is_empty")]
    pub space_name: String,
    #[serde(rename = "spaceid", skip_serializing_if = "String::is_empty")]
    pub space_id: String,
    #[serde(rename = "appname", skip_serializing_if = "String::is_empty")]
    pub app_name: String,
    #[serde(rename = "appid", skip_serializing_if = "String::is_empty")]
    pub app_id: String,
}

/// One ingest document: a batch of events and the attribution they share.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Events {
    pub tags: Tags,
    pub events: Vec<Event>,
}

impl Events {
    /// Wraps a batch, tagging it with every attribution field that all of its
    /// events agree on.
    pub fn new(events: Vec<Event>) -> Self {
        let tags = Tags {
            org_name: common(&events, |a| &a.org.name),
            org_id: common(&events, |a| &a.org.id),
            space_name: common(&events, |a| &a.space.name),
            space_id: common(&events, |a| &a.space.id),
            app_name: common(&events, |a| &a.app.name),
            app_id: common(&events, |a| &a.app.id),
        };
        Events { tags, events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn common(events: &[Event], field: impl Fn(&Attributes) -> &String) -> String {
    let mut values = events.iter().map(|e| field(&e.attributes));
    match values.next() {
        Some(first) if values.all(|v| v == first) => first.clone(),
        _ => String::new(),
    }
}
