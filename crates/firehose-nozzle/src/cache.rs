// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Application metadata lookups used to attribute events.
//!
//! The transformer only depends on [`MetadataCache`]; how a cache fills and
//! refreshes itself is its own business. Lookups are synchronous and must never
//! fail: unknown applications resolve to an empty [`AppInfo`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

/// Names and ids the platform associates with one application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub org: String,
    pub org_id: String,
    pub space: String,
    pub space_id: String,
}

pub trait MetadataCache: Send + Sync {
    /// Called once before any event is consumed. May block on a bulk load.
    fn initialize(&self);

    fn app_info(&self, app_guid: &str) -> AppInfo;

    fn environment_name(&self) -> String;

    fn instance_name(&self) -> String;
}

/// Cache backed by an in-process map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    environment: String,
    instance: String,
    apps: RwLock<HashMap<String, AppInfo>>,
}

impl MemoryCache {
    pub fn new(environment: impl Into<String>, instance: impl Into<String>) -> Self {
        MemoryCache {
            environment: environment.into(),
            instance: instance.into(),
            apps: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, app_guid: impl Into<String>, info: AppInfo) {
        self.apps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app_guid.into(), info);
    }

    pub fn len(&self) -> usize {
        self.apps.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataCache for MemoryCache {
    fn initialize(&self) {
        debug!("Metadata cache ready with {} applications", self.len());
    }

    fn app_info(&self, app_guid: &str) -> AppInfo {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_guid)
            .cloned()
            .unwrap_or_default()
    }

    fn environment_name(&self) -> String {
        self.environment.clone()
    }

    fn instance_name(&self) -> String {
        self.instance.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_app_resolves_to_empty_info() {
        let cache = MemoryCache::new("dev", "nozzle0");
        assert_eq!(cache.app_info("missing"), AppInfo::default());
        assert!(cache.is_empty());
    }

    #[test]
    fn inserted_app_is_returned() {
        let cache = MemoryCache::new("dev", "nozzle0");
        let info = AppInfo {
            name: "billing".to_string(),
            org: "acme".to_string(),
            org_id: "org-1".to_string(),
            space: "prod".to_string(),
            space_id: "space-1".to_string(),
        };
        cache.insert("app-1", info.clone());

        assert_eq!(cache.app_info("app-1"), info);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.environment_name(), "dev");
        assert_eq!(cache.instance_name(), "nozzle0");
    }
}
