// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::SystemTime,
};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::serde_time;

/// Every kind of resource that registers under a host identifier.
///
/// All kinds share one namespace of names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Node,
    Proxy,
    KubeService,
    DatabaseServer,
    AppServer,
}

impl ResourceKind {
    /// Must list every variant
    pub const ALL: [ResourceKind; 5] = [
        Self::Node,
        Self::Proxy,
        Self::KubeService,
        Self::DatabaseServer,
        Self::AppServer,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Proxy => "proxy",
            Self::KubeService => "kube_service",
            Self::DatabaseServer => "db_server",
            Self::AppServer => "app_server",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(with = "serde_time::rfc3339")]
    pub registered_at: SystemTime,
}

impl RegistryEntry {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            registered_at: SystemTime::now(),
        }
    }
}

/// Store of registered cluster resources
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<RegistryEntry>>;

    async fn list(&self, kind: ResourceKind) -> Result<Vec<RegistryEntry>>;

    /// Insert the entry unless a resource of any kind already uses its name.
    ///
    /// Returns false when the name is taken. Must be atomic.
    async fn insert_if_absent(&self, entry: RegistryEntry) -> Result<bool>;

    async fn upsert(&self, entry: RegistryEntry) -> Result<()>;
}

/// In-process registry
#[derive(Debug, Default)]
pub struct MemRegistry {
    entries: Mutex<HashMap<ResourceKind, BTreeMap<String, RegistryEntry>>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemRegistry {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<RegistryEntry>> {
        Ok(self
            .entries
            .lock()
            .get(&kind)
            .and_then(|by_name| by_name.get(name))
            .cloned())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<RegistryEntry>> {
        Ok(self
            .entries
            .lock()
            .get(&kind)
            .map(|by_name| by_name.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_if_absent(&self, entry: RegistryEntry) -> Result<bool> {
        let mut entries = self.entries.lock();
        let taken = entries
            .values()
            .any(|by_name| by_name.contains_key(&entry.name));
        if taken {
            return Ok(false);
        }
        entries
            .entry(entry.kind)
            .or_default()
            .insert(entry.name.clone(), entry);
        Ok(true)
    }

    async fn upsert(&self, entry: RegistryEntry) -> Result<()> {
        self.entries
            .lock()
            .entry(entry.kind)
            .or_default()
            .insert(entry.name.clone(), entry);
        Ok(())
    }
}

/// Detects whether a host identifier is already registered under any resource kind
#[derive(Clone)]
pub struct UniquenessGuard {
    registry: Arc<dyn Registry>,
}

impl UniquenessGuard {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// The existing entry holding `host_id`, checking every kind
    pub async fn find_registered(&self, host_id: &str) -> Result<Option<RegistryEntry>> {
        for kind in ResourceKind::ALL {
            if let Some(entry) = self.registry.get(kind, host_id).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub async fn is_host_registered(&self, host_id: &str) -> Result<bool> {
        Ok(self.find_registered(host_id).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_kinds_listed_once() {
        let mut seen = std::collections::BTreeSet::new();
        for kind in ResourceKind::ALL {
            // Adding a variant without listing it here fails to compile
            match kind {
                ResourceKind::Node
                | ResourceKind::Proxy
                | ResourceKind::KubeService
                | ResourceKind::DatabaseServer
                | ResourceKind::AppServer => {}
            }
            assert!(seen.insert(kind), "{kind} listed twice");
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_guard_checks_every_kind() {
        for kind in ResourceKind::ALL {
            let registry = Arc::new(MemRegistry::new());
            let guard = UniquenessGuard::new(registry.clone());
            assert!(!guard.is_host_registered("host-a").await.unwrap());

            registry.upsert(RegistryEntry::new(kind, "host-a")).await.unwrap();
            let found = guard.find_registered("host-a").await.unwrap().unwrap();
            assert_eq!(found.kind, kind);
            assert!(!guard.is_host_registered("host-b").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_spans_kinds() {
        let registry = MemRegistry::new();
        let db = RegistryEntry::new(ResourceKind::DatabaseServer, "host-a");
        assert!(registry.insert_if_absent(db).await.unwrap());
        let node = RegistryEntry::new(ResourceKind::Node, "host-a");
        assert!(!registry.insert_if_absent(node).await.unwrap());
        assert!(registry
            .get(ResourceKind::Node, "host-a")
            .await
            .unwrap()
            .is_none());
        assert_eq!(registry.list(ResourceKind::DatabaseServer).await.unwrap().len(), 1);
    }
}
