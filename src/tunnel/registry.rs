// Jackson Coxson

use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Registry shared between the HTTP API and the process that owns the
/// tunnels. Mutations take the write lock; readers clone a snapshot.
pub type SharedRegistry = Arc<RwLock<TunnelRegistry>>;

/// Persisted-per-process record of one live tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRegistryEntry {
    pub udid: String,
    pub device_id: u32,
    pub address: String,
    pub rsd_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_stream_port: Option<u16>,
    pub connection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u64>,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub created_at: i64,
    /// Milliseconds since the Unix epoch; refreshed on every mutation
    #[serde(default)]
    pub last_updated: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetadata {
    pub last_updated: i64,
    pub total_tunnels: usize,
    pub active_tunnels: usize,
}

/// Process-local map of `udid -> TunnelRegistryEntry`
///
/// Exactly one entry exists per UDID and `total_tunnels` always equals the
/// number of entries. Timestamps are monotonic: an update never moves
/// `lastUpdated` backwards, even under clock skew.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    entries: IndexMap<String, TunnelRegistryEntry>,
    last_updated: i64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Inserts or replaces the entry for `entry.udid`
    ///
    /// `createdAt` is preserved on update and stamped on first insert;
    /// `lastUpdated` is always refreshed.
    pub fn upsert(&mut self, mut entry: TunnelRegistryEntry) -> TunnelRegistryEntry {
        let now = self.tick();
        match self.entries.get(&entry.udid) {
            Some(existing) => {
                entry.created_at = existing.created_at;
            }
            None => {
                if entry.created_at == 0 {
                    entry.created_at = now;
                }
            }
        }
        entry.last_updated = now;
        self.entries.insert(entry.udid.clone(), entry.clone());
        entry
    }

    pub fn get(&self, udid: &str) -> Option<&TunnelRegistryEntry> {
        self.entries.get(udid)
    }

    /// First entry matching the mux-scoped numeric device ID
    pub fn find_by_device_id(&self, device_id: u32) -> Option<&TunnelRegistryEntry> {
        self.entries.values().find(|e| e.device_id == device_id)
    }

    pub fn remove(&mut self, udid: &str) -> Option<TunnelRegistryEntry> {
        let removed = self.entries.shift_remove(udid);
        if removed.is_some() {
            self.tick();
        }
        removed
    }

    pub fn entries(&self) -> &IndexMap<String, TunnelRegistryEntry> {
        &self.entries
    }

    pub fn metadata(&self) -> RegistryMetadata {
        RegistryMetadata {
            last_updated: self.last_updated,
            total_tunnels: self.entries.len(),
            active_tunnels: self.entries.len(),
        }
    }

    /// Advances the registry clock, staying strictly monotonic
    fn tick(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis().max(self.last_updated + 1);
        self.last_updated = now;
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(udid: &str, device_id: u32) -> TunnelRegistryEntry {
        TunnelRegistryEntry {
            udid: udid.to_string(),
            device_id,
            address: "fe80::dead:beef".to_string(),
            rsd_port: 58783,
            packet_stream_port: None,
            connection_type: "USB".to_string(),
            product_id: Some(4776),
            created_at: 0,
            last_updated: 0,
        }
    }

    #[test]
    fn upsert_stamps_timestamps() {
        let mut registry = TunnelRegistry::new();
        let stored = registry.upsert(entry("udid-1", 1));
        assert!(stored.created_at > 0);
        assert_eq!(stored.last_updated, stored.created_at);

        let updated = registry.upsert(entry("udid-1", 1));
        assert_eq!(updated.created_at, stored.created_at);
        assert!(updated.last_updated > stored.last_updated);
    }

    #[test]
    fn one_entry_per_udid() {
        let mut registry = TunnelRegistry::new();
        registry.upsert(entry("udid-1", 1));
        registry.upsert(entry("udid-1", 2));
        registry.upsert(entry("udid-2", 3));
        assert_eq!(registry.metadata().total_tunnels, 2);
        assert_eq!(registry.get("udid-1").unwrap().device_id, 2);
    }

    #[test]
    fn find_by_device_id_returns_first_match() {
        let mut registry = TunnelRegistry::new();
        registry.upsert(entry("udid-1", 7));
        registry.upsert(entry("udid-2", 7));
        assert_eq!(registry.find_by_device_id(7).unwrap().udid, "udid-1");
        assert!(registry.find_by_device_id(9).is_none());
    }

    #[test]
    fn remove_updates_totals() {
        let mut registry = TunnelRegistry::new();
        registry.upsert(entry("udid-1", 1));
        assert!(registry.remove("udid-1").is_some());
        assert!(registry.remove("udid-1").is_none());
        assert_eq!(registry.metadata().total_tunnels, 0);
    }

    #[test]
    fn entry_serializes_camel_case() {
        let e = entry("udid-1", 1);
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("rsdPort").is_some());
        assert!(json.get("connectionType").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("packetStreamPort").is_none());
    }
}
