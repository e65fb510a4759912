// Jackson Coxson

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use log::warn;

/// Well-known strongbox key under which the registry server publishes its
/// port
pub const REGISTRY_PORT_KEY: &str = "remotexpc.tunnel-registry";

/// A tiny on-disk key/value file
///
/// Sibling processes discover the registry server's OS-assigned port here
/// and speak HTTP to it rather than sharing memory.
#[derive(Debug, Clone)]
pub struct Strongbox {
    path: PathBuf,
}

impl Default for Strongbox {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("remotexpc-strongbox.json"),
        }
    }
}

impl Strongbox {
    /// Uses a specific file instead of the default location
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn load(&self) -> BTreeMap<String, String> {
        match std::fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Strongbox at {:?} is corrupt, starting fresh: {e}", self.path);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    fn save(&self, map: &BTreeMap<String, String>) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(map)?;
        std::fs::write(&self.path, bytes)
    }

    pub fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let mut map = self.load();
        map.insert(key.to_string(), value.to_string());
        self.save(&map)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.load().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> io::Result<()> {
        let mut map = self.load();
        if map.remove(key).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }

    /// Publishes the registry server's listening port
    pub fn store_registry_port(&self, port: u16) -> io::Result<()> {
        self.set(REGISTRY_PORT_KEY, &port.to_string())
    }

    /// Reads the registry server's port published by a sibling process
    pub fn read_registry_port(&self) -> Option<u16> {
        self.get(REGISTRY_PORT_KEY).and_then(|s| s.parse().ok())
    }
}
