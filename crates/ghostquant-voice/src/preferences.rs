//! Preference storage: string key/value pairs that survive restarts.
//!
//! `SledPreferenceStore` persists to disk; `MemoryPreferenceStore` keeps values
//! in a `DashMap` for tests and throwaway sessions.

use crate::error::{VoiceError, VoiceResult};
use dashmap::DashMap;
use sled::Db;
use std::path::Path;
use std::sync::Arc;

/// Keys used by the hands-free manager.
pub mod keys {
    pub const HANDS_FREE_ENABLED: &str = "ghostquant_handsfree_enabled";
    pub const HANDS_FREE_AUTO_START: &str = "ghostquant_handsfree_autostart";
    pub const HANDS_FREE_ACTIVE_MS: &str = "ghostquant_handsfree_total_active_ms";
    pub const HANDS_FREE_SESSIONS: &str = "ghostquant_handsfree_session_count";
}

/// String key/value store.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> VoiceResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> VoiceResult<()>;
    fn remove(&self, key: &str) -> VoiceResult<()>;
}

/// Read a typed value; missing or unparsable entries yield `None`.
pub fn get_parsed<T: std::str::FromStr>(
    store: &dyn PreferenceStore,
    key: &str,
) -> VoiceResult<Option<T>> {
    Ok(store.get(key)?.and_then(|v| v.trim().parse().ok()))
}

/// Sled-backed store, one tree for all voice preferences.
pub struct SledPreferenceStore {
    db: Db,
    tree: sled::Tree,
}

impl SledPreferenceStore {
    const TREE: &'static str = "voice_preferences";

    pub fn open<P: AsRef<Path>>(path: P) -> VoiceResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(Self::TREE)?;
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> VoiceResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl PreferenceStore for SledPreferenceStore {
    fn get(&self, key: &str) -> VoiceResult<Option<String>> {
        match self.tree.get(key.as_bytes())? {
            Some(raw) => String::from_utf8(raw.to_vec())
                .map(Some)
                .map_err(|e| VoiceError::Preferences(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> VoiceResult<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> VoiceResult<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }
}

/// In-memory store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferenceStore {
    values: Arc<DashMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> VoiceResult<Option<String>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    fn set(&self, key: &str, value: &str) -> VoiceResult<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> VoiceResult<()> {
        self.values.remove(key);
        Ok(())
    }
}
