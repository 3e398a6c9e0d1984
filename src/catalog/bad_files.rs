//! Bad-file registry: suppresses repeated scanning of persistently failing
//! files until their modification time changes

use crate::catalog::DirTable;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Why and when a file was quarantined.
#[derive(Debug, Clone, PartialEq)]
pub struct BadFileEntry {
    pub last_mod_ms: f64,
    pub reason: String,
}

/// Concurrent map from (dirIndex, fileName) to quarantine info. An entry
/// only applies while the file's modification time still matches; a newer
/// timestamp lets the file escape quarantine.
#[derive(Debug, Default)]
pub struct BadFileRegistry {
    entries: RwLock<HashMap<(u16, String), BadFileEntry>>,
}

impl BadFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: HashMap<(u16, String), BadFileEntry>) -> Self {
        Self { entries: RwLock::new(entries) }
    }

    pub fn mark(&self, dir_index: u16, name: &str, last_mod_ms: f64, reason: impl Into<String>) {
        let reason = reason.into();
        log::info!("quarantining {}/{}: {}", dir_index, name, reason);
        self.entries
            .write()
            .insert((dir_index, name.to_string()), BadFileEntry { last_mod_ms, reason });
    }

    pub fn remove(&self, dir_index: u16, name: &str) {
        self.entries.write().remove(&(dir_index, name.to_string()));
    }

    pub fn entry(&self, dir_index: u16, name: &str) -> Option<BadFileEntry> {
        self.entries.read().get(&(dir_index, name.to_string())).cloned()
    }

    /// Is the file still quarantined at this modification time?
    pub fn is_bad(&self, dir_index: u16, name: &str, last_mod_ms: f64) -> bool {
        match self.entry(dir_index, name) {
            Some(entry) => entry.last_mod_ms == last_mod_ms,
            None => false,
        }
    }

    /// Drop entries whose files no longer appear in the directory scan.
    /// Returns how many were dropped.
    pub fn prune_missing(&self, present: &HashSet<(u16, String)>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| present.contains(key));
        before - entries.len()
    }

    /// Used for remote datasets, where transient failures must not exclude
    /// files permanently.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Sorted copy of the entries, for persistence and reporting.
    pub fn snapshot(&self) -> Vec<((u16, String), BadFileEntry)> {
        let mut out: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Human-readable summary for the notification channel.
    pub fn summary(&self, dirs: &DirTable) -> String {
        let entries = self.snapshot();
        if entries.is_empty() {
            return String::new();
        }
        let mut out = format!("{} bad file(s):\n", entries.len());
        for ((dir_index, name), entry) in entries {
            let dir = dirs.get(dir_index).unwrap_or("?");
            out.push_str(&format!("  {}/{}: {}\n", dir, name, entry.reason));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarantine_until_timestamp_changes() {
        let registry = BadFileRegistry::new();
        registry.mark(0, "a.dat", 1000.0, "scan failed");
        assert!(registry.is_bad(0, "a.dat", 1000.0));
        // a newer timestamp invalidates the entry
        assert!(!registry.is_bad(0, "a.dat", 2000.0));
        assert!(!registry.is_bad(0, "b.dat", 1000.0));
    }

    #[test]
    fn test_prune_missing() {
        let registry = BadFileRegistry::new();
        registry.mark(0, "a.dat", 1000.0, "x");
        registry.mark(0, "b.dat", 1000.0, "y");
        let mut present = HashSet::new();
        present.insert((0u16, "a.dat".to_string()));
        assert_eq!(registry.prune_missing(&present), 1);
        assert!(registry.entry(0, "a.dat").is_some());
        assert!(registry.entry(0, "b.dat").is_none());
    }

    #[test]
    fn test_summary() {
        let registry = BadFileRegistry::new();
        let mut dirs = DirTable::new();
        dirs.intern("/data").unwrap();
        registry.mark(0, "a.dat", 1000.0, "bad header");
        let summary = registry.summary(&dirs);
        assert!(summary.contains("/data/a.dat"));
        assert!(summary.contains("bad header"));
    }
}
