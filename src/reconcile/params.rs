//! Observed parameter store
//!
//! The reconciliation loop is the only writer of values; UI code reads values
//! and toggles the suppress flag.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// One piece of remote state mirrored locally
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservedParameter {
    /// Last value read from the backend (`None` until the first sync)
    pub value: Option<Value>,
    /// When the value was last confirmed by the backend
    pub synced_at: Option<DateTime<Utc>>,
    /// A local edit is in flight; syncs leave the value alone
    pub suppressed: bool,
}

/// Result of merging a remote value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Suppressed, nothing touched
    Skipped,
    /// Polled value older than a push event already applied
    Stale,
    /// Same value as before, timestamp refreshed
    Unchanged,
    /// New value stored
    Changed,
}

#[derive(Debug, Default)]
struct Entries {
    params: BTreeMap<String, ObservedParameter>,
    /// Push sequence number of the last push applied per parameter
    pushed: HashMap<String, u64>,
    push_seq: u64,
}

#[derive(Debug, Default)]
pub struct ParameterStore {
    entries: RwLock<Entries>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<ObservedParameter> {
        self.entries.read().params.get(name).cloned()
    }

    pub fn value(&self, name: &str) -> Option<Value> {
        self.entries
            .read()
            .params
            .get(name)
            .and_then(|p| p.value.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, ObservedParameter> {
        self.entries.read().params.clone()
    }

    /// Mark or clear an in-flight local edit
    ///
    /// Creates the entry if it has not been synced yet, so a control can be
    /// suppressed before its first value arrives.
    pub fn set_suppressed(&self, name: &str, suppressed: bool) {
        self.entries
            .write()
            .params
            .entry(name.to_string())
            .or_default()
            .suppressed = suppressed;
    }

    /// Current push sequence number
    ///
    /// Take it before sending a poll request and pass it to `merge_polled`.
    pub(crate) fn push_mark(&self) -> u64 {
        self.entries.read().push_seq
    }

    /// Apply a polled value unless a push event for `name` landed after `mark`
    pub(crate) fn merge_polled(&self, name: &str, value: Value, mark: u64) -> Merge {
        let mut entries = self.entries.write();
        if entries.pushed.get(name).is_some_and(|&seq| seq > mark) {
            return Merge::Stale;
        }
        Self::apply(&mut entries, name, value)
    }

    /// Apply a value carried by a push event
    pub(crate) fn merge_pushed(&self, name: &str, value: Value) -> Merge {
        let mut entries = self.entries.write();
        let merge = Self::apply(&mut entries, name, value);
        if merge != Merge::Skipped {
            entries.push_seq += 1;
            let seq = entries.push_seq;
            entries.pushed.insert(name.to_string(), seq);
        }
        merge
    }

    fn apply(entries: &mut Entries, name: &str, value: Value) -> Merge {
        let entry = entries.params.entry(name.to_string()).or_default();

        if entry.suppressed {
            return Merge::Skipped;
        }

        entry.synced_at = Some(Utc::now());
        if entry.value.as_ref() == Some(&value) {
            Merge::Unchanged
        } else {
            entry.value = Some(value);
            Merge::Changed
        }
    }

    /// Forget one parameter
    pub(crate) fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        entries.pushed.remove(name);
        entries.params.remove(name).is_some()
    }
}
