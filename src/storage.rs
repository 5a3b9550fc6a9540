//! Key partitioning for the key-value storage carrier.
//!
//! Both peers write into the same 200-key space, so each claims half of it
//! by comparing device ids: the numerically lower device takes keys 1..=100,
//! the higher one 101..=200. Until a remote datagram has been observed the
//! namespace is unknown and writes land on a random key with no overwrite
//! guarantee. A decision holds for a debounce window so two quick
//! observations cannot flap the namespace.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::carrier::StorageEntry;

pub const KEY_SPACE: u32 = 200;

const DEBOUNCE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Unknown,
    Low,
    High,
}

impl Namespace {
    fn range(self) -> Option<(u32, u32)> {
        match self {
            Namespace::Unknown => None,
            Namespace::Low => Some((1, 100)),
            Namespace::High => Some((101, 200)),
        }
    }
}

#[derive(Debug)]
struct State {
    namespace: Namespace,
    changed_at: Option<Instant>,
    next_key: u32,
}

/// Per-process storage key allocator. Owned by the engine, shared by the
/// planner (writes) and the storage watcher (observations).
#[derive(Debug)]
pub struct StorageKeys {
    device: i64,
    state: Mutex<State>,
}

impl StorageKeys {
    pub fn new(device: i64) -> Self {
        Self {
            device,
            state: Mutex::new(State {
                namespace: Namespace::Unknown,
                changed_at: None,
                next_key: 0,
            }),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.state.lock().unwrap().namespace
    }

    /// Feed the device id of a remote datagram observed via storage and
    /// re-derive the namespace, unless a decision was made within the
    /// debounce window.
    pub fn observe(&self, remote_device: i64) {
        let mut state = self.state.lock().unwrap();

        if let Some(changed_at) = state.changed_at {
            if changed_at.elapsed() < DEBOUNCE {
                return;
            }
        }

        let namespace = match self.device.cmp(&remote_device) {
            std::cmp::Ordering::Less => Namespace::Low,
            std::cmp::Ordering::Greater => Namespace::High,
            std::cmp::Ordering::Equal => Namespace::Unknown,
        };

        if namespace != state.namespace {
            tracing::debug!(old = ?state.namespace, new = ?namespace, "storage: namespace change");
        }

        state.namespace = namespace;
        state.changed_at = Some(Instant::now());
    }

    /// Next key to write, cycling within the claimed half of the key space.
    pub fn next_set_key(&self) -> String {
        let mut state = self.state.lock().unwrap();

        let key = match state.namespace.range() {
            None => rand::thread_rng().gen_range(1..=KEY_SPACE),
            Some((low, high)) => {
                if state.next_key < low || state.next_key > high {
                    state.next_key = low;
                }

                let key = state.next_key;
                state.next_key += 1;
                key
            }
        };

        format!("key-{key}")
    }
}

/// Every key the watcher polls.
pub fn watch_keys() -> Vec<String> {
    (1..=KEY_SPACE).map(|i| format!("key-{i}")).collect()
}

/// Values that changed between two snapshots. An empty old snapshot means
/// everything counts as changed.
pub fn diff_values(old: &[StorageEntry], new: &[StorageEntry]) -> Vec<StorageEntry> {
    if old.is_empty() {
        return new.to_vec();
    }

    let previous: std::collections::HashMap<&str, &str> = old
        .iter()
        .map(|entry| (entry.key.as_str(), entry.value.as_str()))
        .collect();

    new.iter()
        .filter(|entry| previous.get(entry.key.as_str()) != Some(&entry.value.as_str()))
        .cloned()
        .collect()
}
