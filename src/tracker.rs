//! Set of currently visible peripherals with first/last sighting times.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::identity::{identify, IdentityKey};
use crate::types::{Advertisement, TrackedDevice};

struct Entry {
    device: TrackedDevice,
    /// Insertion order; breaks ties between devices first seen at the same instant.
    seq: u64,
}

/// Owns every [`TrackedDevice`].  Not synchronised: the owning
/// [`crate::discovery::DiscoverySession`] serialises `observe` and `prune`.
#[derive(Default)]
pub struct PresenceTracker {
    devices: HashMap<IdentityKey, Entry>,
    next_seq: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting of `adv` at `now`.
    ///
    /// Returns `true` when the identity was not tracked before.  For a known
    /// identity the advertisement snapshot is replaced and `last_seen` moves
    /// forward to `now`; `first_seen` is left untouched.
    pub fn observe(&mut self, adv: Advertisement, now: Instant) -> bool {
        let key = identify(&adv);
        match self.devices.get_mut(&key) {
            Some(entry) => {
                entry.device.advertisement = adv;
                entry.device.last_seen = entry.device.last_seen.max(now);
                false
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.devices.insert(
                    key.clone(),
                    Entry {
                        device: TrackedDevice {
                            identity: key,
                            advertisement: adv,
                            first_seen: now,
                            last_seen: now,
                        },
                        seq,
                    },
                );
                true
            }
        }
    }

    /// Remove every device whose `last_seen` is older than `now - window`.
    /// A device seen exactly `window` ago is kept.  Returns how many were removed.
    pub fn prune(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.devices.len();
        self.devices
            .retain(|_, e| now.saturating_duration_since(e.device.last_seen) <= window);
        before - self.devices.len()
    }

    /// All tracked devices ordered by first sighting.
    pub fn snapshot(&self) -> Vec<TrackedDevice> {
        let mut entries: Vec<&Entry> = self.devices.values().collect();
        entries.sort_by_key(|e| (e.device.first_seen, e.seq));
        entries.into_iter().map(|e| e.device.clone()).collect()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&TrackedDevice> {
        self.devices.get(key).map(|e| &e.device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}
