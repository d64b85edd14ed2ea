//! Digest-location map
//!
//! Fixed-size open-addressed index mapping digest fingerprints to block
//! locations. Inserts displace residents cuckoo-style along their
//! candidate slots; liveness is judged purely by epoch, so entries die
//! wholesale when their block rotates out without any scan.

use std::fmt;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Where a blob lives inside the block ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub block_index: usize,
    pub offset_bytes: u64,
    pub size_bytes: u64,
    /// Epoch of the block at the time the entry was written. Zero marks
    /// an empty slot.
    pub epoch: u64,
}

#[derive(Clone, Copy)]
struct Slot {
    fingerprint: u64,
    location: Location,
}

const EMPTY_SLOT: Slot = Slot {
    fingerprint: 0,
    location: Location {
        block_index: 0,
        offset_bytes: 0,
        size_bytes: 0,
        epoch: 0,
    },
};

pub struct DigestLocationMap {
    slots: Vec<Slot>,
    seed: u64,
    max_get_attempts: u32,
    max_put_attempts: u32,
}

impl DigestLocationMap {
    pub fn new(size: usize, seed: u64, max_get_attempts: u32, max_put_attempts: u32) -> Self {
        Self {
            slots: vec![EMPTY_SLOT; size.max(1)],
            seed,
            max_get_attempts: max_get_attempts.max(1),
            max_put_attempts,
        }
    }

    /// Candidate slot for a fingerprint. All candidates derive from the
    /// same seed.
    fn slot_index(&self, fingerprint: u64, attempt: u32) -> usize {
        let mixed = xxh3_64_with_seed(&fingerprint.to_le_bytes(), self.seed ^ attempt as u64);
        (mixed % self.slots.len() as u64) as usize
    }

    /// Which candidate position of `fingerprint` maps to `index`.
    fn candidate_position(&self, fingerprint: u64, index: usize) -> u32 {
        for attempt in 0..self.max_get_attempts {
            if self.slot_index(fingerprint, attempt) == index {
                return attempt;
            }
        }
        0
    }

    /// Probe all candidate slots. An empty slot does not terminate the
    /// scan; displaced entries may sit at any of their candidates.
    pub fn get(&self, fingerprint: u64, min_epoch: u64) -> Option<Location> {
        for attempt in 0..self.max_get_attempts {
            let slot = &self.slots[self.slot_index(fingerprint, attempt)];
            if slot.location.epoch >= min_epoch && slot.fingerprint == fingerprint {
                return Some(slot.location);
            }
        }
        None
    }

    /// Insert an entry, displacing residents along their candidate
    /// rotations. After `max_put_attempts` relocations the final displaced
    /// entry is dropped; its bytes are still in the block, so the client
    /// re-uploads and idempotence restores the mapping.
    pub fn put(&mut self, fingerprint: u64, location: Location, min_epoch: u64) {
        let mut fingerprint = fingerprint;
        let mut location = location;
        let mut attempt = 0u32;
        let mut relocations = 0u32;
        loop {
            let index = self.slot_index(fingerprint, attempt);
            let resident = self.slots[index];
            let dead = resident.location.epoch < min_epoch;
            self.slots[index] = Slot {
                fingerprint,
                location,
            };
            if dead || resident.fingerprint == fingerprint {
                return;
            }

            relocations += 1;
            if relocations > self.max_put_attempts {
                log::debug!(
                    "digest-location map displacement bound reached, dropping entry {:016x}",
                    resident.fingerprint
                );
                return;
            }

            // Relocate the resident to the next candidate in its
            // rotation, skipping the slot just taken.
            fingerprint = resident.fingerprint;
            location = resident.location;
            let mut next = (self.candidate_position(fingerprint, index) + 1) % self.max_get_attempts;
            let mut skips = 0;
            while self.slot_index(fingerprint, next) == index && skips < self.max_get_attempts {
                next = (next + 1) % self.max_get_attempts;
                skips += 1;
            }
            attempt = next;
        }
    }

    /// Clear a slot, but only if it still holds exactly this entry. Used
    /// by the repair callback when a read fails verification.
    pub fn invalidate(&mut self, fingerprint: u64, location: Location) {
        for attempt in 0..self.max_get_attempts {
            let index = self.slot_index(fingerprint, attempt);
            let slot = &mut self.slots[index];
            if slot.fingerprint == fingerprint && slot.location == location {
                slot.location.epoch = 0;
                return;
            }
        }
    }
}

impl fmt::Debug for DigestLocationMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.slots.iter().filter(|s| s.location.epoch > 0).count();
        f.debug_struct("DigestLocationMap")
            .field("slots", &self.slots.len())
            .field("occupied", &live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(epoch: u64) -> Location {
        Location {
            block_index: 1,
            offset_bytes: 128,
            size_bytes: 64,
            epoch,
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut map = DigestLocationMap::new(64, 0x1234, 8, 32);
        map.put(42, location(5), 1);
        assert_eq!(map.get(42, 1), Some(location(5)));
        assert_eq!(map.get(43, 1), None);
    }

    #[test]
    fn test_epoch_liveness() {
        let mut map = DigestLocationMap::new(64, 0x1234, 8, 32);
        map.put(42, location(5), 1);
        // Once the minimum live epoch passes the entry's epoch, it is dead.
        assert_eq!(map.get(42, 6), None);
    }

    #[test]
    fn test_reinsert_replaces() {
        let mut map = DigestLocationMap::new(64, 0x1234, 8, 32);
        map.put(42, location(5), 1);
        map.put(42, location(9), 1);
        assert_eq!(map.get(42, 1), Some(location(9)));
    }

    #[test]
    fn test_dead_entries_are_overwritten() {
        let mut map = DigestLocationMap::new(4, 0x1234, 2, 4);
        for fp in 0..100u64 {
            map.put(fp, location(1), 2);
        }
        // Every insert landed on a dead slot; nothing is live.
        for fp in 0..100u64 {
            assert_eq!(map.get(fp, 2), None);
        }
    }

    #[test]
    fn test_saturation_drops_bounded() {
        // Small map, short candidate lists, tight displacement bound.
        let mut map = DigestLocationMap::new(16, 0xfeed, 2, 4);
        let count = 40u64;
        for fp in 1..=count {
            map.put(fp, location(1), 1);
        }
        let retrievable = (1..=count).filter(|fp| map.get(*fp, 1).is_some()).count();
        // The map cannot hold more than its slot count, and the last
        // insert is always placed.
        assert!(retrievable <= 16);
        assert!(map.get(count, 1).is_some());
        // More inserts than slots means at least one drop happened.
        assert!(retrievable < count as usize);
    }

    #[test]
    fn test_displacement_preserves_entries_under_capacity() {
        let mut map = DigestLocationMap::new(256, 0xbeef, 8, 32);
        for fp in 1..=64u64 {
            map.put(fp, location(1), 1);
        }
        for fp in 1..=64u64 {
            assert!(map.get(fp, 1).is_some(), "lost fingerprint {}", fp);
        }
    }

    #[test]
    fn test_invalidate_only_matching_entry() {
        let mut map = DigestLocationMap::new(64, 0x1234, 8, 32);
        map.put(42, location(5), 1);
        map.invalidate(42, location(9));
        assert_eq!(map.get(42, 1), Some(location(5)));
        map.invalidate(42, location(5));
        assert_eq!(map.get(42, 1), None);
    }
}
