//! Presence: who is editing, with what cursor, right now.
//!
//! Presence payloads are opaque to the hub (clients agree on their shape);
//! the hub only tracks them per client id, versions them with a clock, and
//! relays deltas. Nothing here is persisted.
//!
//! Wire format of a presence update (carried inside a presence frame):
//!
//! ```text
//! varuint entry-count
//! per entry:
//!   varuint client-id
//!   varuint clock
//!   length-prefixed payload    (empty payload = departure)
//! ```
//!
//! An entry is applied only when its clock is newer than the one we hold.
//! Departures leave a tombstone carrying the departure clock, so a relayed
//! or reordered update cannot resurrect a departed client.

use std::collections::HashMap;

use crate::protocol::{Decoder, Encoder, ProtocolError};

/// Per-client presence record. An empty payload is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PresenceEntry {
    clock: u64,
    payload: Vec<u8>,
}

impl PresenceEntry {
    fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Which client ids an applied update added, changed, or removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDelta {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl PresenceDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All ids touched by this delta, in added/updated/removed order.
    pub fn touched(&self) -> Vec<u64> {
        let mut ids =
            Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }
}

/// Presence state for one document.
#[derive(Debug, Default)]
pub struct PresenceState {
    entries: HashMap<u64, PresenceEntry>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently present (non-departed) client ids.
    pub fn client_ids(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_tombstone())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Opaque payloads per present client id.
    pub fn states(&self) -> HashMap<u64, Vec<u8>> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_tombstone())
            .map(|(id, e)| (*id, e.payload.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.is_tombstone()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a wire-encoded presence update; returns what changed.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<PresenceDelta, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        let count = dec.read_var_u64()?;
        let mut delta = PresenceDelta::default();

        for _ in 0..count {
            let client_id = dec.read_var_u64()?;
            let clock = dec.read_var_u64()?;
            let payload = dec.read_bytes()?;

            let known = self.entries.get(&client_id);
            if known.is_some_and(|e| e.clock >= clock) {
                continue; // stale
            }
            let was_present = known.is_some_and(|e| !e.is_tombstone());
            self.entries
                .insert(client_id, PresenceEntry { clock, payload: payload.to_vec() });

            match (was_present, payload.is_empty()) {
                (true, true) => delta.removed.push(client_id),
                (true, false) => delta.updated.push(client_id),
                (false, false) => delta.added.push(client_id),
                (false, true) => {} // unknown departure: tombstone only
            }
        }
        Ok(delta)
    }

    /// Encode an update covering exactly the given client ids. Tombstoned
    /// and unknown ids are encoded as departures so receivers converge.
    pub fn encode_update(&self, client_ids: &[u64]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_var_u64(client_ids.len() as u64);
        for id in client_ids {
            enc.write_var_u64(*id);
            match self.entries.get(id) {
                Some(entry) => {
                    enc.write_var_u64(entry.clock);
                    enc.write_bytes(&entry.payload);
                }
                None => {
                    enc.write_var_u64(1);
                    enc.write_bytes(&[]);
                }
            }
        }
        enc.into_vec()
    }

    /// Encode a snapshot of every present client.
    pub fn encode_full(&self) -> Vec<u8> {
        let ids = self.client_ids();
        self.encode_update(&ids)
    }

    /// Mark a departed client locally and return the wire update announcing
    /// it, or `None` if the client was not present.
    pub fn remove_client(&mut self, client_id: u64) -> Option<Vec<u8>> {
        let entry = self.entries.get_mut(&client_id)?;
        if entry.is_tombstone() {
            return None;
        }
        entry.clock += 1;
        entry.payload.clear();

        let mut enc = Encoder::new();
        enc.write_var_u64(1);
        enc.write_var_u64(client_id);
        enc.write_var_u64(entry.clock);
        enc.write_bytes(&[]);
        Some(enc.into_vec())
    }
}

/// Build a presence update announcing one client's payload.
pub fn encode_single(client_id: u64, clock: u64, payload: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_var_u64(1);
    enc.write_var_u64(client_id);
    enc.write_var_u64(clock);
    enc.write_bytes(payload);
    enc.into_vec()
}
