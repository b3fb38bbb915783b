//! The CRDT replica: one document with a single `content` text register.
//!
//! Wraps a `yrs::Doc` behind the narrow surface the rest of the crate needs:
//! opaque v1 update blobs in and out, a state vector for the sync handshake,
//! origin-tagged update events, and transactional text mutation. Nothing
//! outside this module touches `yrs` types directly, so the CRDT engine
//! stays swappable.
//!
//! Origins thread through every mutation. Update events triggered by a
//! client's own frames carry that client's origin tag so fan-out can skip
//! the echo; external-store reconciliation uses [`EXTERNAL_ORIGIN`] so the
//! debounce scheduler can ignore the resulting events.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Origin, ReadTxn, StateVector, Text, TextRef, Transact, Update};

pub use yrs::Subscription;

use crate::diff::EditOp;

/// Origin tag for edits that re-apply external backing-store changes.
pub const EXTERNAL_ORIGIN: &str = "external-change";

/// Origin tag for the initial text hydration from storage.
pub const HYDRATE_ORIGIN: &str = "hydrate";

/// Replica errors.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("malformed update blob: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("replica is busy: {0}")]
    Busy(String),
}

/// An update event observed on the replica.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    /// The v1-encoded update blob that was integrated.
    pub update: Vec<u8>,
    /// Origin tag of the transaction that produced it, if any.
    pub origin: Option<String>,
}

/// A CRDT document replica holding exactly one text register, `content`.
pub struct Replica {
    doc: Doc,
    text: TextRef,
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        Self { doc, text }
    }

    /// Build a throwaway replica hydrated from an encoded full state.
    ///
    /// Used during asynchronous loads to inspect the *stored* text without
    /// contaminating (or reading through) the live replica.
    pub fn from_state(state: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new();
        replica.apply_update(state, HYDRATE_ORIGIN)?;
        Ok(replica)
    }

    /// The replica's client identifier.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Register an update listener. Fires once per integrated update, in
    /// integration order, carrying the update blob and its origin tag.
    pub fn observe<F>(&self, f: F) -> Result<Subscription, ReplicaError>
    where
        F: Fn(UpdateEvent) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, e| {
                let origin = txn
                    .origin()
                    .map(|o| String::from_utf8_lossy(o.as_ref()).into_owned());
                f(UpdateEvent { update: e.update.clone(), origin });
            })
            .map_err(|e| ReplicaError::Busy(e.to_string()))
    }

    /// Current value of the `content` register.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Encoded state vector (the sync-step-1 payload).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything a peer with `remote_sv` is missing (step-2 payload).
    pub fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Serialize the entire replica state as one update blob.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Integrate an opaque update blob. Idempotent and commutative; the
    /// update listener fires iff state changed.
    pub fn apply_update(&self, blob: &[u8], origin: &str) -> Result<(), ReplicaError> {
        let update =
            Update::decode_v1(blob).map_err(|e| ReplicaError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(Origin::from(origin));
        txn.apply_update(update)
            .map_err(|e| ReplicaError::MalformedUpdate(e.to_string()))?;
        Ok(())
    }

    /// Insert `chunk` at a byte offset on a code-point boundary.
    pub fn insert(&self, index: u32, chunk: &str, origin: &str) {
        let mut txn = self.doc.transact_mut_with(Origin::from(origin));
        self.text.insert(&mut txn, index, chunk);
    }

    /// Delete `len` bytes at a byte offset.
    pub fn delete(&self, index: u32, len: u32, origin: &str) {
        let mut txn = self.doc.transact_mut_with(Origin::from(origin));
        self.text.remove_range(&mut txn, index, len);
    }

    /// Replace the full text in a single transaction. No-op when equal.
    pub fn replace_text(&self, new_text: &str, origin: &str) {
        let mut txn = self.doc.transact_mut_with(Origin::from(origin));
        let current = self.text.get_string(&txn);
        if current == new_text {
            return;
        }
        let len = self.text.len(&txn);
        if len > 0 {
            self.text.remove_range(&mut txn, 0, len);
        }
        if !new_text.is_empty() {
            self.text.insert(&mut txn, 0, new_text);
        }
    }

    /// Walk an edit script over the text register inside one transaction,
    /// maintaining a byte-offset cursor: inserts advance it, deletes leave
    /// it in place, keeps skip over unchanged bytes.
    pub fn apply_edit_script(&self, script: &[EditOp], origin: &str) {
        if script.is_empty() {
            return;
        }
        let mut txn = self.doc.transact_mut_with(Origin::from(origin));
        let mut cursor: u32 = 0;
        for op in script {
            match op {
                EditOp::Keep(n) => cursor += *n as u32,
                EditOp::Insert(s) => {
                    self.text.insert(&mut txn, cursor, s);
                    cursor += s.len() as u32;
                }
                EditOp::Delete(n) => {
                    self.text.remove_range(&mut txn, cursor, *n as u32);
                }
            }
        }
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}
