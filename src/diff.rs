//! Code-point-level edit scripts between two text snapshots.
//!
//! When the backing store changes out-of-band, the coordinator cannot simply
//! replace the replica text: concurrent client edits would be lost. Instead
//! it computes a minimal edit script here and replays it through the replica,
//! letting the CRDT merge the external edit with whatever arrived meanwhile.
//!
//! The diff runs over Unicode code points; each operation carries UTF-8 byte
//! lengths so the replica can maintain a byte-offset cursor (its text
//! register addresses code-point boundaries by byte offset).

use similar::{ChangeTag, TextDiff};

/// One step of an edit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    /// Advance the cursor over `n` unchanged bytes.
    Keep(usize),
    /// Insert the string at the cursor; the cursor advances past it.
    Insert(String),
    /// Delete `n` bytes at the cursor; the cursor does not move.
    Delete(usize),
}

/// Compute the edit script transforming `old` into `new`.
///
/// Runs of equal-tagged code points are coalesced, so a typical single edit
/// yields `[Keep, Delete?, Insert?, Keep]`. Identical inputs yield an empty
/// script.
pub fn edit_script(old: &str, new: &str) -> Vec<EditOp> {
    if old == new {
        return Vec::new();
    }

    let diff = TextDiff::from_chars(old, new);
    let mut ops: Vec<EditOp> = Vec::new();

    for change in diff.iter_all_changes() {
        let len = change.value().len();
        match (change.tag(), ops.last_mut()) {
            (ChangeTag::Equal, Some(EditOp::Keep(n))) => *n += len,
            (ChangeTag::Equal, _) => ops.push(EditOp::Keep(len)),
            (ChangeTag::Delete, Some(EditOp::Delete(n))) => *n += len,
            (ChangeTag::Delete, _) => ops.push(EditOp::Delete(len)),
            (ChangeTag::Insert, Some(EditOp::Insert(s))) => s.push_str(change.value()),
            (ChangeTag::Insert, _) => ops.push(EditOp::Insert(change.value().to_string())),
        }
    }

    // A trailing Keep is a no-op for the cursor walk
    if matches!(ops.last(), Some(EditOp::Keep(_))) {
        ops.pop();
    }
    ops
}

/// Apply an edit script to a plain string. Mirrors the cursor walk the
/// replica performs; used to validate scripts in tests.
pub fn apply_script(old: &str, script: &[EditOp]) -> String {
    let mut out = String::with_capacity(old.len());
    let mut rest = old;
    for op in script {
        match op {
            EditOp::Keep(n) => {
                out.push_str(&rest[..*n]);
                rest = &rest[*n..];
            }
            EditOp::Insert(s) => out.push_str(s),
            EditOp::Delete(n) => rest = &rest[*n..],
        }
    }
    out.push_str(rest);
    out
}
