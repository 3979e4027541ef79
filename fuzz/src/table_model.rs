//! Reference model for the export table's refcount bookkeeping.
//!
//! Drives the real `ExportTable` against a naive map and checks the
//! session invariants after every operation: refcounts stay positive for
//! present entries, an entry vanishes exactly at zero, and the reverse
//! (capability → id) index always agrees with the forward table.

use std::collections::HashMap;

use capstan_rpc::tables::{ExportTable, TableError};
use capstan_rpc::Capability;

/// Operations the session performs on its export table.
#[derive(Debug, Clone, Copy)]
pub enum TableOp {
    /// Share capability `cap` outbound (export or bump via dedup).
    Send { cap: u8 },
    /// The peer referenced export `slot` back to us.
    AddRef { slot: u8 },
    /// The peer released `count` refs of export `slot`.
    Release { slot: u8, count: u8 },
}

fn capability(key: u8) -> Capability {
    Capability::Local { id: key as u64 }
}

/// Run `ops` against a fresh table and verify invariants throughout.
pub fn execute_and_verify(ops: &[TableOp]) -> Result<(), String> {
    let mut table = ExportTable::new();
    // Reference state: id → (refcount, capability key).
    let mut reference: HashMap<u32, (u32, u8)> = HashMap::new();
    // Every id the table ever handed out, for slot selection.
    let mut known_ids: Vec<u32> = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            TableOp::Send { cap } => {
                let (id, refcount) = table.export(capability(cap));
                let entry = reference.entry(id).or_insert((0, cap));
                if entry.1 != cap {
                    // The id was freed and reissued; adopt the new binding.
                    if entry.0 != 0 {
                        return Err(format!(
                            "op {i}: id {id} reissued while refcount {} remains",
                            entry.0
                        ));
                    }
                    *entry = (0, cap);
                }
                entry.0 += 1;
                if refcount != entry.0 {
                    return Err(format!(
                        "op {i}: export refcount {refcount}, model says {}",
                        entry.0
                    ));
                }
                if !known_ids.contains(&id) {
                    known_ids.push(id);
                }
            }
            TableOp::AddRef { slot } => {
                if known_ids.is_empty() {
                    continue;
                }
                let id = known_ids[slot as usize % known_ids.len()];
                let live = reference.get(&id).map(|(rc, _)| *rc).unwrap_or(0) > 0;
                match table.add_ref(id) {
                    Ok(refcount) => {
                        if !live {
                            return Err(format!("op {i}: add_ref revived dead id {id}"));
                        }
                        let entry = reference.get_mut(&id).expect("live entry");
                        entry.0 += 1;
                        if refcount != entry.0 {
                            return Err(format!(
                                "op {i}: add_ref refcount {refcount}, model says {}",
                                entry.0
                            ));
                        }
                    }
                    Err(TableError::UnknownId) if !live => {}
                    Err(e) => return Err(format!("op {i}: unexpected add_ref error {e}")),
                }
            }
            TableOp::Release { slot, count } => {
                if known_ids.is_empty() {
                    continue;
                }
                let id = known_ids[slot as usize % known_ids.len()];
                let count = count as u32;
                let current = reference.get(&id).map(|(rc, _)| *rc).unwrap_or(0);
                match table.release(id, count) {
                    Ok(removed) => {
                        if current == 0 || count > current {
                            return Err(format!(
                                "op {i}: release succeeded past the model (had {current}, dropped {count})"
                            ));
                        }
                        let left = current - count;
                        if (left == 0) != removed.is_some() {
                            return Err(format!(
                                "op {i}: removal at {left} remaining reported {:?}",
                                removed
                            ));
                        }
                        if left == 0 {
                            reference.remove(&id);
                        } else {
                            reference.get_mut(&id).expect("live entry").0 = left;
                        }
                    }
                    Err(TableError::UnknownId) if current == 0 => {}
                    Err(TableError::Underflow) if count > current && current > 0 => {}
                    Err(e) => return Err(format!("op {i}: unexpected release error {e}")),
                }
            }
        }

        verify_against_model(&table, &reference, i)?;
    }
    Ok(())
}

fn verify_against_model(
    table: &ExportTable,
    reference: &HashMap<u32, (u32, u8)>,
    op_idx: usize,
) -> Result<(), String> {
    // Forward table matches the model exactly.
    let mut expected: Vec<(u32, u32)> =
        reference.iter().map(|(id, (rc, _))| (*id, *rc)).collect();
    expected.sort_unstable();
    let actual = table.refcounts();
    if actual != expected {
        return Err(format!(
            "after op {op_idx}: table {actual:?} != model {expected:?}"
        ));
    }

    // No entry exists at refcount zero.
    if actual.iter().any(|(_, rc)| *rc == 0) {
        return Err(format!("after op {op_idx}: zero refcount entry present"));
    }

    // Every model entry is present and bound to the right capability.
    for (id, (_, cap_key)) in reference {
        let entry = table.get(*id).ok_or_else(|| {
            format!("after op {op_idx}: model id {id} missing from table")
        })?;
        if entry.cap != capability(*cap_key) {
            return Err(format!(
                "after op {op_idx}: id {id} holds {:?}, model says key {cap_key}",
                entry.cap
            ));
        }
    }
    Ok(())
}
