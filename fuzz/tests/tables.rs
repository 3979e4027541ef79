//! Bolero fuzzer for export-table refcount invariants.
//!
//! Properties tested:
//! - Refcounts never go negative; entries vanish exactly at zero
//! - Dedup: re-exporting a live capability reuses its id
//! - The forward table and the reverse (capability → id) index agree

use bolero::check;
use capstan_fuzz::table_model::{execute_and_verify, TableOp};

fn main() {
    check!()
        .with_type::<Vec<TableOpInput>>()
        .for_each(|ops| {
            let ops: Vec<TableOp> = ops.iter().map(|op| op.to_table_op()).collect();
            if let Err(e) = execute_and_verify(&ops) {
                panic!("table invariant violated: {}", e);
            }
        });
}

/// Fuzz-friendly input type for table operations.
#[derive(Debug, Clone, bolero::TypeGenerator)]
enum TableOpInput {
    Send { cap: u8 },
    AddRef { slot: u8 },
    Release { slot: u8, count: u8 },
}

impl TableOpInput {
    fn to_table_op(&self) -> TableOp {
        match self {
            TableOpInput::Send { cap } => TableOp::Send { cap: *cap % 8 },
            TableOpInput::AddRef { slot } => TableOp::AddRef { slot: *slot },
            TableOpInput::Release { slot, count } => TableOp::Release {
                slot: *slot,
                count: *count % 5,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(unused_imports)]
    use capstan_fuzz::table_model::{execute_and_verify, TableOp};

    #[test]
    fn seeds() {
        execute_and_verify(&[
            TableOp::Send { cap: 0 },
            TableOp::Send { cap: 0 },
            TableOp::Release { slot: 0, count: 1 },
            TableOp::AddRef { slot: 0 },
            TableOp::Release { slot: 0, count: 2 },
        ])
        .unwrap();
    }
}
