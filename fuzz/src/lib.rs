//! capstan-fuzz: pure models of capstan invariants for property testing.

pub mod framing_model;
pub mod pointer_model;
pub mod table_model;
