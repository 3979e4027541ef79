//! The four session tables: questions, answers, exports, imports.
//!
//! Pure synchronous state, mutated only from the session task. Ids are
//! monotonic with free-list reuse: a question or export id returns to the
//! pool only after its lifecycle completes, never while the peer might
//! still reference it.

use std::collections::HashMap;

use crate::capability::Capability;

pub type QuestionId = u32;
pub type AnswerId = u32;
pub type ExportId = u32;
pub type ImportId = u32;

/// Errors from table mutations that indicate a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("id not present in table")]
    UnknownId,
    #[error("release count exceeds reference count")]
    Underflow,
    #[error("id already present in table")]
    Duplicate,
}

// ---------------------------------------------------------------------------
// Questions
// ---------------------------------------------------------------------------

/// An outstanding outbound call awaiting its return. `W` is the waiter
/// handle type (a oneshot sender in the live vat, plain data in models);
/// `R` is the result the return resolves to.
#[derive(Debug)]
pub struct Question<W, R> {
    pub waiters: Vec<W>,
    /// Set once the matching return is processed. The entry survives until
    /// finish so late pipelined references can still resolve.
    pub result: Option<R>,
    /// The originator's liveness monitor. Cleared when the caller drops its
    /// handle; a fulfilled question with a dead originator is finished
    /// immediately.
    pub originator_alive: bool,
    /// Answered over the local dispatch path; no finish message is owed.
    pub local: bool,
    /// Import ids acquired from the return's cap table, released when
    /// finish is sent with `release_result_caps`.
    pub result_imports: Vec<ImportId>,
    /// Export ids created for the call's params, released if the return
    /// asks for it.
    pub param_exports: Vec<ExportId>,
}

impl<W, R> Question<W, R> {
    fn new(local: bool) -> Question<W, R> {
        Question {
            waiters: Vec::new(),
            result: None,
            originator_alive: true,
            local,
            result_imports: Vec::new(),
            param_exports: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct QuestionTable<W, R> {
    entries: HashMap<QuestionId, Question<W, R>>,
    next_id: QuestionId,
    free: Vec<QuestionId>,
}

impl<W, R> Default for QuestionTable<W, R> {
    fn default() -> Self {
        QuestionTable {
            entries: HashMap::new(),
            next_id: 0,
            free: Vec::new(),
        }
    }
}

impl<W, R> QuestionTable<W, R> {
    pub fn new() -> QuestionTable<W, R> {
        Self::default()
    }

    /// Allocate an id and insert a fresh question.
    pub fn insert(&mut self, local: bool) -> QuestionId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        self.entries.insert(id, Question::new(local));
        id
    }

    pub fn get_mut(&mut self, id: QuestionId) -> Option<&mut Question<W, R>> {
        self.entries.get_mut(&id)
    }

    pub fn get(&self, id: QuestionId) -> Option<&Question<W, R>> {
        self.entries.get(&id)
    }

    /// Remove a completed question, returning its id to the pool.
    pub fn remove(&mut self, id: QuestionId) -> Option<Question<W, R>> {
        let q = self.entries.remove(&id)?;
        self.free.push(id);
        Some(q)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<QuestionId> {
        self.entries.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Answers
// ---------------------------------------------------------------------------

/// Completion state of an inbound call. `P` is the payload handle type.
#[derive(Debug)]
pub enum AnswerState<P> {
    Pending,
    Ready(P),
}

/// An inbound call being served. `W` is the parked-work handle type:
/// pipelined calls that arrived before the answer was ready.
#[derive(Debug)]
pub struct Answer<W, P> {
    pub state: AnswerState<P>,
    pub parked: Vec<W>,
    /// Export ids created for the return's cap table, released on a finish
    /// that asks for it.
    pub result_exports: Vec<ExportId>,
}

#[derive(Debug)]
pub struct AnswerTable<W, P> {
    entries: HashMap<AnswerId, Answer<W, P>>,
}

impl<W, P> Default for AnswerTable<W, P> {
    fn default() -> Self {
        AnswerTable { entries: HashMap::new() }
    }
}

impl<W, P> AnswerTable<W, P> {
    pub fn new() -> AnswerTable<W, P> {
        Self::default()
    }

    /// Record an inbound call under the id the peer assigned.
    pub fn insert(&mut self, id: AnswerId) -> Result<&mut Answer<W, P>, TableError> {
        if self.entries.contains_key(&id) {
            return Err(TableError::Duplicate);
        }
        Ok(self.entries.entry(id).or_insert(Answer {
            state: AnswerState::Pending,
            parked: Vec::new(),
            result_exports: Vec::new(),
        }))
    }

    pub fn get_mut(&mut self, id: AnswerId) -> Option<&mut Answer<W, P>> {
        self.entries.get_mut(&id)
    }

    pub fn get(&self, id: AnswerId) -> Option<&Answer<W, P>> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: AnswerId) -> Option<Answer<W, P>> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub refcount: u32,
    pub cap: Capability,
}

/// Local capabilities addressable by the peer, with a reverse index for
/// dedup: sharing the same capability twice reuses one id.
#[derive(Debug, Default)]
pub struct ExportTable {
    entries: HashMap<ExportId, Export>,
    by_cap: HashMap<Capability, ExportId>,
    next_id: ExportId,
    free: Vec<ExportId>,
}

impl ExportTable {
    pub fn new() -> ExportTable {
        Self::default()
    }

    /// Export a capability (or bump an existing export of it). Returns the
    /// id and the new reference count.
    pub fn export(&mut self, cap: Capability) -> (ExportId, u32) {
        if let Some(&id) = self.by_cap.get(&cap) {
            let entry = self.entries.get_mut(&id).expect("reverse index is consistent");
            entry.refcount += 1;
            return (id, entry.refcount);
        }
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        self.entries.insert(id, Export { refcount: 1, cap: cap.clone() });
        self.by_cap.insert(cap, id);
        (id, 1)
    }

    /// Bump an export the peer referenced back to us.
    pub fn add_ref(&mut self, id: ExportId) -> Result<u32, TableError> {
        let entry = self.entries.get_mut(&id).ok_or(TableError::UnknownId)?;
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    /// Drop `count` references; removes the entry when the count reaches
    /// zero and returns the capability it held.
    pub fn release(&mut self, id: ExportId, count: u32) -> Result<Option<Capability>, TableError> {
        let entry = self.entries.get_mut(&id).ok_or(TableError::UnknownId)?;
        if count > entry.refcount {
            return Err(TableError::Underflow);
        }
        entry.refcount -= count;
        if entry.refcount == 0 {
            let entry = self.entries.remove(&id).expect("entry just touched");
            self.by_cap.remove(&entry.cap);
            self.free.push(id);
            return Ok(Some(entry.cap));
        }
        Ok(None)
    }

    pub fn get(&self, id: ExportId) -> Option<&Export> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: ExportId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn refcounts(&self) -> Vec<(ExportId, u32)> {
        let mut v: Vec<_> = self.entries.iter().map(|(id, e)| (*id, e.refcount)).collect();
        v.sort_unstable();
        v
    }
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub refcount: u32,
    pub cap: Capability,
}

/// Peer capabilities held by this vat, keyed by the peer's export id.
#[derive(Debug, Default)]
pub struct ImportTable {
    entries: HashMap<ImportId, Import>,
}

impl ImportTable {
    pub fn new() -> ImportTable {
        Self::default()
    }

    /// Record one more reference to a peer export.
    pub fn import(&mut self, id: ImportId, cap: Capability) -> u32 {
        let entry = self
            .entries
            .entry(id)
            .or_insert(Import { refcount: 0, cap });
        entry.refcount += 1;
        entry.refcount
    }

    /// Drop `count` references, removing the entry at zero.
    pub fn release(&mut self, id: ImportId, count: u32) -> Result<Option<Capability>, TableError> {
        let entry = self.entries.get_mut(&id).ok_or(TableError::UnknownId)?;
        if count > entry.refcount {
            return Err(TableError::Underflow);
        }
        entry.refcount -= count;
        if entry.refcount == 0 {
            let entry = self.entries.remove(&id).expect("entry just touched");
            return Ok(Some(entry.cap));
        }
        Ok(None)
    }

    pub fn get(&self, id: ImportId) -> Option<&Import> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn refcounts(&self) -> Vec<(ImportId, u32)> {
        let mut v: Vec<_> = self.entries.iter().map(|(id, e)| (*id, e.refcount)).collect();
        v.sort_unstable();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: u64) -> Capability {
        Capability::Local { id }
    }

    #[test]
    fn question_ids_are_not_reused_until_removed() {
        let mut t: QuestionTable<(), ()> = QuestionTable::new();
        let a = t.insert(false);
        let b = t.insert(false);
        assert_ne!(a, b);
        t.remove(a);
        let c = t.insert(false);
        assert_eq!(c, a);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn duplicate_answer_ids_are_rejected() {
        let mut t: AnswerTable<(), ()> = AnswerTable::new();
        t.insert(7).unwrap();
        assert_eq!(t.insert(7).unwrap_err(), TableError::Duplicate);
    }

    #[test]
    fn export_dedup_shares_one_id() {
        let mut t = ExportTable::new();
        let (id1, rc1) = t.export(local(1));
        let (id2, rc2) = t.export(local(1));
        assert_eq!(id1, id2);
        assert_eq!((rc1, rc2), (1, 2));
        let (other, _) = t.export(local(2));
        assert_ne!(other, id1);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn export_release_removes_at_zero() {
        let mut t = ExportTable::new();
        let (id, _) = t.export(local(1));
        t.add_ref(id).unwrap();
        assert_eq!(t.release(id, 1).unwrap(), None);
        assert_eq!(t.release(id, 1).unwrap(), Some(local(1)));
        assert!(!t.contains(id));
        // Removed entries reject further releases.
        assert_eq!(t.release(id, 1).unwrap_err(), TableError::UnknownId);
        // A fresh export of the same capability gets a fresh entry (the
        // freed id may be reused).
        let (id2, rc) = t.export(local(1));
        assert_eq!(rc, 1);
        assert!(t.contains(id2));
    }

    #[test]
    fn export_release_underflow_is_an_error() {
        let mut t = ExportTable::new();
        let (id, _) = t.export(local(1));
        assert_eq!(t.release(id, 5).unwrap_err(), TableError::Underflow);
        // The failed release must not have touched the count.
        assert_eq!(t.get(id).unwrap().refcount, 1);
    }

    #[test]
    fn import_refcounts_accumulate_and_release() {
        let mut t = ImportTable::new();
        assert_eq!(t.import(9, Capability::Remote { id: 9 }), 1);
        assert_eq!(t.import(9, Capability::Remote { id: 9 }), 2);
        assert_eq!(t.release(9, 2).unwrap(), Some(Capability::Remote { id: 9 }));
        assert!(t.is_empty());
    }

    #[test]
    fn reverse_index_stays_consistent() {
        let mut t = ExportTable::new();
        let (a, _) = t.export(local(1));
        let (b, _) = t.export(local(2));
        t.release(a, 1).unwrap();
        // The freed id may be handed to a different capability; lookups by
        // capability must keep pointing at the live entries.
        let (c, _) = t.export(local(3));
        let (b2, rc) = t.export(local(2));
        assert_eq!(b2, b);
        assert_eq!(rc, 2);
        assert_eq!(t.get(c).unwrap().cap, local(3));
    }
}
