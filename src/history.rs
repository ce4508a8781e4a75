//! Undo/redo stacks and the paused-history buffer.
//!
//! History entries are batches of [`HistoryOp`]s: compensating storage
//! ops interleaved with presence reverse deltas, stored in inverse
//! execution order so replaying a batch front to back undoes the last
//! mutation first. The undo stack is bounded; the oldest batch falls off
//! on overflow. While history is paused, batches accumulate in a side
//! buffer and coalesce into a single undoable unit on resume.

use std::collections::VecDeque;

use crate::protocol::{JsonMap, Op};

/// Maximum number of batches kept on the undo stack.
pub const MAX_UNDO_DEPTH: usize = 50;

/// One entry of a history batch: a storage op or a presence delta.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOp {
    Op(Op),
    Presence { data: JsonMap },
}

/// The batch & history engine's stacks.
#[derive(Debug, Default)]
pub struct History {
    undo: VecDeque<Vec<HistoryOp>>,
    redo: Vec<Vec<HistoryOp>>,
    paused: Option<Vec<HistoryOp>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a reverse-op batch. While paused, the batch is prepended to
    /// the paused buffer instead (newest first, like any reverse list).
    pub fn push_undo(&mut self, batch: Vec<HistoryOp>) {
        if batch.is_empty() {
            return;
        }
        if let Some(buffer) = &mut self.paused {
            let mut merged = batch;
            merged.append(buffer);
            *buffer = merged;
            return;
        }
        self.undo.push_back(batch);
        while self.undo.len() > MAX_UNDO_DEPTH {
            self.undo.pop_front();
        }
    }

    pub fn push_redo(&mut self, batch: Vec<HistoryOp>) {
        if !batch.is_empty() {
            self.redo.push(batch);
        }
    }

    pub fn pop_undo(&mut self) -> Option<Vec<HistoryOp>> {
        self.undo.pop_back()
    }

    pub fn pop_redo(&mut self) -> Option<Vec<HistoryOp>> {
        self.redo.pop()
    }

    /// Any successful local storage op outside undo/redo clears redo.
    pub fn clear_redo(&mut self) {
        self.redo.clear();
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty() || self.paused.as_ref().is_some_and(|b| !b.is_empty())
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Start accumulating reverse batches in the paused buffer.
    /// Idempotent.
    pub fn pause(&mut self) {
        if self.paused.is_none() {
            self.paused = Some(Vec::new());
        }
    }

    /// Stop pausing. A non-empty buffer becomes one undo batch.
    pub fn resume(&mut self) {
        if let Some(buffer) = self.paused.take() {
            self.push_undo(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete(id: &str) -> Vec<HistoryOp> {
        vec![HistoryOp::Op(Op::DeleteCrdt {
            op_id: None,
            id: id.into(),
        })]
    }

    #[test]
    fn test_depth_cap_drops_oldest() {
        let mut history = History::new();
        for i in 0..(MAX_UNDO_DEPTH + 10) {
            history.push_undo(delete(&format!("1:{i}")));
        }
        assert_eq!(history.undo_depth(), MAX_UNDO_DEPTH);

        // The ten oldest entries are gone; the newest is on top.
        let top = history.pop_undo().unwrap();
        assert_eq!(top, delete(&format!("1:{}", MAX_UNDO_DEPTH + 9)));
    }

    #[test]
    fn test_empty_batches_are_ignored() {
        let mut history = History::new();
        history.push_undo(Vec::new());
        history.push_redo(Vec::new());
        assert!(!history.can_undo() && !history.can_redo());
    }

    #[test]
    fn test_pause_accumulates_and_resume_coalesces() {
        let mut history = History::new();
        history.pause();
        history.push_undo(delete("1:0"));
        history.push_undo(delete("1:1"));
        assert_eq!(history.undo_depth(), 0);
        assert!(history.can_undo()); // buffered work still counts

        history.resume();
        assert_eq!(history.undo_depth(), 1);
        // Later batches sit in front so they replay first.
        let batch = history.pop_undo().unwrap();
        assert_eq!(batch, [delete("1:1"), delete("1:0")].concat());
    }

    #[test]
    fn test_resume_with_empty_buffer_pushes_nothing() {
        let mut history = History::new();
        history.pause();
        history.resume();
        assert_eq!(history.undo_depth(), 0);
    }

    #[test]
    fn test_pause_is_idempotent() {
        let mut history = History::new();
        history.pause();
        history.push_undo(delete("1:0"));
        history.pause(); // must not wipe the buffer
        history.resume();
        assert_eq!(history.undo_depth(), 1);
    }

    #[test]
    fn test_clear_redo() {
        let mut history = History::new();
        history.push_redo(delete("1:0"));
        assert!(history.can_redo());
        history.clear_redo();
        assert!(!history.can_redo());
    }
}
