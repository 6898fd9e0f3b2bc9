//! Undo/redo stacks of labelled transactions.
//!
//! ## Design
//!
//! - Each step holds one (possibly squashed) transaction and its label
//! - Undo pops a step and moves it to the redo stack
//! - Adding a new step clears the redo stack (no branching redo)
//! - The most recent step can be replaced wholesale (gesture commits)

use crate::transaction::Transaction;

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub label: String,
    pub transaction: Transaction,
}

impl Step {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            label: transaction.label.clone(),
            transaction,
        }
    }
}

#[derive(Debug, Default)]
pub struct History {
    undo: Vec<Step>,
    redo: Vec<Step>,
    /// Maximum number of undo levels (0 = unlimited)
    max_levels: usize,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            max_levels,
            ..Self::default()
        }
    }

    /// Push a new step and clear the redo stack.
    pub fn add_step(&mut self, step: Step) {
        self.push_undo(step);
        self.redo.clear();
    }

    /// Replace the most recent undo step. Returns false if there is none.
    pub fn replace_last_step(&mut self, step: Step) -> bool {
        match self.undo.last_mut() {
            Some(last) => {
                *last = step;
                true
            }
            None => false,
        }
    }

    pub fn drop_last_step(&mut self) -> Option<Step> {
        self.undo.pop()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_label(&self) -> Option<&str> {
        self.undo.last().map(|step| step.label.as_str())
    }

    pub fn redo_label(&self) -> Option<&str> {
        self.redo.last().map(|step| step.label.as_str())
    }

    pub fn pop_undo(&mut self) -> Option<Step> {
        self.undo.pop()
    }

    pub fn pop_redo(&mut self) -> Option<Step> {
        self.redo.pop()
    }

    /// Push onto the undo stack without touching redo steps.
    pub fn push_undo(&mut self, step: Step) {
        self.undo.push(step);
        if self.max_levels > 0 && self.undo.len() > self.max_levels {
            self.undo.remove(0);
        }
    }

    pub fn push_redo(&mut self, step: Step) {
        self.redo.push(step);
    }

    /// Forget every step holding transaction `id`.
    pub fn remove_transaction(&mut self, id: uuid::Uuid) -> bool {
        let before = self.undo.len() + self.redo.len();
        self.undo.retain(|step| step.transaction.id != id);
        self.redo.retain(|step| step.transaction.id != id);
        before != self.undo.len() + self.redo.len()
    }

    pub fn undo_count(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
