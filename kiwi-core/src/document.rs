//! Commit, gesture, undo/redo and remote reconciliation over one patcher.
//!
//! ```text
//!              commit(label)                       take_outgoing()
//!  edits ──► pending ops ──► Transaction ──► outbox ──────────────► unacked ──► acknowledge()
//!                              │                                       ▲
//!                              └─► History step (non-empty label)      │ rebased around
//!                                                                      │
//!  receive_remote(tx) ── revert local work ─► apply tx ─► replay local ┘
//! ```
//!
//! The server's order is canonical. Local transactions that the server has
//! not acknowledged yet are applied optimistically and rebased whenever a
//! remote transaction arrives. Remote transactions never enter the history.

use std::sync::Arc;

use uuid::Uuid;

use crate::history::{History, Step};
use crate::model::{Factory, ListenerGuard, Listeners, ModelError, Patcher, PatcherListener};
use crate::transaction::Transaction;

#[derive(Debug, Default)]
struct Gesture {
    /// Everything committed since start_commit_gesture(), squashed
    transaction: Option<Transaction>,
    step_added: bool,
}

pub struct Document {
    patcher: Patcher,
    history: History,
    listeners: Listeners<dyn PatcherListener>,
    /// Committed, not yet handed to the transport
    outbox: Vec<Transaction>,
    /// Sent, waiting for the server's acknowledgement
    unacked: Vec<Transaction>,
    gesture: Option<Gesture>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new(Arc::new(Factory::with_builtin_classes()))
    }
}

impl Document {
    pub fn new(factory: Arc<Factory>) -> Self {
        Self::from_patcher(Patcher::new(factory))
    }

    pub fn from_patcher(mut patcher: Patcher) -> Self {
        patcher.clear_changes();
        patcher.take_pending();
        Self {
            patcher,
            history: History::new(),
            listeners: Listeners::new(),
            outbox: Vec::new(),
            unacked: Vec::new(),
            gesture: None,
        }
    }

    pub fn patcher(&self) -> &Patcher {
        &self.patcher
    }

    /// Local edits made here are recorded until the next commit.
    pub fn patcher_mut(&mut self) -> &mut Patcher {
        &mut self.patcher
    }

    pub fn factory(&self) -> &Arc<Factory> {
        self.patcher.factory()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    #[must_use = "the listener is removed when the guard is dropped"]
    pub fn add_listener(&self, listener: &Arc<dyn PatcherListener>) -> ListenerGuard {
        self.listeners.add(listener)
    }

    pub fn is_in_gesture(&self) -> bool {
        self.gesture.is_some()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn undo_label(&self) -> Option<&str> {
        self.history.undo_label()
    }

    pub fn redo_label(&self) -> Option<&str> {
        self.history.redo_label()
    }

    /// Committed transactions not yet acknowledged by the server.
    pub fn unacknowledged(&self) -> impl Iterator<Item = &Transaction> {
        self.unacked.iter().chain(self.outbox.iter())
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Turn pending edits into a transaction queued for the transport. Only a
    /// non-empty label adds an undo step. Returns the transaction id, or
    /// `None` when nothing was pending.
    pub fn commit(&mut self, label: &str) -> Result<Option<Uuid>, ModelError> {
        if self.gesture.is_some() {
            debug_assert!(false, "commit() called during a commit gesture");
            return Err(ModelError::GestureInProgress);
        }
        Ok(self.commit_pending(label))
    }

    fn commit_pending(&mut self, label: &str) -> Option<Uuid> {
        let ops = self.patcher.take_pending();
        if ops.is_empty() {
            self.notify();
            return None;
        }

        let transaction = Transaction::new(label, ops);
        let id = transaction.id;
        if !label.is_empty() {
            self.history.add_step(Step::new(transaction.clone()));
        }
        log::trace!("Committed transaction {} ({} ops)", id, transaction.ops.len());
        self.outbox.push(transaction);
        self.notify();
        Some(id)
    }

    pub fn start_commit_gesture(&mut self) -> Result<(), ModelError> {
        if self.gesture.is_some() {
            debug_assert!(false, "start_commit_gesture() called twice");
            return Err(ModelError::GestureInProgress);
        }
        self.gesture = Some(Gesture::default());
        Ok(())
    }

    /// Squash pending edits into the gesture's single undo step.
    pub fn commit_gesture(&mut self, label: &str) -> Result<(), ModelError> {
        let Some(gesture) = self.gesture.as_mut() else {
            debug_assert!(false, "commit_gesture() called outside a commit gesture");
            return Err(ModelError::NoGestureInProgress);
        };
        if label.is_empty() {
            debug_assert!(false, "commit_gesture() requires a label");
            return Err(ModelError::EmptyLabel);
        }

        let latest = Transaction::new(label, self.patcher.take_pending());
        let accumulated = match gesture.transaction.take() {
            Some(mut accumulated) => {
                accumulated.squash(latest);
                gesture.transaction.insert(accumulated)
            }
            None => gesture.transaction.insert(latest),
        };

        if accumulated.is_empty() {
            if gesture.step_added {
                self.history.drop_last_step();
                gesture.step_added = false;
            }
        } else if gesture.step_added {
            self.history.replace_last_step(Step::new(accumulated.clone()));
        } else {
            self.history.add_step(Step::new(accumulated.clone()));
            gesture.step_added = true;
        }
        self.notify();
        Ok(())
    }

    /// Finish the gesture and queue its squashed transaction for the transport.
    pub fn end_commit_gesture(&mut self) -> Result<(), ModelError> {
        let Some(gesture) = self.gesture.take() else {
            debug_assert!(false, "end_commit_gesture() called outside a commit gesture");
            return Err(ModelError::NoGestureInProgress);
        };
        if let Some(transaction) = gesture.transaction.filter(|tx| !tx.is_empty()) {
            self.outbox.push(transaction);
        }
        Ok(())
    }

    /// Apply the inverse of the last undo step as a new transaction that
    /// does not enter the history, and move the step to the redo stack.
    pub fn undo(&mut self) -> Result<(), ModelError> {
        self.replay_step(true)
    }

    pub fn redo(&mut self) -> Result<(), ModelError> {
        self.replay_step(false)
    }

    fn replay_step(&mut self, undo: bool) -> Result<(), ModelError> {
        if self.gesture.is_some() {
            debug_assert!(false, "undo/redo called during a commit gesture");
            return Err(ModelError::GestureInProgress);
        }
        let available = if undo {
            self.history.can_undo()
        } else {
            self.history.can_redo()
        };
        if !available {
            debug_assert!(false, "nothing to undo/redo");
            return Err(if undo {
                ModelError::NothingToUndo
            } else {
                ModelError::NothingToRedo
            });
        }

        // Edits made since the last commit go out first, outside the history.
        if self.patcher.has_pending() {
            self.commit_pending("");
        }

        let step = if undo {
            self.history.pop_undo()
        } else {
            self.history.pop_redo()
        };
        let Some(step) = step else {
            return Err(ModelError::NothingToUndo);
        };

        let replay = if undo {
            step.transaction.inverse()
        } else {
            step.transaction.clone()
        };
        if let Err(err) = self.patcher.apply_recorded(&replay) {
            if undo {
                self.history.push_undo(step);
            } else {
                self.history.push_redo(step);
            }
            return Err(err);
        }

        let ops = self.patcher.take_pending();
        if !ops.is_empty() {
            self.outbox.push(Transaction::new(step.label.clone(), ops));
        }
        if undo {
            self.history.push_redo(step);
        } else {
            self.history.push_undo(step);
        }
        self.notify();
        Ok(())
    }

    /// Hand queued transactions to the transport. They stay tracked until
    /// acknowledged or rejected.
    pub fn take_outgoing(&mut self) -> Vec<Transaction> {
        let outgoing = std::mem::take(&mut self.outbox);
        self.unacked.extend(outgoing.iter().cloned());
        outgoing
    }

    pub fn acknowledge(&mut self, id: Uuid) -> bool {
        match self.unacked.iter().position(|tx| tx.id == id) {
            Some(index) => {
                self.unacked.remove(index);
                true
            }
            None => false,
        }
    }

    /// Apply a transaction ordered by the server, rebasing local work on top.
    pub fn receive_remote(&mut self, remote: &Transaction) -> Result<(), ModelError> {
        self.rebase(Some(remote), None)
    }

    /// Roll back a transaction the server refused and replay later local work.
    pub fn reject(&mut self, id: Uuid) -> Result<(), ModelError> {
        if !self.unacked.iter().any(|tx| tx.id == id) {
            return Ok(());
        }
        self.history.remove_transaction(id);
        self.rebase(None, Some(id))
    }

    fn rebase(&mut self, remote: Option<&Transaction>, dropped: Option<Uuid>) -> Result<(), ModelError> {
        let pending = Transaction::new("", self.patcher.pending().to_vec());
        let gesture = self
            .gesture
            .as_ref()
            .and_then(|g| g.transaction.clone())
            .unwrap_or_else(|| Transaction::new("", Vec::new()));

        let local: Vec<&Transaction> = self
            .unacked
            .iter()
            .chain(self.outbox.iter())
            .chain([&gesture, &pending])
            .filter(|tx| !tx.is_empty())
            .collect();

        let mut next = self.patcher.clone();
        for tx in local.iter().rev() {
            next.apply(&tx.inverse())?;
        }
        if let Some(remote) = remote {
            next.apply(remote)?;
        }
        for tx in &local {
            if Some(tx.id) == dropped {
                continue;
            }
            if let Err(err) = next.apply(tx) {
                log::warn!("Dropping local transaction {} after rebase: {}", tx.id, err);
            }
        }

        self.patcher = next;
        if let Some(id) = dropped {
            self.unacked.retain(|tx| tx.id != id);
        }
        self.notify();
        Ok(())
    }

    /// Adopt a server snapshot, then replay local work it has not seen.
    pub fn load_snapshot(&mut self, snapshot: &Patcher) {
        let pending = self.patcher.take_pending();
        let gesture = self.gesture.as_ref().and_then(|g| g.transaction.clone());
        let mut local: Vec<Transaction> = self.unacked.drain(..).collect();
        local.append(&mut self.outbox);

        self.patcher.reset_to(snapshot);
        for tx in local.iter().chain(gesture.iter()) {
            if let Err(err) = self.patcher.apply(tx) {
                log::warn!("Dropping local transaction {} after reload: {}", tx.id, err);
            }
        }
        for op in pending {
            if let Err(err) = self.patcher.apply_op(op, true) {
                log::warn!("Dropping pending edit after reload: {}", err);
            }
        }
        self.outbox = local;
        self.notify();
    }

    /// Tell listeners about the changes of the transaction just applied.
    fn notify(&mut self) {
        if !self.patcher.has_changes() {
            return;
        }
        let patcher = &self.patcher;
        self.listeners.call(|listener| listener.patcher_changed(patcher));
        self.patcher.clear_changes();
    }
}
