//! Invertible model operations grouped into transactions.
//!
//! A transaction is what a commit produces, what undo replays inverted, and
//! what travels over the wire. Every [`Op`] carries enough of the prior state
//! to compute its own inverse.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Link, Object, Parameter, Point, Size};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    InsertObject {
        object: Object,
    },
    RemoveObject {
        object: Object,
    },
    InsertLink {
        link: Link,
    },
    RemoveLink {
        link: Link,
    },
    SetPosition {
        id: Uuid,
        from: Point,
        to: Point,
    },
    SetSize {
        id: Uuid,
        from: Size,
        to: Size,
    },
    SetAttribute {
        id: Uuid,
        name: String,
        from: Parameter,
        to: Parameter,
    },
    SetName {
        from: String,
        to: String,
    },
}

/// Field written by a setter op, used to merge consecutive writes.
#[derive(Debug, PartialEq)]
enum FieldKey<'a> {
    Position(Uuid),
    Size(Uuid),
    Attribute(Uuid, &'a str),
    Name,
}

impl Op {
    pub fn inverse(&self) -> Op {
        match self.clone() {
            Op::InsertObject { object } => Op::RemoveObject { object },
            Op::RemoveObject { object } => Op::InsertObject { object },
            Op::InsertLink { link } => Op::RemoveLink { link },
            Op::RemoveLink { link } => Op::InsertLink { link },
            Op::SetPosition { id, from, to } => Op::SetPosition { id, from: to, to: from },
            Op::SetSize { id, from, to } => Op::SetSize { id, from: to, to: from },
            Op::SetAttribute { id, name, from, to } => Op::SetAttribute {
                id,
                name,
                from: to,
                to: from,
            },
            Op::SetName { from, to } => Op::SetName { from: to, to: from },
        }
    }

    /// Object the op targets, if any.
    pub fn object_id(&self) -> Option<Uuid> {
        match self {
            Op::InsertObject { object } | Op::RemoveObject { object } => Some(object.id()),
            Op::SetPosition { id, .. } | Op::SetSize { id, .. } | Op::SetAttribute { id, .. } => {
                Some(*id)
            }
            Op::InsertLink { .. } | Op::RemoveLink { .. } | Op::SetName { .. } => None,
        }
    }

    /// A setter whose value does not change.
    pub fn is_noop(&self) -> bool {
        match self {
            Op::SetPosition { from, to, .. } => from == to,
            Op::SetSize { from, to, .. } => from == to,
            Op::SetAttribute { from, to, .. } => from == to,
            Op::SetName { from, to } => from == to,
            _ => false,
        }
    }

    fn field(&self) -> Option<FieldKey<'_>> {
        match self {
            Op::SetPosition { id, .. } => Some(FieldKey::Position(*id)),
            Op::SetSize { id, .. } => Some(FieldKey::Size(*id)),
            Op::SetAttribute { id, name, .. } => Some(FieldKey::Attribute(*id, name)),
            Op::SetName { .. } => Some(FieldKey::Name),
            _ => None,
        }
    }

    /// Take the target value of a later write to the same field.
    fn merge_to(&mut self, later: Op) {
        match (self, later) {
            (Op::SetPosition { to, .. }, Op::SetPosition { to: next, .. }) => *to = next,
            (Op::SetSize { to, .. }, Op::SetSize { to: next, .. }) => *to = next,
            (Op::SetAttribute { to, .. }, Op::SetAttribute { to: next, .. }) => *to = next,
            (Op::SetName { to, .. }, Op::SetName { to: next, .. }) => *to = next,
            _ => {}
        }
    }
}

/// An atomic, ordered set of model operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub label: String,
    pub ops: Vec<Op>,
}

impl Transaction {
    pub fn new(label: impl Into<String>, ops: Vec<Op>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            ops,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Ops that undo this transaction, in reverse order, under a new id.
    pub fn inverse(&self) -> Transaction {
        Transaction::new(
            self.label.clone(),
            self.ops.iter().rev().map(Op::inverse).collect(),
        )
    }

    /// Append `later`, collapsing repeated writes to the same field into one
    /// op that keeps the first `from` and the last `to`.
    ///
    /// A write is only merged across ops that do not insert or remove its
    /// object. Setters that end where they started are dropped.
    pub fn squash(&mut self, later: Transaction) {
        for op in later.ops {
            let merged = op.field().and_then(|key| {
                self.ops
                    .iter()
                    .rposition(|prior| {
                        prior.field().as_ref() == Some(&key)
                            || (matches!(prior, Op::InsertObject { .. } | Op::RemoveObject { .. })
                                && prior.object_id() == op.object_id())
                    })
                    .filter(|&index| self.ops[index].field().is_some())
            });

            match merged {
                Some(index) => {
                    self.ops[index].merge_to(op);
                    if self.ops[index].is_noop() {
                        self.ops.remove(index);
                    }
                }
                None => self.ops.push(op),
            }
        }
        self.label = later.label;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Factory;

    fn moved(id: Uuid, from: (f64, f64), to: (f64, f64)) -> Op {
        Op::SetPosition {
            id,
            from: Point::new(from.0, from.1),
            to: Point::new(to.0, to.1),
        }
    }

    #[test]
    fn test_inverse_reverses_order() {
        let id = Uuid::new_v4();
        let tx = Transaction::new(
            "move",
            vec![moved(id, (0.0, 0.0), (1.0, 1.0)), moved(id, (1.0, 1.0), (2.0, 2.0))],
        );
        let inverse = tx.inverse();
        assert_ne!(inverse.id, tx.id);
        assert_eq!(inverse.ops[0], moved(id, (2.0, 2.0), (1.0, 1.0)));
        assert_eq!(inverse.ops[1], moved(id, (1.0, 1.0), (0.0, 0.0)));
    }

    #[test]
    fn test_squash_collapses_writes() {
        let id = Uuid::new_v4();
        let mut tx = Transaction::new("drag", vec![moved(id, (0.0, 0.0), (1.0, 0.0))]);
        for step in 2..=5 {
            let x = step as f64;
            tx.squash(Transaction::new(
                "drag",
                vec![moved(id, (x - 1.0, 0.0), (x, 0.0))],
            ));
        }
        assert_eq!(tx.ops, vec![moved(id, (0.0, 0.0), (5.0, 0.0))]);
    }

    #[test]
    fn test_squash_drops_round_trip() {
        let id = Uuid::new_v4();
        let mut tx = Transaction::new("drag", vec![moved(id, (0.0, 0.0), (3.0, 3.0))]);
        tx.squash(Transaction::new("drag", vec![moved(id, (3.0, 3.0), (0.0, 0.0))]));
        assert!(tx.is_empty());
    }

    #[test]
    fn test_squash_keeps_distinct_fields() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut tx = Transaction::new("move", vec![moved(a, (0.0, 0.0), (1.0, 1.0))]);
        tx.squash(Transaction::new("move", vec![moved(b, (0.0, 0.0), (1.0, 1.0))]));
        assert_eq!(tx.ops.len(), 2);
    }

    #[test]
    fn test_squash_does_not_cross_reinsertion() {
        let factory = Factory::with_builtin_classes();
        let object = factory.create_from_text("print").unwrap();
        let id = object.id();

        let mut tx = Transaction::new(
            "edit",
            vec![
                moved(id, (0.0, 0.0), (1.0, 1.0)),
                Op::RemoveObject { object: object.clone() },
                Op::InsertObject { object },
            ],
        );
        tx.squash(Transaction::new("edit", vec![moved(id, (1.0, 1.0), (2.0, 2.0))]));
        assert_eq!(tx.ops.len(), 4);
    }
}
