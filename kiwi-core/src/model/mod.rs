//! Versioned, observable patcher model.
//!
//! Architecture:
//! ```text
//!                 ┌────────────── Patcher ───────────────┐
//!  add_object ──► │ objects: [Object]   links: [Link]    │ ──► pending ops ──► Transaction
//!  set_position ─►│ change bits + before-values + tombs  │
//!                 └───────────────┬──────────────────────┘
//!                                 │ once per applied transaction
//!                                 ▼
//!                      PatcherListener::patcher_changed
//! ```
//!
//! Objects are created by the [`Factory`] from their text; every mutation is
//! recorded as an invertible [`Op`](crate::transaction::Op) so the document
//! layer can commit, undo and replicate it.

pub mod classes;
pub mod factory;
pub mod ir;
pub mod link;
pub mod listener;
pub mod object;
pub mod parameter;
pub mod patcher;
pub mod pin;

pub use factory::{ClassFlag, Factory, ObjectClass, ObjectShape, ParameterClass, ParameterScope};
pub use ir::{BackendIr, IrNode, IrValue, MODEL_VERSION};
pub use link::Link;
pub use listener::{ListenerGuard, Listeners, PatcherListener};
pub use object::{Object, ObjectFlag, Point, Size, Status};
pub use parameter::{Parameter, ParameterType};
pub use patcher::Patcher;
pub use pin::{Inlet, Outlet, PinType};

use uuid::Uuid;

/// Model errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// No class registered under this name or alias
    UnknownClass(String),
    /// Class constructor rejected its arguments
    InvalidArguments { class: String, reason: String },
    /// Class name or alias registered twice
    DuplicateClass(String),
    ObjectNotFound(Uuid),
    LinkNotFound(Uuid),
    /// Link endpoints out of range or incompatible
    InvalidLink(String),
    /// Attribute not declared by the class, or wrong type
    InvalidAttribute { class: String, name: String },
    /// Value does not fit the parameter type
    InvalidParameter(String),
    /// Malformed backend representation
    InvalidIr(String),
    VersionMismatch { found: String, expected: String },
    /// commit() or undo/redo during a gesture
    GestureInProgress,
    /// commit_gesture()/end_commit_gesture() outside a gesture
    NoGestureInProgress,
    EmptyLabel,
    NothingToUndo,
    NothingToRedo,
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownClass(name) => write!(f, "Unknown object class: {name}"),
            Self::InvalidArguments { class, reason } => write!(f, "{class}: {reason}"),
            Self::DuplicateClass(name) => write!(f, "Object class already registered: {name}"),
            Self::ObjectNotFound(id) => write!(f, "Object not found: {id}"),
            Self::LinkNotFound(id) => write!(f, "Link not found: {id}"),
            Self::InvalidLink(reason) => write!(f, "Invalid link: {reason}"),
            Self::InvalidAttribute { class, name } => {
                write!(f, "Invalid attribute {name} for class {class}")
            }
            Self::InvalidParameter(reason) => write!(f, "Invalid parameter: {reason}"),
            Self::InvalidIr(reason) => write!(f, "Invalid backend data: {reason}"),
            Self::VersionMismatch { found, expected } => {
                write!(f, "Model version mismatch: found {found}, expected {expected}")
            }
            Self::GestureInProgress => write!(f, "A commit gesture is in progress"),
            Self::NoGestureInProgress => write!(f, "No commit gesture in progress"),
            Self::EmptyLabel => write!(f, "Gesture commits require a label"),
            Self::NothingToUndo => write!(f, "Nothing to undo"),
            Self::NothingToRedo => write!(f, "Nothing to redo"),
        }
    }
}

impl std::error::Error for ModelError {}
