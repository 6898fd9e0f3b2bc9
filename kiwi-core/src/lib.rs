//! Core of the Kiwi patcher: the cooperative scheduler, atoms, the observable
//! object graph, transactions with undo/redo, and the engine-side threading
//! contract. Networking and persistence live in `kiwi-collab`.

pub mod atom;
pub mod document;
pub mod history;
pub mod model;
pub mod runtime;
pub mod scheduler;
pub mod transaction;

pub use atom::{Atom, ParsingFlags};
pub use document::Document;
pub use history::{History, Step};
pub use model::{
    BackendIr, Factory, Inlet, Link, ModelError, Object, Outlet, Parameter, ParameterType,
    Patcher, PatcherListener, PinType, Point, Size, MODEL_VERSION,
};
pub use scheduler::{CallBack, Clock, Scheduler, SystemClock, Task, TaskRef, Timer};
pub use transaction::{Op, Transaction};
