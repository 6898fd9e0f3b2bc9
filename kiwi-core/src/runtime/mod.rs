//! Engine-side object instances and their threading contract.
//!
//! Three threads touch an engine object:
//! ```text
//!   main (Scheduler consumer) ── receive() / prepare() / timers / outlet output
//!   audio                     ── perform(), never blocks on main-thread locks
//!   network                   ── never calls in directly, goes through the Scheduler
//! ```
//!
//! State the audio thread reads is published through a [`SwapCell`]: the main
//! thread builds a replacement, swaps it in without blocking the reader, and
//! hands the old value to a [`ReleasePool`] that frees it once the audio thread
//! has let go of it.

mod delay;
mod metro;
mod pool;

pub use delay::DelaySimple;
pub use metro::Metro;
pub use pool::{ReleasePool, SwapCell};

use std::sync::Arc;

use crate::atom::Atom;
use crate::model::Object;
use crate::scheduler::{Clock, Scheduler, SystemClock};

/// Audio settings handed to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrepareInfo {
    pub sample_rate: f64,
    pub block_size: usize,
}

impl Default for PrepareInfo {
    fn default() -> Self {
        Self {
            sample_rate: 44_100.0,
            block_size: 64,
        }
    }
}

/// Sends atoms out of an outlet. Always called on the main thread.
pub type Emitter = Arc<dyn Fn(usize, &[Atom]) + Send + Sync>;

pub trait EngineObject: Send + Sync {
    /// Message arriving on a control inlet (main thread).
    fn receive(&self, inlet: usize, args: &[Atom]);

    /// Called off the audio thread before processing starts.
    fn prepare(&self, _info: &PrepareInfo) {}

    /// One block of signal processing (audio thread).
    fn perform(&self, _input: &[&[f32]], _output: &mut [Vec<f32>]) {}
}

/// Services engine objects use to reach the main thread.
pub struct EngineContext<C: Clock + 'static = SystemClock> {
    main: Arc<Scheduler<C>>,
}

impl<C: Clock + 'static> Clone for EngineContext<C> {
    fn clone(&self) -> Self {
        Self {
            main: Arc::clone(&self.main),
        }
    }
}

impl<C: Clock + 'static> EngineContext<C> {
    pub fn new(main: Arc<Scheduler<C>>) -> Self {
        Self { main }
    }

    pub fn main_scheduler(&self) -> &Arc<Scheduler<C>> {
        &self.main
    }

    /// Emit on the main thread: inline when already there, deferred otherwise.
    pub fn send(&self, emitter: &Emitter, outlet: usize, args: Vec<Atom>) {
        let emitter = Arc::clone(emitter);
        self.main.defer_fn(move || emitter(outlet, &args));
    }
}

/// Engine instance for `object`, for classes that have one.
pub fn instantiate<C: Clock + 'static>(
    object: &Object,
    context: &EngineContext<C>,
    emitter: Emitter,
) -> Option<Arc<dyn EngineObject>> {
    let args = object.arguments();
    match object.name() {
        "delaysimple~" => Some(Arc::new(DelaySimple::new(context, &args))),
        "metro" => Some(Arc::new(Metro::new(context, &args, emitter))),
        _ => None,
    }
}
