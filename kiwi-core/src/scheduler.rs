//! Cooperative task scheduler for cross-thread event marshalling.
//!
//! Architecture:
//! ```text
//! Producer A ──┐  schedule / unschedule
//!              ├──► ArrayQueue<Command> (1024) ──► process() ──► time-sorted events ──► execute()
//! Producer B ──┘                                   (consumer thread only)
//! ```
//!
//! Any thread may schedule or cancel work; only the consumer thread runs
//! `process()` and therefore executes tasks. A task handle is an
//! `Arc<dyn Task>` and its allocation is its identity: scheduling the same
//! handle again replaces its pending occurrence.
//!
//! Performance target: schedule + process of 1K zero-delay tasks < 1ms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

/// Capacity of the producer → consumer command queue.
pub const QUEUE_CAPACITY: usize = 1024;

/// Time source of a scheduler, as an offset from the clock's origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Monotonic wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A unit of work executed on the consumer thread.
pub trait Task: Send + Sync {
    fn execute(&self);
}

pub type TaskRef = Arc<dyn Task>;

/// One-shot task wrapping a closure.
pub struct CallBack {
    func: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CallBack {
    pub fn new(func: impl FnOnce() + Send + 'static) -> Self {
        Self {
            func: Mutex::new(Some(Box::new(func))),
        }
    }
}

impl Task for CallBack {
    fn execute(&self) {
        let func = lock(&self.func).take();
        if let Some(func) = func {
            func();
        }
    }
}

enum Command {
    Schedule { task: TaskRef, time: Duration },
    Unschedule { task: TaskRef },
}

struct Event {
    task: TaskRef,
    time: Duration,
}

fn task_key(task: &TaskRef) -> *const () {
    Arc::as_ptr(task) as *const ()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Insert keeps events sorted; equal times stay in arrival order.
fn apply_command(events: &mut Vec<Event>, command: Command) {
    match command {
        Command::Schedule { task, time } => {
            let key = task_key(&task);
            events.retain(|event| task_key(&event.task) != key);
            let index = events.partition_point(|event| event.time <= time);
            events.insert(index, Event { task, time });
        }
        Command::Unschedule { task } => {
            let key = task_key(&task);
            events.retain(|event| task_key(&event.task) != key);
        }
    }
}

/// Per-thread cooperative scheduler.
///
/// Construct one per logical thread (UI, network, DSP) and pass it by
/// `Arc` to the collaborators that need to post work onto that thread.
pub struct Scheduler<C: Clock = SystemClock> {
    clock: C,
    commands: ArrayQueue<Command>,
    events: Mutex<Vec<Event>>,
    consumer: Mutex<ThreadId>,
    process_lock: Mutex<()>,
}

impl Scheduler<SystemClock> {
    /// Create a scheduler whose consumer is the calling thread.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }
}

impl Default for Scheduler<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Scheduler<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            commands: ArrayQueue::new(QUEUE_CAPACITY),
            events: Mutex::new(Vec::new()),
            consumer: Mutex::new(thread::current().id()),
            process_lock: Mutex::new(()),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Make the calling thread the one allowed to call [`process`](Self::process).
    pub fn set_thread_as_consumer(&self) {
        *lock(&self.consumer) = thread::current().id();
    }

    pub fn is_this_consumer_thread(&self) -> bool {
        *lock(&self.consumer) == thread::current().id()
    }

    /// Run `task` on the consumer thread no earlier than `now() + delay`.
    ///
    /// A pending occurrence of the same handle is replaced.
    pub fn schedule(&self, task: TaskRef, delay: Duration) {
        let time = self.now() + delay;
        self.push_command(Command::Schedule { task, time });
    }

    /// Schedule a one-shot closure.
    pub fn schedule_fn<F>(&self, func: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Arc::new(CallBack::new(func)), delay);
    }

    /// Cancel the pending occurrence of `task`. Does not wait for a running one.
    pub fn unschedule(&self, task: &TaskRef) {
        self.push_command(Command::Unschedule { task: task.clone() });
    }

    /// Execute now when called from the consumer thread, otherwise schedule
    /// with zero delay.
    pub fn defer(&self, task: TaskRef) {
        if self.is_this_consumer_thread() {
            task.execute();
        } else {
            self.schedule(task, Duration::ZERO);
        }
    }

    pub fn defer_fn<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_this_consumer_thread() {
            func();
        } else {
            self.schedule_fn(func, Duration::ZERO);
        }
    }

    /// Hold off `process()` while the guard lives.
    ///
    /// Must not be taken from inside a task body on the consumer thread.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.process_lock)
    }

    /// Apply queued commands, then run every event that is due.
    ///
    /// Only the commands present on entry are applied, so tasks scheduled
    /// by the executed tasks wait for the next call.
    pub fn process(&self) {
        debug_assert!(
            self.is_this_consumer_thread(),
            "Scheduler::process called outside the consumer thread"
        );

        let _guard = lock(&self.process_lock);

        let pending = self.commands.len();
        {
            let mut events = lock(&self.events);
            for _ in 0..pending {
                match self.commands.pop() {
                    Some(command) => apply_command(&mut events, command),
                    None => break,
                }
            }
        }

        let now = self.now();
        loop {
            let due = {
                let mut events = lock(&self.events);
                if events.first().is_some_and(|event| event.time <= now) {
                    Some(events.remove(0))
                } else {
                    None
                }
            };

            match due {
                Some(event) => event.task.execute(),
                None => break,
            }
        }
    }

    /// Number of events waiting in the time-ordered list.
    pub fn pending_events(&self) -> usize {
        lock(&self.events).len()
    }

    fn push_command(&self, mut command: Command) {
        loop {
            match self.commands.push(command) {
                Ok(()) => return,
                Err(rejected) => {
                    if self.is_this_consumer_thread() {
                        // Queue full: fold it into the event list ourselves.
                        let mut events = lock(&self.events);
                        while let Some(pending) = self.commands.pop() {
                            apply_command(&mut events, pending);
                        }
                        apply_command(&mut events, rejected);
                        return;
                    }
                    log::trace!("Scheduler command queue full, producer yielding");
                    command = rejected;
                    thread::yield_now();
                }
            }
        }
    }
}

struct TimerTask<C: Clock + 'static> {
    scheduler: Weak<Scheduler<C>>,
    this: Weak<TimerTask<C>>,
    period: Mutex<Duration>,
    running: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl<C: Clock + 'static> TimerTask<C> {
    fn handle(&self) -> Option<TaskRef> {
        self.this.upgrade().map(|task| task as TaskRef)
    }
}

impl<C: Clock + 'static> Task for TimerTask<C> {
    fn execute(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        (self.callback)();

        if self.running.load(Ordering::Acquire) {
            if let (Some(scheduler), Some(task)) = (self.scheduler.upgrade(), self.handle()) {
                let period = *lock(&self.period);
                scheduler.schedule(task, period);
            }
        }
    }
}

/// Periodic callback driven by a [`Scheduler`].
///
/// Once [`stop_timer`](Timer::stop_timer) returns, no further period fires.
/// A callback already running on the consumer thread may still finish.
pub struct Timer<C: Clock + 'static = SystemClock> {
    task: Arc<TimerTask<C>>,
}

impl<C: Clock + 'static> Timer<C> {
    pub fn new<F>(scheduler: &Arc<Scheduler<C>>, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let scheduler = Arc::downgrade(scheduler);
        let task = Arc::new_cyclic(|this| TimerTask {
            scheduler,
            this: this.clone(),
            period: Mutex::new(Duration::ZERO),
            running: AtomicBool::new(false),
            callback: Box::new(callback),
        });
        Self { task }
    }

    /// Restart the timer with a new period. The first tick is one period away.
    pub fn start_timer(&self, period: Duration) {
        self.stop_timer();

        *lock(&self.task.period) = period;
        self.task.running.store(true, Ordering::Release);

        if let Some(scheduler) = self.task.scheduler.upgrade() {
            let task: TaskRef = self.task.clone();
            scheduler.schedule(task, period);
        }
    }

    pub fn stop_timer(&self) {
        self.task.running.store(false, Ordering::Release);
        if let Some(scheduler) = self.task.scheduler.upgrade() {
            let task: TaskRef = self.task.clone();
            scheduler.unschedule(&task);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.running.load(Ordering::Acquire)
    }

    pub fn period(&self) -> Duration {
        *lock(&self.task.period)
    }
}

impl<C: Clock + 'static> Drop for Timer<C> {
    fn drop(&mut self) {
        self.stop_timer();
    }
}
