use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::atom::Atom;
use crate::runtime::{Emitter, EngineContext, EngineObject};
use crate::scheduler::{Clock, Timer};

/// `metro`: outputs a bang every period while started.
///
/// Left inlet starts on a non-zero number or `start`, stops on zero or `stop`.
/// Right inlet sets the period in milliseconds.
pub struct Metro<C: Clock + 'static> {
    timer: Timer<C>,
    period_ms: AtomicU64,
}

impl<C: Clock + 'static> Metro<C> {
    pub fn new(context: &EngineContext<C>, args: &[Atom], emitter: Emitter) -> Self {
        let timer = Timer::new(context.main_scheduler(), move || {
            emitter(0, &[Atom::bang()]);
        });
        let period = args.first().filter(|a| a.is_number()).map_or(0.0, Atom::as_float);
        let metro = Self {
            timer,
            period_ms: AtomicU64::new(0),
        };
        metro.set_period(period);
        metro
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(f64::from_bits(self.period_ms.load(Ordering::Relaxed)) / 1000.0)
    }

    /// Periods under one millisecond are raised to one.
    fn set_period(&self, ms: f64) {
        let ms = if ms.is_finite() { ms.max(1.0) } else { 1.0 };
        self.period_ms.store(ms.to_bits(), Ordering::Relaxed);
        if self.timer.is_running() {
            self.timer.start_timer(self.period());
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }
}

impl<C: Clock + 'static> EngineObject for Metro<C> {
    fn receive(&self, inlet: usize, args: &[Atom]) {
        match (inlet, args.first()) {
            (0, Some(Atom::String(word))) if word == "start" => self.timer.start_timer(self.period()),
            (0, Some(Atom::String(word))) if word == "stop" => self.timer.stop_timer(),
            (0, Some(value)) if value.is_number() => {
                if value.as_float() != 0.0 {
                    self.timer.start_timer(self.period());
                } else {
                    self.timer.stop_timer();
                }
            }
            (1, Some(value)) if value.is_number() => self.set_period(value.as_float()),
            _ => log::warn!("metro: unexpected message on inlet {}", inlet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::ManualClock;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_bangs_every_period_until_stopped() {
        let scheduler = Arc::new(Scheduler::with_clock(ManualClock::default()));
        let context = EngineContext::new(Arc::clone(&scheduler));
        let bangs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&bangs);
        let emitter: Emitter = Arc::new(move |outlet: usize, args: &[Atom]| {
            assert_eq!(outlet, 0);
            assert!(args[0].is_bang());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let metro = Metro::new(&context, &[Atom::Int(10)], emitter);
        metro.receive(0, &[Atom::Int(1)]);
        assert!(metro.is_running());

        for _ in 0..3 {
            scheduler.clock().advance(10);
            scheduler.process();
        }
        assert_eq!(bangs.load(Ordering::SeqCst), 3);

        metro.receive(0, &[Atom::string("stop")]);
        scheduler.clock().advance(50);
        scheduler.process();
        assert_eq!(bangs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_period_change_restarts() {
        let scheduler = Arc::new(Scheduler::with_clock(ManualClock::default()));
        let context = EngineContext::new(Arc::clone(&scheduler));
        let metro = Metro::new(&context, &[], Arc::new(|_: usize, _: &[Atom]| {}));
        assert_eq!(metro.period(), Duration::from_millis(1));

        metro.receive(0, &[Atom::string("start")]);
        metro.receive(1, &[Atom::Int(250)]);
        assert!(metro.is_running());
        assert_eq!(metro.period(), Duration::from_millis(250));
    }
}
