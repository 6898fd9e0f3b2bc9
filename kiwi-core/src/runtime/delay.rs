use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::atom::Atom;
use crate::runtime::{EngineContext, EngineObject, PrepareInfo, ReleasePool, SwapCell};
use crate::scheduler::{Clock, Timer};

/// Longest delay, in seconds.
const MAX_DELAY: f64 = 5.0;

/// How often replaced buffers are checked for release.
pub(crate) const RELEASE_PERIOD: Duration = Duration::from_secs(1);

/// Circular buffer. Its lock is only ever taken by the audio thread.
struct DelayLine {
    state: Mutex<LineState>,
    sample_rate: f64,
}

struct LineState {
    samples: Vec<f32>,
    head: usize,
}

impl DelayLine {
    fn new(sample_rate: f64) -> Self {
        let len = (sample_rate * MAX_DELAY).ceil().max(1.0) as usize + 1;
        Self {
            state: Mutex::new(LineState {
                samples: vec![0.0; len],
                head: 0,
            }),
            sample_rate,
        }
    }
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

/// `delaysimple~`: signal delay with feedback.
///
/// Inlets: signal input (or `clear`), delay time in ms, feedback in `[0, 1)`.
pub struct DelaySimple<C: Clock + 'static> {
    line: SwapCell<DelayLine>,
    delay_ms: AtomicU64,
    feedback: AtomicU64,
    release_timer: Timer<C>,
}

impl<C: Clock + 'static> DelaySimple<C> {
    pub fn new(context: &EngineContext<C>, args: &[Atom]) -> Self {
        let pool: Arc<ReleasePool<DelayLine>> = Arc::new(ReleasePool::new());
        let drained = Arc::clone(&pool);
        let release_timer = Timer::new(context.main_scheduler(), move || {
            let freed = drained.clear();
            if freed > 0 {
                log::trace!("delaysimple~ released {} buffers", freed);
            }
        });
        release_timer.start_timer(RELEASE_PERIOD);

        let delay = Self {
            line: SwapCell::new(DelayLine::new(PrepareInfo::default().sample_rate), pool),
            delay_ms: AtomicU64::new(0),
            feedback: AtomicU64::new(0),
            release_timer,
        };
        if let Some(ms) = args.first().filter(|a| a.is_number()) {
            delay.set_delay(ms.as_float());
        }
        if let Some(feedback) = args.get(1).filter(|a| a.is_number()) {
            delay.set_feedback(feedback.as_float());
        }
        delay
    }

    pub fn delay(&self) -> f64 {
        load_f64(&self.delay_ms)
    }

    pub fn feedback(&self) -> f64 {
        load_f64(&self.feedback)
    }

    fn set_delay(&self, ms: f64) {
        store_f64(&self.delay_ms, ms.clamp(0.0, MAX_DELAY * 1000.0));
    }

    fn set_feedback(&self, feedback: f64) {
        store_f64(&self.feedback, feedback.clamp(0.0, 0.99));
    }

    /// Swap in a fresh zeroed buffer; the old one goes to the release pool.
    pub fn clear(&self) {
        let sample_rate = self.line.load().sample_rate;
        self.line.store(DelayLine::new(sample_rate));
    }

    pub fn pending_releases(&self) -> usize {
        self.line.pool().len()
    }

    pub fn is_releasing(&self) -> bool {
        self.release_timer.is_running()
    }
}

impl<C: Clock + 'static> EngineObject for DelaySimple<C> {
    fn receive(&self, inlet: usize, args: &[Atom]) {
        match (inlet, args.first()) {
            (0, Some(Atom::String(word))) if word == "clear" => self.clear(),
            (1, Some(value)) if value.is_number() => self.set_delay(value.as_float()),
            (2, Some(value)) if value.is_number() => self.set_feedback(value.as_float()),
            _ => log::warn!("delaysimple~: unexpected message on inlet {}", inlet),
        }
    }

    fn prepare(&self, info: &PrepareInfo) {
        self.line.store(DelayLine::new(info.sample_rate));
    }

    fn perform(&self, input: &[&[f32]], output: &mut [Vec<f32>]) {
        let (Some(signal), Some(out)) = (input.first(), output.first_mut()) else {
            return;
        };

        let line = self.line.load();
        let mut state = match line.state.try_lock() {
            Ok(state) => state,
            Err(_) => {
                out.iter_mut().for_each(|s| *s = 0.0);
                return;
            }
        };

        let len = state.samples.len();
        let feedback = self.feedback() as f32;
        let fixed = ((self.delay() / 1000.0) * line.sample_rate).round() as usize;
        let modulation = input.get(1);

        for (i, (sample, result)) in signal.iter().zip(out.iter_mut()).enumerate() {
            let offset = match modulation.and_then(|m| m.get(i)) {
                Some(ms) => ((*ms as f64 / 1000.0) * line.sample_rate).round() as usize,
                None => fixed,
            }
            .clamp(0, len - 1);

            let read = (state.head + len - offset) % len;
            let delayed = if offset == 0 { *sample } else { state.samples[read] };
            *result = delayed;

            let head = state.head;
            state.samples[head] = *sample + delayed * feedback;
            state.head = (head + 1) % len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::ManualClock;
    use crate::scheduler::Scheduler;

    fn context() -> (Arc<Scheduler<ManualClock>>, EngineContext<ManualClock>) {
        let scheduler = Arc::new(Scheduler::with_clock(ManualClock::default()));
        let context = EngineContext::new(Arc::clone(&scheduler));
        (scheduler, context)
    }

    #[test]
    fn test_delays_impulse() {
        let (_scheduler, context) = context();
        let delay = DelaySimple::new(&context, &[Atom::Int(1)]);
        delay.prepare(&PrepareInfo {
            sample_rate: 4000.0,
            block_size: 8,
        });

        // 1 ms at 4 kHz is four samples
        let input = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut output = vec![vec![0.0; 8]];
        delay.perform(&[&input], &mut output);
        assert_eq!(output[0], vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_messages_update_parameters() {
        let (_scheduler, context) = context();
        let delay = DelaySimple::new(&context, &[]);
        delay.receive(1, &[Atom::Float(250.0)]);
        delay.receive(2, &[Atom::Float(4.0)]);
        assert_eq!(delay.delay(), 250.0);
        assert_eq!(delay.feedback(), 0.99);
    }

    #[test]
    fn test_replaced_buffers_released_by_timer() {
        let (scheduler, context) = context();
        let delay = DelaySimple::new(&context, &[]);
        assert!(delay.is_releasing());

        delay.receive(0, &[Atom::string("clear")]);
        delay.prepare(&PrepareInfo::default());
        assert_eq!(delay.pending_releases(), 2);

        scheduler.clock().advance(RELEASE_PERIOD.as_millis() as u64);
        scheduler.process();
        assert_eq!(delay.pending_releases(), 0);
    }
}
