//! Timer service (C6): a monotonic `time_since_boot_ns` clock plus a
//! min-heap of one-shot timed events ordered by deadline.
//!
//! Grounded on `original_source/kernel/devices/timer.c`: [`report_clock_pulse`]
//! advances the clock and pops every event whose deadline has passed,
//! invoking each with `(now, deadline)`; [`register_timed_event`] inserts
//! into a binary min-heap backed by a flat array that grows by doubling,
//! returning `false` instead of aborting if growth fails.
//!
//! The heap only guarantees a callback does not run *before* its deadline —
//! `report_clock_pulse` is only ever called with whatever period the clock
//! driver's bottom half measured, so a callback can run arbitrarily late.

use crate::boot_config::TIMER_QUEUE_INITIAL_CAPACITY;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// A timed-event callback: `(time_since_boot_ns, deadline_ns)`.
pub type TimerCallback = fn(u64, u64);

struct TimedEvent {
    deadline_ns: u64,
    callback: TimerCallback,
}

static TIME_SINCE_BOOT_NS: AtomicU64 = AtomicU64::new(0);

struct EventHeap(Vec<TimedEvent>);

impl EventHeap {
    const fn new() -> Self {
        EventHeap(Vec::new())
    }

    const fn parent(i: usize) -> usize {
        (i - 1) / 2
    }

    const fn left(i: usize) -> usize {
        2 * i + 1
    }

    const fn right(i: usize) -> usize {
        2 * i + 2
    }

    /// Inserts `event`, growing the backing array by doubling (starting at
    /// [`TIMER_QUEUE_INITIAL_CAPACITY`]) if it is full. Returns `false`
    /// without modifying the heap if growth fails.
    fn push(&mut self, event: TimedEvent) -> bool {
        if self.0.len() == self.0.capacity() {
            let additional = self.0.capacity().max(TIMER_QUEUE_INITIAL_CAPACITY);
            if self.0.try_reserve(additional).is_err() {
                return false;
            }
        }

        self.0.push(event);
        let mut i = self.0.len() - 1;
        while i > 0 {
            let p = Self::parent(i);
            if self.0[p].deadline_ns <= self.0[i].deadline_ns {
                break;
            }
            self.0.swap(p, i);
            i = p;
        }
        true
    }

    fn peek_deadline(&self) -> Option<u64> {
        self.0.first().map(|e| e.deadline_ns)
    }

    fn pop(&mut self) -> Option<TimedEvent> {
        if self.0.is_empty() {
            return None;
        }

        let last = self.0.len() - 1;
        self.0.swap(0, last);
        let event = self.0.pop();
        self.sift_down(0);
        event
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.0.len();
        loop {
            let l = Self::left(i);
            let r = Self::right(i);
            let mut smallest = i;
            if l < len && self.0[l].deadline_ns < self.0[smallest].deadline_ns {
                smallest = l;
            }
            if r < len && self.0[r].deadline_ns < self.0[smallest].deadline_ns {
                smallest = r;
            }
            if smallest == i {
                break;
            }
            self.0.swap(i, smallest);
            i = smallest;
        }
    }

    #[cfg(test)]
    fn is_min_heap(&self) -> bool {
        (1..self.0.len()).all(|i| self.0[Self::parent(i)].deadline_ns <= self.0[i].deadline_ns)
    }
}

static HEAP: Mutex<EventHeap> = Mutex::new(EventHeap::new());

/// Nanoseconds elapsed since boot, as measured by accumulated clock pulses.
pub fn time_since_boot() -> u64 {
    TIME_SINCE_BOOT_NS.load(Ordering::SeqCst)
}

/// Registers `callback` to run no earlier than `deadline_ns`. A deadline at
/// or before [`time_since_boot`] fires on the very next pulse. Returns
/// `false` if the heap's backing storage could not be grown.
pub fn register_timed_event(deadline_ns: u64, callback: TimerCallback) -> bool {
    HEAP.lock().push(TimedEvent { deadline_ns, callback })
}

/// Called by the clock driver's bottom half with the number of nanoseconds
/// elapsed since the previous pulse. Advances the clock, then drains every
/// event whose deadline is now at or before the new time, invoking each
/// with `(time_since_boot_ns, deadline_ns)`. Never invokes a callback whose
/// deadline exceeds the new clock value.
pub fn report_clock_pulse(period_ns: u64) {
    let now = TIME_SINCE_BOOT_NS.fetch_add(period_ns, Ordering::SeqCst) + period_ns;

    loop {
        let event = {
            let mut heap = HEAP.lock();
            match heap.peek_deadline() {
                Some(deadline) if deadline <= now => heap.pop(),
                _ => None,
            }
        };

        match event {
            Some(event) => (event.callback)(now, event.deadline_ns),
            None => break,
        }
    }
}

#[cfg(test)]
pub fn reset_for_test() {
    HEAP.lock().0.clear();
    TIME_SINCE_BOOT_NS.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use spin::Mutex as StdMutex;

    static TRACE: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

    fn record(label: &'static str) {
        TRACE.lock().push(label);
    }

    fn reset() {
        reset_for_test();
        TRACE.lock().clear();
    }

    #[test]
    fn fresh_clock_starts_at_zero() {
        reset();
        assert_eq!(time_since_boot(), 0);
    }

    #[test]
    fn pulses_accumulate_time() {
        reset();
        report_clock_pulse(10);
        report_clock_pulse(5);
        assert_eq!(time_since_boot(), 15);
    }

    #[test]
    fn past_deadline_fires_on_next_pulse() {
        reset();
        fn cb(_now: u64, _deadline: u64) {
            record("fired");
        }
        assert!(register_timed_event(0, cb));
        report_clock_pulse(1);
        assert_eq!(*TRACE.lock(), alloc::vec!["fired"]);
    }

    #[test]
    fn scenario_c_timed_event_ordering() {
        // cb1@30ms, cb2@10ms, cb3@20ms registered, five 10ms pulses
        // reported. Expected fire order: cb2, cb3, cb1.
        reset();
        fn cb1(_now: u64, _deadline: u64) {
            record("cb1");
        }
        fn cb2(_now: u64, _deadline: u64) {
            record("cb2");
        }
        fn cb3(_now: u64, _deadline: u64) {
            record("cb3");
        }

        const MS: u64 = 1_000_000;
        assert!(register_timed_event(30 * MS, cb1));
        assert!(register_timed_event(10 * MS, cb2));
        assert!(register_timed_event(20 * MS, cb3));

        for _ in 0..5 {
            report_clock_pulse(10 * MS);
        }

        assert_eq!(*TRACE.lock(), alloc::vec!["cb2", "cb3", "cb1"]);
    }

    #[test]
    fn never_fires_a_callback_past_its_deadline_early() {
        reset();
        fn cb(_now: u64, _deadline: u64) {
            record("fired");
        }
        assert!(register_timed_event(100, cb));
        report_clock_pulse(50);
        assert!(TRACE.lock().is_empty());
        report_clock_pulse(50);
        assert_eq!(*TRACE.lock(), alloc::vec!["fired"]);
    }

    #[test]
    fn heap_invariant_holds_after_many_inserts() {
        reset();
        fn noop(_now: u64, _deadline: u64) {}
        let deadlines = [50u64, 10, 90, 30, 70, 20, 60, 5, 100, 40];
        for &d in &deadlines {
            assert!(register_timed_event(d, noop));
        }
        assert!(HEAP.lock().is_min_heap());
    }
}
