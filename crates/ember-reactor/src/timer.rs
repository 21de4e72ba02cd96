use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use crate::reactor::Reactor;

/// Returned by a timer task to keep or cancel the schedule.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerOutcome {
    Continue,
    Stop,
}

pub(crate) type TimerTask = Box<dyn FnMut(&mut Reactor) -> TimerOutcome + Send>;
pub(crate) type TimerFinish = Box<dyn FnOnce(&mut Reactor) + Send>;

pub(crate) struct TimerEntry {
    pub(crate) interval: Duration,
    /// Remaining repetitions; `None` means forever.
    pub(crate) reps_left: Option<u32>,
    pub(crate) task: TimerTask,
    pub(crate) on_finish: Option<TimerFinish>,
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    entry: TimerEntry,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap through Reverse at the call sites is noisier than just
        // flipping here. Earliest deadline (then lowest seq) is "greatest".
        Reverse((self.deadline, self.seq)).cmp(&Reverse((other.deadline, other.seq)))
    }
}

/// Monotonic min-heap of timers. Expired timers fire in scheduled order.
/// Timers are process-local and do not survive fork; the worker builds a
/// fresh reactor (and with it a fresh heap) after forking.
#[derive(Default)]
pub(crate) struct Timers {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
}

impl Timers {
    pub(crate) fn schedule(&mut self, after: Duration, entry: TimerEntry) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Scheduled { deadline: Instant::now() + after, seq, entry });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.deadline)
    }

    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry> {
        if self.heap.peek().is_some_and(|s| s.deadline <= now) {
            return self.heap.pop().map(|s| s.entry);
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Interval gate for code already running on a loop: `fired` answers whether
/// the interval elapsed since it last answered yes.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        let due = self.last_acted.is_none_or(|at| at.elapsed() >= self.interval);
        if due {
            self.last_acted = Some(Instant::now());
        }
        due
    }

    #[inline]
    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }

    #[inline]
    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_in_scheduled_order() {
        let mut timers = Timers::default();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in 0..3u8 {
            let order = order.clone();
            timers.schedule(Duration::ZERO, TimerEntry {
                interval: Duration::from_secs(1),
                reps_left: Some(1),
                task: Box::new(move |_| {
                    order.lock().unwrap().push(tag);
                    TimerOutcome::Stop
                }),
                on_finish: None,
            });
        }
        let now = Instant::now() + Duration::from_millis(1);
        let mut reactor = Reactor::new().unwrap();
        while let Some(mut e) = timers.pop_expired(now) {
            (e.task)(&mut reactor);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn repeater_gates_by_interval() {
        let mut r = Repeater::every(Duration::from_secs(60));
        assert!(r.fired());
        assert!(!r.fired());
        r.force_fire();
        assert!(r.fired());
    }
}
