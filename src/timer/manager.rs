//! Millisecond-driven timer scheduling.
//!
//! [`TimerManager`] wraps the [`TimerWheel`] with a monotonic
//! "current time" concept: each `run` converts wall-clock milliseconds
//! into a whole number of wheel ticks at a fixed interval, carrying
//! the remainder forward so no fraction of a tick is ever lost.
//!
//! [`TimerSet`] builds application-level periodic and one-shot timers
//! on top of the manager. Each entry re-arms itself drift-free
//! (`slap += period`, not `now + period`) until its repeat count runs
//! out or it is stopped.

use super::wheel::{TimerId, TimerWheel};

/// Guard against a wall clock that jumps backwards: any apparent
/// elapsed time at or past this value is treated as zero.
const BACKWARD_JUMP: u32 = 0x7000_0000;

/// Converts wall-clock milliseconds into wheel ticks.
pub struct TimerManager<T> {
    wheel: TimerWheel<T>,
    /// Milliseconds per wheel tick, at least 1.
    interval: u32,
    /// Last observed wall-clock value.
    millisec: u32,
    /// Wall-clock value already consumed into whole ticks; the
    /// difference to `millisec` is the carried remainder.
    current: u32,
    /// Whole ticks elapsed since the epoch. The wheel has processed
    /// every tick up to and including this value, so a node filed at
    /// tick `n` fires once `n` intervals have completed.
    ticks_total: u32,
    initialized: bool,
}

impl<T> TimerManager<T> {
    /// Create a manager ticking every `interval_ms` milliseconds.
    pub fn new(interval_ms: u32) -> Self {
        TimerManager {
            wheel: TimerWheel::new(0),
            interval: interval_ms.max(1),
            millisec: 0,
            current: 0,
            ticks_total: 0,
            initialized: false,
        }
    }

    /// Milliseconds per tick.
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Last observed wall-clock value.
    pub fn now_ms(&self) -> u32 {
        self.millisec
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.wheel.len()
    }

    /// True when no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.wheel.is_empty()
    }

    /// Advance to wall-clock `now_ms`, appending expired payloads to
    /// `fired` in expiry order. The first call latches the epoch and
    /// fires nothing.
    pub fn run(&mut self, now_ms: u32, fired: &mut Vec<T>) {
        if !self.initialized {
            self.initialized = true;
            self.millisec = now_ms;
            self.current = now_ms;
            return;
        }
        let elapsed = now_ms.wrapping_sub(self.millisec);
        if elapsed >= BACKWARD_JUMP {
            // Clock went backwards; re-latch without advancing.
            self.millisec = now_ms;
            self.current = now_ms;
            return;
        }
        self.millisec = now_ms;
        let pending = now_ms.wrapping_sub(self.current);
        let ticks = pending / self.interval;
        if ticks > 0 {
            self.current = self.current.wrapping_add(ticks * self.interval);
            self.ticks_total = self.ticks_total.wrapping_add(ticks);
            self.wheel.advance(self.ticks_total, fired);
        }
    }

    /// Arm a timer `delay_ms` from now (rounded up to whole ticks).
    pub fn schedule(&mut self, delay_ms: u32, data: T) -> TimerId {
        let ticks = delay_ms.div_ceil(self.interval);
        self.wheel.insert(self.wheel.tick().wrapping_add(ticks), data)
    }

    /// Arm a timer at the absolute wall-clock value `when_ms`.
    ///
    /// A value at or before the current time files for the next run.
    pub fn schedule_at(&mut self, when_ms: u32, data: T) -> TimerId {
        let delta = when_ms.wrapping_sub(self.current);
        let ticks = if (delta as i32) <= 0 { 0 } else { delta.div_ceil(self.interval) };
        self.wheel.insert(self.wheel.tick().wrapping_add(ticks), data)
    }

    /// Disarm a timer before it fires.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.wheel.remove(id)
    }

    /// Move an armed timer to a new delay from now. Fails on stale ids.
    pub fn reschedule(&mut self, id: TimerId, delay_ms: u32) -> bool {
        let ticks = delay_ms.div_ceil(self.interval);
        self.wheel.modify(id, self.wheel.tick().wrapping_add(ticks))
    }

    /// Milliseconds until the next possible expiry, capped at
    /// `limit_ms`. `None` when nothing is armed.
    pub fn next_timeout_ms(&self, limit_ms: u32) -> Option<u32> {
        let limit_ticks = limit_ms.div_ceil(self.interval).max(1);
        let delta = self.wheel.next_expiry(limit_ticks)?;
        // A node `delta` slots ahead fires when the elapsed-tick count
        // reaches it; account for the tick currently in progress.
        let until = delta
            .wrapping_add(self.wheel.tick().wrapping_sub(self.ticks_total))
            .max(1);
        let carried = self.millisec.wrapping_sub(self.current);
        Some((until * self.interval).saturating_sub(carried).min(limit_ms))
    }
}

/// Opaque handle to one entry in a [`TimerSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    index: u32,
    generation: u32,
}

/// Callback invoked each time a timer entry fires.
pub type TimerCallback = Box<dyn FnMut(TimerToken)>;

struct Entry {
    generation: u32,
    period: u32,
    /// Next planned fire time in manager milliseconds.
    slap: u32,
    /// Remaining firings; `<= 0` means repeat forever.
    repeat: i32,
    running: bool,
    node: Option<TimerId>,
    callback: Option<TimerCallback>,
}

/// Host for application-level periodic/one-shot timer events.
pub struct TimerSet {
    mgr: TimerManager<u32>,
    entries: Vec<Entry>,
    free: Vec<u32>,
    scratch: Vec<u32>,
}

impl TimerSet {
    /// Create a timer set ticking every `interval_ms` milliseconds.
    pub fn new(interval_ms: u32) -> Self {
        TimerSet {
            mgr: TimerManager::new(interval_ms),
            entries: Vec::new(),
            free: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Arm a timer firing every `period` ms. `repeat <= 0` repeats
    /// forever, otherwise the entry stops after `repeat` firings.
    pub fn start(&mut self, period: u32, repeat: i32, callback: TimerCallback) -> TimerToken {
        let slap = self.mgr.now_ms().wrapping_add(period);
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    period: 0,
                    slap: 0,
                    repeat: 0,
                    running: false,
                    node: None,
                    callback: None,
                });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        entry.period = period.max(1);
        entry.slap = slap;
        entry.repeat = repeat;
        entry.running = true;
        entry.callback = Some(callback);
        let token = TimerToken { index, generation: entry.generation };
        entry.node = Some(self.mgr.schedule(entry.period, index));
        token
    }

    /// Stop a running timer; the entry stays allocated and reports
    /// stopped. Returns false for a stale token or one already stopped.
    pub fn stop(&mut self, token: TimerToken) -> bool {
        let Some(entry) = self.entry_mut(token) else { return false };
        if !entry.running {
            return false;
        }
        entry.running = false;
        if let Some(node) = entry.node.take() {
            self.mgr.cancel(node);
        }
        true
    }

    /// Release a timer entry entirely, stopping it first.
    pub fn remove(&mut self, token: TimerToken) -> bool {
        self.stop(token);
        match self.entry_mut(token) {
            Some(entry) => {
                entry.generation = entry.generation.wrapping_add(1);
                entry.callback = None;
                self.free.push(token.index);
                true
            }
            None => false,
        }
    }

    /// Running/stopped status, without side effects.
    pub fn is_running(&self, token: TimerToken) -> bool {
        match self.entries.get(token.index as usize) {
            Some(entry) => entry.generation == token.generation && entry.running,
            None => false,
        }
    }

    /// Drive the set to wall-clock `now_ms`, invoking due callbacks.
    pub fn run(&mut self, now_ms: u32) {
        let mut fired = std::mem::take(&mut self.scratch);
        self.mgr.run(now_ms, &mut fired);
        for index in fired.drain(..) {
            self.fire(index);
        }
        self.scratch = fired;
    }

    fn fire(&mut self, index: u32) {
        let token;
        let mut callback;
        {
            let entry = &mut self.entries[index as usize];
            if !entry.running {
                return;
            }
            entry.node = None;
            token = TimerToken { index, generation: entry.generation };
            entry.slap = entry.slap.wrapping_add(entry.period);
            if entry.repeat == 1 {
                entry.running = false;
            } else {
                if entry.repeat > 1 {
                    entry.repeat -= 1;
                }
                // If firing fell behind, skip ahead instead of
                // bursting to catch up.
                let now = self.mgr.now_ms();
                if (entry.slap.wrapping_sub(now) as i32) <= 0 {
                    entry.slap = now.wrapping_add(entry.period);
                }
            }
            callback = entry.callback.take();
        }
        let rearm = self.entries[index as usize].running;
        if rearm {
            let slap = self.entries[index as usize].slap;
            let node = self.mgr.schedule_at(slap, index);
            self.entries[index as usize].node = Some(node);
        }
        if let Some(cb) = callback.as_mut() {
            cb(token);
        }
        // The callback may have stopped or removed the entry.
        let entry = &mut self.entries[index as usize];
        if entry.generation == token.generation && entry.callback.is_none() {
            entry.callback = callback;
        }
    }

    fn entry_mut(&mut self, token: TimerToken) -> Option<&mut Entry> {
        let entry = self.entries.get_mut(token.index as usize)?;
        if entry.generation != token.generation {
            return None;
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn remainder_is_carried_forward() {
        let mut mgr: TimerManager<u8> = TimerManager::new(10);
        let mut fired = Vec::new();
        mgr.run(0, &mut fired);
        mgr.schedule(25, 1);
        mgr.run(24, &mut fired);
        assert!(fired.is_empty());
        // 24ms consumed only 2 ticks; the 4ms remainder plus 6 more
        // milliseconds completes the third tick.
        mgr.run(30, &mut fired);
        assert_eq!(fired, vec![1]);
    }

    #[test]
    fn periodic_fires_once_by_third_call() {
        let hits = Rc::new(Cell::new(0));
        let mut set = TimerSet::new(10);
        set.run(0);
        let h = hits.clone();
        set.start(100, -1, Box::new(move |_| h.set(h.get() + 1)));
        set.run(50);
        assert_eq!(hits.get(), 0);
        set.run(120);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn repeat_count_exhausts() {
        let hits = Rc::new(Cell::new(0));
        let mut set = TimerSet::new(1);
        set.run(0);
        let h = hits.clone();
        let token = set.start(5, 3, Box::new(move |_| h.set(h.get() + 1)));
        for t in 1..100 {
            set.run(t);
        }
        assert_eq!(hits.get(), 3);
        assert!(!set.is_running(token));
    }

    #[test]
    fn stop_prevents_firing() {
        let hits = Rc::new(Cell::new(0));
        let mut set = TimerSet::new(1);
        set.run(0);
        let h = hits.clone();
        let token = set.start(5, -1, Box::new(move |_| h.set(h.get() + 1)));
        assert!(set.is_running(token));
        assert!(set.stop(token));
        assert!(!set.is_running(token));
        for t in 1..50 {
            set.run(t);
        }
        assert_eq!(hits.get(), 0);
        assert!(!set.stop(token));
    }
}
