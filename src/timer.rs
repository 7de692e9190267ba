//! Per-channel repeating timers
//!
//! The clock is an ordered map from absolute fire time (microseconds on a
//! monotonic clock) to the owning channel, plus a side table from channel to
//! its entry so a timer can be updated or removed without scanning.
//!
//! Each poll cycle calls [`TimerClock::schedule`] once, which freezes a
//! horizon when the earliest entry is already due. [`TimerClock::next`] then
//! pops due entries in fire-time order, rescheduling each at
//! `now + interval`. A rescheduled entry always lands past the horizon, so
//! one cycle fires every timer at most once.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock time in microseconds since the Unix epoch
pub fn current_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    interval: i64,
    fire: i64,
    seq: u64,
}

/// Ordered set of channel timers
#[derive(Debug)]
pub struct TimerClock {
    queue: BTreeMap<(i64, u64), usize>,
    entries: HashMap<usize, TimerEntry>,
    seq: u64,
    origin: Instant,
    horizon: Option<i64>,
}

impl Default for TimerClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerClock {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            entries: HashMap::new(),
            seq: 0,
            origin: Instant::now(),
            horizon: None,
        }
    }

    /// Monotonic microseconds since the clock was created
    pub fn now(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    /// Arms or re-arms the timer of `owner`; returns `true` when it was created
    pub fn activate(&mut self, owner: usize, interval: Duration) -> bool {
        let interval = (interval.as_micros() as i64).max(1);
        let created = self.remove(owner).is_none();
        self.insert(owner, interval);
        log::trace!(
            "timer {} for chann {}: {} us ({} armed)",
            if created { "created" } else { "updated" },
            owner,
            interval,
            self.entries.len()
        );
        created
    }

    /// Disarms the timer of `owner`; returns `true` when one existed
    pub fn deactivate(&mut self, owner: usize) -> bool {
        let existed = self.remove(owner).is_some();
        if existed {
            log::trace!("timer killed for chann {} ({} armed)", owner, self.entries.len());
        }
        existed
    }

    pub fn is_active(&self, owner: usize) -> bool {
        self.entries.contains_key(&owner)
    }

    /// Repeat period of the timer of `owner`
    pub fn interval(&self, owner: usize) -> Option<Duration> {
        self.entries
            .get(&owner)
            .map(|e| Duration::from_micros(e.interval as u64))
    }

    /// Armed timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time left until the earliest timer fires
    pub fn next_deadline(&self) -> Option<Duration> {
        let (&(fire, _), _) = self.queue.iter().next()?;
        let left = (fire - self.now()).max(0);
        Some(Duration::from_micros(left as u64))
    }

    /// Freezes the expiry horizon for this poll cycle
    pub fn schedule(&mut self) {
        let now = self.now();
        self.horizon = match self.queue.keys().next() {
            Some(&(fire, _)) if fire <= now => Some(now),
            _ => None,
        };
    }

    /// Pops the next due timer, rescheduling it one interval from now
    pub fn next(&mut self) -> Option<usize> {
        let horizon = self.horizon?;
        let (&(fire, seq), &owner) = match self.queue.iter().next() {
            Some(first) if first.0 .0 <= horizon => first,
            _ => {
                self.horizon = None;
                return None;
            }
        };
        self.queue.remove(&(fire, seq));
        if let Some(entry) = self.entries.remove(&owner) {
            self.insert(owner, entry.interval);
            log::trace!("timer hit for chann {}: {} us", owner, entry.interval);
        }
        Some(owner)
    }

    fn insert(&mut self, owner: usize, interval: i64) {
        self.seq = self.seq.wrapping_add(1);
        let entry = TimerEntry {
            interval,
            fire: self.now() + interval,
            seq: self.seq,
        };
        self.queue.insert((entry.fire, entry.seq), owner);
        self.entries.insert(owner, entry);
    }

    fn remove(&mut self, owner: usize) -> Option<TimerEntry> {
        let entry = self.entries.remove(&owner)?;
        self.queue.remove(&(entry.fire, entry.seq));
        Some(entry)
    }
}
