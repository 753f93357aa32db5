//! Slot arithmetic.
//!
//! Time is measured in milliseconds since the chain epoch ("epoch time").
//! Slot `n` covers epoch times `[n * slot_duration, (n + 1) * slot_duration)`.
//! Timestamps before the epoch clamp to slot 0.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Slot numbers count from the chain epoch.
pub type Slot = u64;

/// Source of wall-clock time in Unix milliseconds.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Reads the system clock through chrono.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Hand-driven clock for tests and deterministic simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Maps wall-clock timestamps onto forging slots.
#[derive(Clone)]
pub struct SlotClock {
    epoch_ms: u64,
    slot_duration_ms: u64,
    source: Arc<dyn TimeSource>,
}

impl std::fmt::Debug for SlotClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotClock")
            .field("epoch_ms", &self.epoch_ms)
            .field("slot_duration_ms", &self.slot_duration_ms)
            .finish_non_exhaustive()
    }
}

impl SlotClock {
    /// Clock backed by the system time.
    pub fn system(epoch_ms: u64, slot_duration_ms: u64) -> Self {
        Self::with_source(epoch_ms, slot_duration_ms, Arc::new(SystemTimeSource))
    }

    /// # Panics
    ///
    /// Panics if `slot_duration_ms` is zero.
    pub fn with_source(epoch_ms: u64, slot_duration_ms: u64, source: Arc<dyn TimeSource>) -> Self {
        assert!(slot_duration_ms > 0, "slot duration must be non-zero");
        Self {
            epoch_ms,
            slot_duration_ms,
            source,
        }
    }

    pub fn epoch_ms(&self) -> u64 {
        self.epoch_ms
    }

    pub fn slot_duration_ms(&self) -> u64 {
        self.slot_duration_ms
    }

    /// Current Unix time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.source.now_ms()
    }

    /// Converts a Unix timestamp into epoch time.
    pub fn epoch_time(&self, timestamp_ms: u64) -> u64 {
        timestamp_ms.saturating_sub(self.epoch_ms)
    }

    /// Slot containing the given epoch time.
    pub fn slot_number(&self, epoch_time: u64) -> Slot {
        epoch_time / self.slot_duration_ms
    }

    /// Slot a Unix timestamp falls into.
    pub fn slot_of(&self, timestamp_ms: u64) -> Slot {
        self.slot_number(self.epoch_time(timestamp_ms))
    }

    /// Slot the wall clock is in right now.
    pub fn current_slot(&self) -> Slot {
        self.slot_of(self.now_ms())
    }

    /// Unix timestamp at which `slot` starts.
    pub fn slot_start_ms(&self, slot: Slot) -> u64 {
        self.epoch_ms + slot * self.slot_duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_clock(now_ms: u64) -> (SlotClock, Arc<ManualTimeSource>) {
        let source = Arc::new(ManualTimeSource::new(now_ms));
        (SlotClock::with_source(1_000, 100, source.clone()), source)
    }

    #[test]
    fn slot_boundaries() {
        let (clock, _) = manual_clock(0);
        assert_eq!(clock.slot_of(1_000), 0);
        assert_eq!(clock.slot_of(1_099), 0);
        assert_eq!(clock.slot_of(1_100), 1);
        assert_eq!(clock.slot_start_ms(42), 5_200);
        assert_eq!(clock.slot_of(clock.slot_start_ms(42)), 42);
    }

    #[test]
    fn pre_epoch_timestamps_clamp_to_slot_zero() {
        let (clock, _) = manual_clock(0);
        assert_eq!(clock.epoch_time(500), 0);
        assert_eq!(clock.slot_of(500), 0);
    }

    #[test]
    fn current_slot_follows_the_source() {
        let (clock, source) = manual_clock(1_250);
        assert_eq!(clock.current_slot(), 2);
        source.advance(100);
        assert_eq!(clock.current_slot(), 3);
        source.set(clock.slot_start_ms(9));
        assert_eq!(clock.current_slot(), 9);
    }

    #[test]
    fn system_clock_is_past_epoch() {
        let clock = SlotClock::system(crate::config::EPOCH_MS, crate::config::SLOT_DURATION_MS);
        assert!(clock.current_slot() > 0);
    }
}
