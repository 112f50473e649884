//! Free-running millisecond tick and wrap-safe elapsed-time checks.

use portable_atomic::{AtomicU32, Ordering};

/// Source of a free-running millisecond counter.
///
/// On target this is [`SystemTick`], bumped from the 1 ms system
/// interrupt; the test harness substitutes a scripted clock.
pub trait TickSource {
    fn now(&self) -> u32;
}

/// Shared millisecond counter. Wraps after ~49.7 days; all consumers go
/// through [`is_time_up`], which handles the wrap.
pub struct SystemTick(AtomicU32);

impl SystemTick {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Advance one millisecond. Call from the system tick interrupt.
    pub fn tick(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn now(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for SystemTick {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemTick {
    fn now(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Milliseconds elapsed since `saved`, assuming at most one counter wrap.
pub fn elapsed_ms(now: u32, saved: u32) -> u32 {
    if now >= saved {
        now - saved
    } else {
        (u32::MAX - saved) + now
    }
}

/// True once at least `period` milliseconds have passed since the tick
/// value captured in `saved`.
pub fn is_time_up<C: TickSource + ?Sized>(clock: &C, saved: u32, period: u32) -> bool {
    elapsed_ms(clock.now(), saved) >= period
}
