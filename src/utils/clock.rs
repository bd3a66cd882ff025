use once_cell::sync::Lazy;
use quanta::Clock;

/// Global high-performance clock for hot-path timing.
pub static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Get current instant (precise, ~10ns overhead).
#[inline]
pub fn now() -> quanta::Instant {
    CLOCK.now()
}

/// Get recent instant (cached, ~1-2ns overhead). Use where speed beats
/// precision.
#[inline]
pub fn recent() -> quanta::Instant {
    CLOCK.recent()
}
