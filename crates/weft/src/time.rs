use once_cell::sync::Lazy;
use quanta::{Clock, Instant};

static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);
static ANCHOR: Lazy<Instant> = Lazy::new(|| CLOCK.now());

/// Monotonic milliseconds since the first call in this process.
///
/// All timer deadlines are expressed on this clock.
pub fn now_ms() -> u64 {
    let anchor = *ANCHOR;
    CLOCK.now().duration_since(anchor).as_millis() as u64
}
