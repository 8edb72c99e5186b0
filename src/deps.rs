//! Injection seams for everything the engine does not own: the monotonic
//! clock and the outbound multicast socket. Tests swap in a manual clock and
//! a recording sender; production wires the real ones in the binary.
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

/// Monotonic milliseconds. All TTL arithmetic in the engine runs on this
/// clock, never on wall time.
pub trait Clock {
    fn elapsed_ms(&self) -> u64;
}

/// Production clock, anchored at construction.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// A clock that only moves when told to. Used by the tests to drive TTL
/// expiry and throttling windows deterministically.
///
/// ```
/// use mdnslib::deps::{Clock, ManualClock};
///
/// let clock = ManualClock::new(0);
/// clock.advance(1500);
/// assert_eq!(clock.elapsed_ms(), 1500);
/// ```
pub struct ManualClock {
    now_ms: Cell<u64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Cell::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.set(self.now_ms.get() + delta_ms);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.set(now_ms);
    }
}

impl Clock for ManualClock {
    fn elapsed_ms(&self) -> u64 {
        self.now_ms.get()
    }
}

/// Narrow outbound seam. The engine hands fully serialized packets and a
/// destination to this trait; sends are best-effort and failures are logged
/// and swallowed by callers.
pub trait Multicaster {
    fn send(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()>;
}
