//! Environment abstraction: the clock and the socket factory.
//!
//! The state machines take every side effect through this trait so the same
//! logic runs against the real network ([`crate::sys::SystemEnv`]) and the
//! deterministic in-memory fabric the harness crate provides. The design is
//! single-threaded cooperative, so implementations need `Clone` (client and
//! server share one environment) but no `Send`/`Sync`.

use std::time::Instant;

use crate::socket::{AddrFamily, DatagramSocket, SockError, StreamSocket};

/// Provider of time and freshly created non-blocking sockets.
///
/// # Invariants
///
/// - `now()` never goes backwards within one environment.
/// - Sockets come back non-blocking; no session-layer call may ever block
///   on I/O.
pub trait Environment: Clone + 'static {
    /// Connection-oriented socket type.
    type Stream: StreamSocket;
    /// Datagram socket type.
    type Datagram: DatagramSocket;

    /// Current time. Virtual in simulation, the system clock in production.
    fn now(&self) -> Instant;

    /// Create a non-blocking connection-oriented socket.
    ///
    /// # Errors
    ///
    /// Platform socket creation failures, classified.
    fn stream_socket(&self, family: AddrFamily) -> Result<Self::Stream, SockError>;

    /// Create a non-blocking datagram socket.
    ///
    /// # Errors
    ///
    /// Platform socket creation failures, classified.
    fn datagram_socket(&self, family: AddrFamily) -> Result<Self::Datagram, SockError>;
}

/// Milliseconds from `earlier` to `later`, saturating at zero.
///
/// Timeout budgets travel the wire as float milliseconds, so elapsed time
/// is compared in the same unit.
#[must_use]
pub fn ms_between(earlier: Instant, later: Instant) -> f64 {
    later.saturating_duration_since(earlier).as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ms_between_saturates() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(250);
        assert!((ms_between(t0, t1) - 250.0).abs() < 1.0);
        assert_eq!(ms_between(t1, t0), 0.0);
    }
}
