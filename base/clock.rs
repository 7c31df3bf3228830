// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations, so worker loops can be tested
//! without actually sleeping or depending on wall-clock time.

use crate::error::Error;
use crate::shutdown;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration as StdDuration;
use tracing::warn;

/// Abstract interface to the system clocks.
pub trait Clocks: Send + Sync + 'static {
    /// Microseconds since the Unix epoch, per `CLOCK_REALTIME`.
    fn realtime_micros(&self) -> i64;

    /// Microseconds of monotonic time, unspecified epoch.
    fn monotonic_micros(&self) -> i64;

    /// Sleeps the current thread for the given duration (or fast-forwards,
    /// for a simulated clock).
    fn sleep(&self, how_long: StdDuration);

    /// `rcv.recv_timeout`, or a simulated equivalent.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

/// Retries `f` until it succeeds or shutdown is requested, sleeping one
/// second between attempts and logging the failure.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, shutdown::ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(err = %e.chain(), "sleeping for 1s after error");
        clocks.sleep(StdDuration::from_secs(1));
    }
}

#[derive(Copy, Clone, Default)]
pub struct SystemClocks;

impl SystemClocks {
    fn get(&self, clock: libc::clockid_t) -> i64 {
        unsafe {
            let mut ts = std::mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            let ts = ts.assume_init();
            i64::from(ts.tv_sec) * 1_000_000 + i64::from(ts.tv_nsec) / 1_000
        }
    }
}

impl Clocks for SystemClocks {
    fn realtime_micros(&self) -> i64 {
        self.get(libc::CLOCK_REALTIME)
    }

    #[cfg(target_os = "linux")]
    fn monotonic_micros(&self) -> i64 {
        self.get(libc::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic_micros(&self) -> i64 {
        self.get(libc::CLOCK_MONOTONIC)
    }

    fn sleep(&self, how_long: StdDuration) {
        std::thread::sleep(how_long);
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if dropped after holding for "too long" (>= 1s), using a
/// label computed lazily so the common case costs nothing but a clock read.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start_micros: i64,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard { clocks, label_f: Some(label_f), start_micros: clocks.monotonic_micros() }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed_micros = self.clocks.monotonic_micros() - self.start_micros;
        if elapsed_micros >= 1_000_000 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:.3}s!", label_f().as_ref(), elapsed_micros as f64 / 1e6);
        }
    }
}

/// Simulated clock for deterministic unit tests.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot_micros: i64,
    uptime_micros: AtomicI64,
}

impl SimulatedClocks {
    pub fn new(boot_micros: i64) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot_micros,
            uptime_micros: AtomicI64::new(0),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime_micros(&self) -> i64 {
        self.0.boot_micros + self.0.uptime_micros.load(Ordering::SeqCst)
    }

    fn monotonic_micros(&self) -> i64 {
        self.0.uptime_micros.load(Ordering::SeqCst)
    }

    /// Advances the clock by the given amount without actually sleeping.
    fn sleep(&self, how_long: StdDuration) {
        self.0.uptime_micros.fetch_add(how_long.as_micros() as i64, Ordering::SeqCst);
    }

    /// Advances the clock by `timeout` if no item is immediately available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(StdDuration::from_millis(0));
        if r.is_err() {
            self.sleep(timeout);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_sleep_advances_monotonic() {
        let c = SimulatedClocks::new(1_700_000_000_000_000);
        assert_eq!(c.monotonic_micros(), 0);
        c.sleep(StdDuration::from_secs(5));
        assert_eq!(c.monotonic_micros(), 5_000_000);
        assert_eq!(c.realtime_micros(), 1_700_000_005_000_000);
    }
}
