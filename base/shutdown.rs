// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Cooperative shutdown, checked by every long-lived worker thread at each
//! packet boundary (per the two-phase shutdown in the design notes: tokens
//! set, workers drain, then the process joins remaining threads).
//!
//! The receiver is cheap to clone and can be polled from synchronous code
//! (`check`, `wait_for`) without going through an async runtime, since
//! [`IngestWorker`](crate) and [`SegmentWriter`](crate) both run on plain
//! OS threads.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use slab::Slab;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    /// `None` once shutdown has happened.
    wakers: Mutex<Option<Slab<Waker>>>,
    condvar: Condvar,
}

/// Dropping the sender requests shutdown of every clone of its [`Receiver`].
pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Modify the lock state, then notify: the opposite order would
        // create a race where a waiter might never wake.
        let mut wakers = self.0.wakers.lock().unwrap();
        let taken = wakers.take().expect("only the single Sender clears the slab");
        drop(wakers);
        for w in taken {
            w.1.wake();
        }
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

const NO_WAKER: usize = usize::MAX;

pub struct ReceiverFuture {
    receiver: Arc<Inner>,
    waker_i: usize,
}

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.wakers.lock().unwrap().is_none() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks the current thread until shutdown or `timeout` elapses.
    /// Returns `Ok(())` on timeout, `Err` if shutdown was requested.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.wakers.lock().unwrap();
        let (_l, result) = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |wakers| wakers.is_some())
            .unwrap();
        if result.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }

    pub fn future(&self) -> ReceiverFuture {
        ReceiverFuture { receiver: self.0.clone(), waker_i: NO_WAKER }
    }
}

impl Future for ReceiverFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let mut l = this.receiver.wakers.lock().unwrap();
        let wakers = match &mut *l {
            None => return Poll::Ready(()),
            Some(w) => w,
        };
        let new_waker = cx.waker();
        if this.waker_i == NO_WAKER {
            this.waker_i = wakers.insert(new_waker.clone());
        } else {
            let existing = &mut wakers[this.waker_i];
            if !new_waker.will_wake(existing) {
                existing.clone_from(new_waker);
            }
        }
        Poll::Pending
    }
}

impl Drop for ReceiverFuture {
    fn drop(&mut self) {
        if self.waker_i == NO_WAKER {
            return;
        }
        if let Some(wakers) = &mut *self.receiver.wakers.lock().unwrap() {
            wakers.remove(self.waker_i);
        }
    }
}

/// Returns a sender and receiver for graceful shutdown. Dropping the
/// sender (or calling `drop(sender)` explicitly) requests shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner { wakers: Mutex::new(Some(Slab::new())), condvar: Condvar::new() });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_check() {
        let (tx, rx) = channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn blocking_wait_wakes_on_drop() {
        let (tx, rx) = channel();
        rx.wait_for(Duration::from_secs(0)).unwrap();
        let h = std::thread::spawn(move || rx.wait_for(Duration::from_secs(1000)).unwrap_err());
        std::thread::sleep(Duration::from_millis(10));
        drop(tx);
        h.join().unwrap();
    }
}
