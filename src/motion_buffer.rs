// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Bounded per-stream pre-buffer of encoded packets (spec.md §4.3), so a
//! motion trigger can back-date a recording by a few seconds. Single
//! writer (the router thread), single reader (the flush path that runs
//! when a motion event starts); the process-wide byte pool is the only
//! state shared across streams, and it's a plain atomic.

use crate::packet::Packet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Process-wide memory pool all `MotionBuffer`s draw from (spec.md §4.3:
/// "a process-wide memory pool budget (default 50 MiB)"). One instance
/// is constructed at startup and an `Arc` handed to every buffer.
pub struct Pool {
    budget_bytes: i64,
    used_bytes: AtomicI64,
}

pub const DEFAULT_POOL_BUDGET_BYTES: i64 = 50 * 1024 * 1024;

impl Pool {
    pub fn new(budget_bytes: i64) -> Arc<Pool> {
        Arc::new(Pool { budget_bytes, used_bytes: AtomicI64::new(0) })
    }

    /// Tries to reserve `len` bytes from the pool; `false` if it would
    /// exceed the budget. Never blocks.
    fn try_reserve(&self, len: i64) -> bool {
        let mut used = self.used_bytes.load(Ordering::Acquire);
        loop {
            if used + len > self.budget_bytes {
                return false;
            }
            match self.used_bytes.compare_exchange_weak(
                used,
                used + len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    fn release(&self, len: i64) {
        self.used_bytes.fetch_sub(len, Ordering::AcqRel);
    }

    pub fn used_bytes(&self) -> i64 {
        self.used_bytes.load(Ordering::Acquire)
    }
}

#[derive(Default, Clone, Copy, Debug)]
pub struct Stats {
    pub packets: u64,
    pub bytes: u64,
    pub duration_s: f64,
    pub drops: u64,
}

/// One stream's pre-buffer. `duration_budget_us` is the stream's
/// configured pre-buffer window (0-30s, spec.md §3); `pool` is the
/// shared process-wide byte budget.
pub struct MotionBuffer {
    pool: Arc<Pool>,
    duration_budget_us: i64,
    packets: VecDeque<Packet>,
    drops: u64,
}

impl MotionBuffer {
    pub fn new(pool: Arc<Pool>, duration_budget_us: i64) -> MotionBuffer {
        MotionBuffer { pool, duration_budget_us, packets: VecDeque::new(), drops: 0 }
    }

    /// Pushes a packet, evicting the oldest packets first if the
    /// duration or pool budget would otherwise be exceeded. A packet
    /// that can't fit even in an empty buffer (single packet bigger
    /// than the pool) is dropped and counted (spec.md §4.3).
    pub fn push(&mut self, packet: Packet) {
        let len = packet.len() as i64;
        if !self.pool.try_reserve(len) {
            self.evict_oldest_until(len);
            if !self.pool.try_reserve(len) {
                self.drops += 1;
                return;
            }
        }
        self.packets.push_back(packet);
        self.enforce_duration_budget();
    }

    fn evict_oldest_until(&mut self, needed: i64) {
        while self.pool.budget_bytes - self.pool.used_bytes() < needed {
            match self.packets.pop_front() {
                Some(p) => self.pool.release(p.len() as i64),
                None => break,
            }
        }
    }

    fn enforce_duration_budget(&mut self) {
        if self.duration_budget_us <= 0 {
            return;
        }
        while let (Some(oldest), Some(newest)) = (self.packets.front(), self.packets.back()) {
            if newest.pts - oldest.pts <= self.duration_budget_us {
                break;
            }
            let evicted = self.packets.pop_front().unwrap();
            self.pool.release(evicted.len() as i64);
        }
    }

    /// Drains the buffer oldest-first into `on_packet`, dropping any
    /// leading non-keyframe packets so the handoff always starts from a
    /// keyframe (spec.md §4.3 "Flush is guaranteed to start from a
    /// keyframe"). One-shot: the buffer is empty afterward.
    pub fn flush(&mut self, mut on_packet: impl FnMut(Packet)) -> usize {
        while let Some(front) = self.packets.front() {
            if front.is_keyframe {
                break;
            }
            let dropped = self.packets.pop_front().unwrap();
            self.pool.release(dropped.len() as i64);
        }
        let mut count = 0;
        while let Some(p) = self.packets.pop_front() {
            self.pool.release(p.len() as i64);
            on_packet(p);
            count += 1;
        }
        count
    }

    pub fn stats(&self) -> Stats {
        let bytes: u64 = self.packets.iter().map(|p| p.len() as u64).sum();
        let duration_s = match (self.packets.front(), self.packets.back()) {
            (Some(f), Some(b)) => (b.pts - f.pts) as f64 / 1_000_000.0,
            _ => 0.0,
        };
        Stats { packets: self.packets.len() as u64, bytes, duration_s, drops: self.drops }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TrackKind;
    use bytes::Bytes;

    fn packet(pts: i64, len: usize, is_keyframe: bool) -> Packet {
        Packet {
            stream_name: "cam1".to_string(),
            data: Bytes::from(vec![0u8; len]),
            pts,
            dts: pts,
            duration_us: 0,
            is_keyframe,
            track: TrackKind::Video,
            new_parameters: None,
        }
    }

    #[test]
    fn evicts_oldest_when_duration_budget_exceeded() {
        let pool = Pool::new(DEFAULT_POOL_BUDGET_BYTES);
        let mut buf = MotionBuffer::new(pool, 5_000_000);
        buf.push(packet(0, 10, true));
        buf.push(packet(3_000_000, 10, false));
        buf.push(packet(7_000_000, 10, false));
        let stats = buf.stats();
        assert_eq!(stats.packets, 2);
    }

    #[test]
    fn pool_budget_is_shared_across_buffers() {
        let pool = Pool::new(100);
        let mut a = MotionBuffer::new(pool.clone(), i64::MAX);
        let mut b = MotionBuffer::new(pool.clone(), i64::MAX);
        a.push(packet(0, 60, true));
        b.push(packet(0, 60, true));
        // b's push couldn't fit without evicting a's only packet.
        assert_eq!(a.stats().packets, 0);
        assert_eq!(b.stats().packets, 1);
    }

    #[test]
    fn oversized_packet_is_dropped_and_counted() {
        let pool = Pool::new(10);
        let mut buf = MotionBuffer::new(pool, i64::MAX);
        buf.push(packet(0, 100, true));
        assert_eq!(buf.stats().packets, 0);
        assert_eq!(buf.stats().drops, 1);
    }

    #[test]
    fn flush_starts_from_keyframe_and_drains_once() {
        let pool = Pool::new(DEFAULT_POOL_BUDGET_BYTES);
        let mut buf = MotionBuffer::new(pool, i64::MAX);
        buf.push(packet(0, 10, false));
        buf.push(packet(1, 10, false));
        buf.push(packet(2, 10, true));
        buf.push(packet(3, 10, false));
        let mut flushed = Vec::new();
        let count = buf.flush(|p| flushed.push(p.pts));
        assert_eq!(count, 2);
        assert_eq!(flushed, vec![2, 3]);
        assert_eq!(buf.stats().packets, 0);
    }
}
