// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Keeps recorded storage under its configured limits (spec.md §4.6):
//! per-stream age expiry first, then a capacity-driven pass once the
//! recordings volume crosses its high-water mark. Runs on its own
//! thread, one instance for the whole process (unlike `SegmentWriter`,
//! which is one per stream).

use crate::event_bus::{Event, EventBus};
use base::shutdown::Receiver as ShutdownReceiver;
use base::time::{Duration as TimeDuration, Time};
use base::{err, Error};
use db::segment::Segment;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tracing::{error, info, warn};

pub const DEFAULT_PERIOD: StdDuration = StdDuration::from_secs(60);
pub const DEFAULT_HIGH_WATER_FRACTION: f64 = 0.90;
pub const DEFAULT_LOW_WATER_FRACTION: f64 = 0.85;

/// Disk-usage thresholds that trigger and stop the capacity-driven pass
/// (spec.md §4.6), configurable per [`crate::config::Config`].
#[derive(Clone, Copy, Debug)]
pub struct WaterMarks {
    pub high: f64,
    pub low: f64,
}

impl Default for WaterMarks {
    fn default() -> WaterMarks {
        WaterMarks { high: DEFAULT_HIGH_WATER_FRACTION, low: DEFAULT_LOW_WATER_FRACTION }
    }
}

/// Added on top of a stream's `post_buffer_sec` before a motion event's
/// segments become eligible for capacity-driven deletion (spec.md §4.6).
const MOTION_GRACE_EXTRA_SECS: i64 = 30;
/// Candidates fetched per round of the capacity pass; small enough that
/// a pass dominated by protected (motion-active) segments doesn't pull
/// the whole table into memory before making progress.
const CANDIDATE_BATCH: i64 = 64;

#[derive(Debug, Default, Clone, Copy)]
pub struct GcReport {
    pub segments_deleted: u64,
    pub bytes_freed: u64,
}

pub struct RetentionGc {
    db: Arc<Mutex<rusqlite::Connection>>,
    recordings_root: PathBuf,
    events: EventBus,
    shutdown: ShutdownReceiver,
    water_marks: WaterMarks,
}

impl RetentionGc {
    pub fn new(
        db: Arc<Mutex<rusqlite::Connection>>,
        recordings_root: PathBuf,
        events: EventBus,
        shutdown: ShutdownReceiver,
        water_marks: WaterMarks,
    ) -> RetentionGc {
        RetentionGc { db, recordings_root, events, shutdown, water_marks }
    }

    /// Runs periodically (spec.md §4.6: every 60 s) until shutdown.
    pub fn run(self) -> Result<(), Error> {
        loop {
            if self.shutdown.check().is_err() {
                return Ok(());
            }
            match self.run_once() {
                Ok(report) if report.segments_deleted > 0 => {
                    info!(
                        deleted = report.segments_deleted,
                        bytes_freed = report.bytes_freed,
                        "retention pass freed space"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "retention pass failed"),
            }
            if self.shutdown.wait_for(DEFAULT_PERIOD).is_err() {
                return Ok(());
            }
        }
    }

    /// Runs one full pass: age expiry for every stream, then a capacity
    /// pass if the recordings volume is still above the high-water mark.
    /// Exposed separately from `run` so an operator-initiated GC
    /// (spec.md §4.6 "Explicit" trigger) can call it directly.
    pub fn run_once(&self) -> Result<GcReport, Error> {
        let (used, total) = disk_usage(&self.recordings_root)?;
        self.run_once_with_usage(used, total)
    }

    fn run_once_with_usage(&self, used: u64, total: u64) -> Result<GcReport, Error> {
        let mut report = GcReport::default();
        let conn = self.db.lock().unwrap();
        let streams = db::stream::list(&conn)?;
        let now = Time::now();

        for stream in &streams {
            if stream.settings.retention_days == 0 {
                continue;
            }
            let cutoff = now - TimeDuration::from_secs(stream.settings.retention_days as i64 * 86400);
            let expired = db::segment::expired_by_age(&conn, &stream.name, cutoff)?;
            for seg in &expired {
                delete_segment(&conn, &self.events, seg, &mut report);
            }
        }

        if total == 0 {
            return Ok(report);
        }
        let usage_fraction = used.saturating_sub(report.bytes_freed) as f64 / total as f64;
        if usage_fraction < self.water_marks.high {
            return Ok(report);
        }
        let low_water_bytes = (total as f64 * self.water_marks.low) as u64;
        let used_after_age_expiry = used.saturating_sub(report.bytes_freed);
        let target_freed = used_after_age_expiry.saturating_sub(low_water_bytes);
        if target_freed == 0 {
            return Ok(report);
        }

        let protected = protected_segment_ids(&conn, &streams, now)?;
        let mut freed_this_pass = 0u64;
        loop {
            if freed_this_pass >= target_freed {
                break;
            }
            let candidates = db::segment::oldest_candidates_for_gc(&conn, CANDIDATE_BATCH)?;
            if candidates.is_empty() {
                break;
            }
            let mut made_progress = false;
            for seg in &candidates {
                if protected.contains(&seg.id) {
                    continue;
                }
                freed_this_pass += seg.size_bytes.max(0) as u64;
                delete_segment(&conn, &self.events, seg, &mut report);
                made_progress = true;
                if freed_this_pass >= target_freed {
                    break;
                }
            }
            if !made_progress {
                // Every candidate this round belongs to an active motion
                // event; stop instead of re-fetching the same batch forever.
                break;
            }
        }
        Ok(report)
    }
}

/// Segment ids that must survive this pass because they belong to a
/// still-open motion event, or a closed one still inside its grace
/// window (spec.md §4.6: `post_buffer + 30s`).
fn protected_segment_ids(
    conn: &rusqlite::Connection,
    streams: &[db::stream::Stream],
    now: Time,
) -> Result<HashSet<i64>, Error> {
    let mut protected = HashSet::new();
    // A day's lookback comfortably covers any plausible post_buffer_sec;
    // events older than that have long since cleared their grace window.
    let lookback = TimeDuration::from_secs(24 * 3600);
    for stream in streams {
        let events = db::motion::list_in_range(conn, &stream.name, now - lookback, now)?;
        for ev in events {
            let still_protected = match ev.end {
                None => true,
                Some(end) => {
                    let grace = TimeDuration::from_secs(stream.settings.post_buffer_sec as i64 + MOTION_GRACE_EXTRA_SECS);
                    end + grace > now
                }
            };
            if still_protected {
                protected.extend(ev.segment_ids.iter().copied());
            }
        }
    }
    Ok(protected)
}

/// Soft-deletes, unlinks, and (if the unlink succeeded or the file was
/// already gone) purges one segment row, publishing `segment.deleted`.
/// A non-ENOENT unlink error leaves the row soft-deleted rather than
/// purged, so it isn't double-counted in future capacity passes but can
/// still be retried (spec.md §4.6: "aborts that candidate but does not
/// stop GC").
fn delete_segment(conn: &rusqlite::Connection, events: &EventBus, seg: &Segment, report: &mut GcReport) {
    if let Err(e) = db::segment::mark_deleted(conn, seg.id) {
        warn!(segment_id = seg.id, error = %e, "failed to mark segment deleted");
        return;
    }
    match std::fs::remove_file(&seg.path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(segment_id = seg.id, path = %seg.path, error = %e, "failed to unlink segment file");
            return;
        }
    }
    let _ = db::segment::purge(conn, seg.id);
    report.segments_deleted += 1;
    report.bytes_freed += seg.size_bytes.max(0) as u64;
    events.publish(Event::SegmentDeleted { stream_name: seg.stream_name.clone(), segment_id: seg.id });
}

/// `(used_bytes, total_bytes)` on the filesystem backing `path`, via
/// `statvfs(2)` over the path directly, since `RetentionGc` has no open
/// directory handle of its own to reuse.
fn disk_usage(path: &std::path::Path) -> Result<(u64, u64), Error> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| err!(InvalidArgument, "recordings path contains a NUL byte: {e}"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(err!(Internal, "statvfs({path:?}): {}", std::io::Error::last_os_error()));
    }
    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let avail = stat.f_bavail as u64 * frsize;
    Ok((total.saturating_sub(avail), total))
}
