// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The read-only projection surface an external web layer queries
//! (spec.md §4.7): stream list, paginated/filtered recordings, a single
//! recording's metadata, a day's timeline, and live health counters.
//! Nothing here serves HTTP; it's a plain function surface over a
//! `rusqlite::Connection` plus whatever `StreamHealth` snapshots the
//! caller collects from its stream workers.

use base::time::Time;
use base::{err, Error};
use db::segment::Segment;
use db::stream::Stream;
use rusqlite::Connection;

pub use db::segment::ListFilter as RecordingsFilter;

pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Configured streams, in name order.
pub fn streams(conn: &Connection) -> Result<Vec<Stream>, Error> {
    db::stream::list(conn)
}

/// A page of recordings matching `filter`, newest first.
pub fn list_recordings(
    conn: &Connection,
    filter: &RecordingsFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<Segment>, Error> {
    let limit = if limit <= 0 { DEFAULT_PAGE_SIZE } else { limit };
    db::segment::list_filtered(conn, filter, limit, offset.max(0))
}

/// A single recording's metadata.
pub fn recording(conn: &Connection, segment_id: i64) -> Result<Segment, Error> {
    db::segment::get(conn, segment_id)
}

/// Every segment overlapping the calendar day (in [`base::time::global_zone`])
/// that `at` falls on, oldest first: the timeline view for one stream's day.
pub fn timeline_for_day(conn: &Connection, stream_name: &str, at: Time) -> Result<Vec<Segment>, Error> {
    let (start, end) = day_bounds(at)?;
    db::segment::query(conn, stream_name, start, end)
}

fn day_bounds(at: Time) -> Result<(Time, Time), Error> {
    let zone = base::time::global_zone();
    let date_key = at.day_key()?;
    let date: jiff::civil::Date = date_key
        .parse()
        .map_err(|e| err!(Internal, "parsing day key {date_key:?}: {e}"))?;
    let start = date
        .to_zoned(zone.clone())
        .map_err(|e| err!(Internal, "resolving start of day {date_key:?}: {e}"))?;
    let next = date
        .tomorrow()
        .map_err(|e| err!(Internal, "computing day after {date_key:?}: {e}"))?;
    let end = next
        .to_zoned(zone)
        .map_err(|e| err!(Internal, "resolving start of day after {date_key:?}: {e}"))?;
    Ok((
        Time::from_unix_millis(start.timestamp().as_millisecond()),
        Time::from_unix_millis(end.timestamp().as_millisecond()),
    ))
}

/// A stream worker's current liveness, as last observed by its
/// supervisor. Kept separate from [`Stream`] (the configured row)
/// because it's process-local state, never persisted.
#[derive(Clone, Debug)]
pub struct StreamHealth {
    pub stream_name: String,
    pub state: String,
    pub consecutive_failures: u32,
}

/// Per-stream configuration joined with live health and current storage
/// footprint — the "live health counters" projection.
#[derive(Clone, Debug)]
pub struct StreamStatus {
    pub stream: Stream,
    pub health: Option<StreamHealth>,
    pub bytes_used: i64,
}

pub fn stream_statuses(conn: &Connection, live: &[StreamHealth]) -> Result<Vec<StreamStatus>, Error> {
    let streams = db::stream::list(conn)?;
    let mut out = Vec::with_capacity(streams.len());
    for stream in streams {
        let bytes_used = db::segment::total_bytes_used_by_stream(conn, &stream.name)?;
        let health = live.iter().find(|h| h.stream_name == stream.name).cloned();
        out.push(StreamStatus { stream, health, bytes_used });
    }
    Ok(out)
}
