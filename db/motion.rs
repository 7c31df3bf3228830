// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `motion_events` table. An event opens when motion is first
//! detected (or an operator/ONVIF signal arrives), accumulates the ids of
//! segments it overlaps while open, and closes when the source goes quiet
//! for longer than the stream's `post_buffer_sec`.

use base::time::Time;
use base::{err, Error};
use rusqlite::{Connection, OptionalExtension};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Source {
    Onvif,
    Analytic,
    Manual,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Source::Onvif => "onvif",
            Source::Analytic => "analytic",
            Source::Manual => "manual",
        }
    }

    fn parse(s: &str) -> Source {
        match s {
            "onvif" => Source::Onvif,
            "manual" => Source::Manual,
            _ => Source::Analytic,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MotionEvent {
    pub id: i64,
    pub stream_name: String,
    pub start: Time,
    pub end: Option<Time>,
    pub source: Source,
    pub segment_ids: Vec<i64>,
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<MotionEvent> {
    let source: String = row.get("source")?;
    let segment_ids_json: String = row.get("segment_ids_json")?;
    let segment_ids: Vec<i64> = serde_json::from_str(&segment_ids_json).unwrap_or_default();
    let end_ms: Option<i64> = row.get("end_ms")?;
    Ok(MotionEvent {
        id: row.get("id")?,
        stream_name: row.get("stream_name")?,
        start: Time::from_unix_millis(row.get("start_ms")?),
        end: end_ms.map(Time::from_unix_millis),
        source: Source::parse(&source),
        segment_ids,
    })
}

/// Opens a new event. Returns its row id.
pub fn start(conn: &Connection, stream_name: &str, at: Time, source: Source) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO motion_events (stream_name, start_ms, source) VALUES (?1, ?2, ?3)",
        rusqlite::params![stream_name, at.unix_millis(), source.as_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Appends a segment id to an open event's coverage list. Idempotent: a
/// segment already in the list is not duplicated, so the caller can retry
/// after a crash without double-linking.
pub fn link_segment(conn: &Connection, event_id: i64, segment_id: i64) -> Result<(), Error> {
    let mut ev = get(conn, event_id)?;
    if !ev.segment_ids.contains(&segment_id) {
        ev.segment_ids.push(segment_id);
        let json = serde_json::to_string(&ev.segment_ids)
            .map_err(|e| err!(Internal, "serializing segment ids: {e}"))?;
        conn.execute(
            "UPDATE motion_events SET segment_ids_json = ?1 WHERE id = ?2",
            rusqlite::params![json, event_id],
        )?;
    }
    Ok(())
}

/// Closes an open event. Errs with `FailedPrecondition` if already closed,
/// since that would silently move `end_ms` backward or overwrite a
/// concurrent close.
pub fn finish(conn: &Connection, event_id: i64, at: Time) -> Result<(), Error> {
    let n = conn.execute(
        "UPDATE motion_events SET end_ms = ?1 WHERE id = ?2 AND end_ms IS NULL",
        rusqlite::params![at.unix_millis(), event_id],
    )?;
    if n == 0 {
        return Err(err!(FailedPrecondition, "motion event {event_id} already closed or missing"));
    }
    Ok(())
}

pub fn get(conn: &Connection, event_id: i64) -> Result<MotionEvent, Error> {
    conn.query_row("SELECT * FROM motion_events WHERE id = ?1", [event_id], row_to_event)
        .optional()?
        .ok_or_else(|| err!(NotFound, "no such motion event {event_id}"))
}

/// Open events for a stream (at most one, in practice, but callers
/// shouldn't assume it and should reconcile duplicates if found).
pub fn open_events(conn: &Connection, stream_name: &str) -> Result<Vec<MotionEvent>, Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM motion_events WHERE stream_name = ?1 AND end_ms IS NULL ORDER BY start_ms",
    )?;
    let rows = stmt.query_map([stream_name], row_to_event)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
}

pub fn list_in_range(
    conn: &Connection,
    stream_name: &str,
    start: Time,
    end: Time,
) -> Result<Vec<MotionEvent>, Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM motion_events
         WHERE stream_name = ?1 AND start_ms < ?3 AND (end_ms IS NULL OR end_ms > ?2)
         ORDER BY start_ms",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![stream_name, start.unix_millis(), end.unix_millis()],
        row_to_event,
    )?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn seed_stream(conn: &Connection, name: &str) {
        conn.execute("INSERT INTO streams (name, url) VALUES (?1, 'rtsp://x')", [name]).unwrap();
    }

    #[test]
    fn start_link_finish() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        let id = start(&db.conn(), "cam1", Time::from_unix_millis(0), Source::Analytic).unwrap();
        link_segment(&db.conn(), id, 42).unwrap();
        link_segment(&db.conn(), id, 42).unwrap(); // idempotent
        let ev = get(&db.conn(), id).unwrap();
        assert_eq!(ev.segment_ids, vec![42]);
        assert!(ev.end.is_none());

        finish(&db.conn(), id, Time::from_unix_millis(5000)).unwrap();
        let ev = get(&db.conn(), id).unwrap();
        assert_eq!(ev.end.unwrap().unix_millis(), 5000);
    }

    #[test]
    fn double_finish_rejected() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        let id = start(&db.conn(), "cam1", Time::from_unix_millis(0), Source::Manual).unwrap();
        finish(&db.conn(), id, Time::from_unix_millis(10)).unwrap();
        assert!(finish(&db.conn(), id, Time::from_unix_millis(20)).is_err());
    }
}
