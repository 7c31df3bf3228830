// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `segments` table: one row per sealed recording file (HLS `.ts` or
//! MP4) on disk, and the queries the retention and query-API layers run
//! against it.

use base::time::Time;
use base::{err, Error};
use rusqlite::{Connection, OptionalExtension};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Container {
    Ts,
    Mp4,
}

impl Container {
    fn as_str(&self) -> &'static str {
        match self {
            Container::Ts => "ts",
            Container::Mp4 => "mp4",
        }
    }

    fn parse(s: &str) -> Container {
        match s {
            "mp4" => Container::Mp4,
            _ => Container::Ts,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Segment {
    pub id: i64,
    pub stream_name: String,
    pub path: String,
    pub container: Container,
    pub start: Time,
    pub end: Time,
    pub size_bytes: i64,
    pub frame_count: i64,
    pub has_detection: bool,
    pub thumbnail_generated: bool,
}

fn row_to_segment(row: &rusqlite::Row) -> rusqlite::Result<Segment> {
    let container: String = row.get("container")?;
    Ok(Segment {
        id: row.get("id")?,
        stream_name: row.get("stream_name")?,
        path: row.get("path")?,
        container: Container::parse(&container),
        start: Time::from_unix_millis(row.get("start_ms")?),
        end: Time::from_unix_millis(row.get("end_ms")?),
        size_bytes: row.get("size_bytes")?,
        frame_count: row.get("frame_count")?,
        has_detection: row.get("has_detection")?,
        thumbnail_generated: row.get("thumbnail_generated")?,
    })
}

/// Records a just-sealed segment file. Called once the writer has renamed
/// the file into place and knows its final size and frame count.
///
/// Idempotent with respect to `(stream_name, start)`: a second insert for
/// the same pair (reconciliation re-registering a file the writer already
/// registered before a crash) updates the existing row's `end`/size/frame
/// count instead of erroring on the `UNIQUE` constraint.
pub fn insert(
    conn: &Connection,
    stream_name: &str,
    path: &str,
    container: Container,
    start: Time,
    end: Time,
    size_bytes: i64,
    frame_count: i64,
) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO segments
            (stream_name, path, container, start_ms, end_ms, size_bytes, frame_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (stream_name, start_ms) DO UPDATE SET
            end_ms = excluded.end_ms,
            size_bytes = excluded.size_bytes,
            frame_count = excluded.frame_count",
        rusqlite::params![
            stream_name,
            path,
            container.as_str(),
            start.unix_millis(),
            end.unix_millis(),
            size_bytes,
            frame_count,
        ],
    )?;
    conn.query_row(
        "SELECT id FROM segments WHERE stream_name = ?1 AND start_ms = ?2",
        rusqlite::params![stream_name, start.unix_millis()],
        |row| row.get(0),
    )
    .map_err(Error::from)
}

pub fn mark_has_detection(conn: &Connection, id: i64) -> Result<(), Error> {
    conn.execute("UPDATE segments SET has_detection = 1 WHERE id = ?1", [id])?;
    Ok(())
}

pub fn mark_thumbnail_generated(conn: &Connection, id: i64) -> Result<(), Error> {
    conn.execute("UPDATE segments SET thumbnail_generated = 1 WHERE id = ?1", [id])?;
    Ok(())
}

pub fn get(conn: &Connection, id: i64) -> Result<Segment, Error> {
    conn.query_row("SELECT * FROM segments WHERE id = ?1 AND state = 'active'", [id], row_to_segment)
        .optional()?
        .ok_or_else(|| err!(NotFound, "no such segment {id}"))
}

/// Segments for `stream_name` overlapping `[start, end)`, oldest first.
pub fn query(
    conn: &Connection,
    stream_name: &str,
    start: Time,
    end: Time,
) -> Result<Vec<Segment>, Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM segments
         WHERE stream_name = ?1 AND state = 'active' AND start_ms < ?3 AND end_ms > ?2
         ORDER BY start_ms",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![stream_name, start.unix_millis(), end.unix_millis()],
        row_to_segment,
    )?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
}

/// Soft-deletes a segment row (marks it `deleted` rather than removing it,
/// so a crash between the DB update and the `unlink` can be reconciled on
/// the next startup scan).
pub fn mark_deleted(conn: &Connection, id: i64) -> Result<(), Error> {
    conn.execute("UPDATE segments SET state = 'deleted' WHERE id = ?1", [id])?;
    Ok(())
}

/// Drops the row entirely, once the backing file is confirmed gone.
pub fn purge(conn: &Connection, id: i64) -> Result<(), Error> {
    conn.execute("DELETE FROM segments WHERE id = ?1", [id])?;
    Ok(())
}

pub fn total_bytes_used(conn: &Connection) -> Result<i64, Error> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM segments WHERE state = 'active'",
        [],
        |row| row.get(0),
    )?)
}

pub fn total_bytes_used_by_stream(conn: &Connection, stream_name: &str) -> Result<i64, Error> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM segments WHERE state = 'active' AND stream_name = ?1",
        [stream_name],
        |row| row.get(0),
    )?)
}

/// The oldest `limit` active segments across all streams, for the
/// capacity-driven garbage collector. The caller excludes the
/// currently-open segment of each stream by never having inserted it yet.
pub fn oldest_candidates_for_gc(conn: &Connection, limit: i64) -> Result<Vec<Segment>, Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM segments WHERE state = 'active' ORDER BY end_ms ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], row_to_segment)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
}

/// The oldest active segments for one stream older than `retention_days`,
/// used by the per-stream retention-days pass before the capacity pass.
pub fn expired_by_age(conn: &Connection, stream_name: &str, cutoff: Time) -> Result<Vec<Segment>, Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM segments
         WHERE state = 'active' AND stream_name = ?1 AND end_ms < ?2
         ORDER BY end_ms ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![stream_name, cutoff.unix_millis()], row_to_segment)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
}

/// Optional predicates for [`list_filtered`]; `None` fields are left
/// unconstrained.
#[derive(Clone, Debug, Default)]
pub struct ListFilter<'a> {
    pub stream_name: Option<&'a str>,
    pub start: Option<Time>,
    pub end: Option<Time>,
    pub has_detection: Option<bool>,
}

/// Active segments matching `filter`, newest first, for the query API's
/// paginated recordings listing.
pub fn list_filtered(
    conn: &Connection,
    filter: &ListFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<Segment>, Error> {
    let mut sql = String::from("SELECT * FROM segments WHERE state = 'active'");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(name) = filter.stream_name {
        sql.push_str(" AND stream_name = ?");
        params.push(Box::new(name.to_string()));
    }
    if let Some(start) = filter.start {
        sql.push_str(" AND end_ms > ?");
        params.push(Box::new(start.unix_millis()));
    }
    if let Some(end) = filter.end {
        sql.push_str(" AND start_ms < ?");
        params.push(Box::new(end.unix_millis()));
    }
    if let Some(has_detection) = filter.has_detection {
        sql.push_str(" AND has_detection = ?");
        params.push(Box::new(has_detection));
    }
    sql.push_str(" ORDER BY start_ms DESC LIMIT ? OFFSET ?");
    params.push(Box::new(limit));
    params.push(Box::new(offset));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), row_to_segment)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn seed_stream(conn: &Connection, name: &str) {
        conn.execute(
            "INSERT INTO streams (name, url) VALUES (?1, 'rtsp://x')",
            [name],
        )
        .unwrap();
    }

    #[test]
    fn insert_and_query_overlap() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        insert(&db.conn(), "cam1", "/a.mp4", Container::Mp4, Time::from_unix_millis(0), Time::from_unix_millis(4000), 1024, 100).unwrap();
        insert(&db.conn(), "cam1", "/b.mp4", Container::Mp4, Time::from_unix_millis(4000), Time::from_unix_millis(8000), 2048, 200).unwrap();

        let hits = query(&db.conn(), "cam1", Time::from_unix_millis(3000), Time::from_unix_millis(5000)).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn mark_deleted_excludes_from_totals() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        let id = insert(&db.conn(), "cam1", "/a.mp4", Container::Mp4, Time::from_unix_millis(0), Time::from_unix_millis(4000), 1024, 100).unwrap();
        assert_eq!(total_bytes_used(&db.conn()).unwrap(), 1024);
        mark_deleted(&db.conn(), id).unwrap();
        assert_eq!(total_bytes_used(&db.conn()).unwrap(), 0);
    }

    #[test]
    fn duplicate_insert_for_same_stream_and_start_updates_existing_row() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        let id = insert(&db.conn(), "cam1", "/a.mp4", Container::Mp4, Time::from_unix_millis(0), Time::from_unix_millis(4000), 1024, 100).unwrap();
        let id2 = insert(&db.conn(), "cam1", "/a.mp4", Container::Mp4, Time::from_unix_millis(0), Time::from_unix_millis(5000), 2048, 150).unwrap();
        assert_eq!(id, id2);
        let row = get(&db.conn(), id).unwrap();
        assert_eq!(row.end.unix_millis(), 5000);
        assert_eq!(row.size_bytes, 2048);
        assert_eq!(row.frame_count, 150);
        assert_eq!(total_bytes_used(&db.conn()).unwrap(), 2048);
    }

    #[test]
    fn oldest_candidates_ordered_by_end() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        insert(&db.conn(), "cam1", "/b.mp4", Container::Mp4, Time::from_unix_millis(4000), Time::from_unix_millis(8000), 1, 1).unwrap();
        insert(&db.conn(), "cam1", "/a.mp4", Container::Mp4, Time::from_unix_millis(0), Time::from_unix_millis(4000), 1, 1).unwrap();
        let oldest = oldest_candidates_for_gc(&db.conn(), 1).unwrap();
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].path, "/a.mp4");
    }

    #[test]
    fn list_filtered_applies_stream_and_detection_predicates() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        seed_stream(&db.conn(), "cam2");
        let id1 = insert(&db.conn(), "cam1", "/a.mp4", Container::Mp4, Time::from_unix_millis(0), Time::from_unix_millis(4000), 1, 1).unwrap();
        insert(&db.conn(), "cam1", "/b.mp4", Container::Mp4, Time::from_unix_millis(4000), Time::from_unix_millis(8000), 1, 1).unwrap();
        insert(&db.conn(), "cam2", "/c.mp4", Container::Mp4, Time::from_unix_millis(0), Time::from_unix_millis(4000), 1, 1).unwrap();
        mark_has_detection(&db.conn(), id1).unwrap();

        let cam1_only = list_filtered(&db.conn(), &ListFilter { stream_name: Some("cam1"), ..Default::default() }, 10, 0).unwrap();
        assert_eq!(cam1_only.len(), 2);

        let detected = list_filtered(&db.conn(), &ListFilter { has_detection: Some(true), ..Default::default() }, 10, 0).unwrap();
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].path, "/a.mp4");

        let page = list_filtered(&db.conn(), &ListFilter::default(), 1, 1).unwrap();
        assert_eq!(page.len(), 1);
    }
}
