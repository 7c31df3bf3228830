// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `detection_results` ring. Written by the (out-of-scope) inference
//! pipeline; this module only owns the row shape, the insert, and the
//! per-stream cap that keeps the table from growing without bound.

use base::time::Time;
use base::Error;
use rusqlite::Connection;

/// Rows kept per stream before [`prune`] starts dropping the oldest.
pub const RING_CAPACITY: i64 = 10_000;

#[derive(Clone, Debug)]
pub struct DetectionResult {
    pub id: i64,
    pub stream_name: String,
    pub time: Time,
    pub label: String,
    pub confidence: f64,
    pub bbox_json: Option<String>,
}

fn row_to_result(row: &rusqlite::Row) -> rusqlite::Result<DetectionResult> {
    Ok(DetectionResult {
        id: row.get("id")?,
        stream_name: row.get("stream_name")?,
        time: Time::from_unix_millis(row.get("time_ms")?),
        label: row.get("label")?,
        confidence: row.get("confidence")?,
        bbox_json: row.get("bbox_json")?,
    })
}

pub fn insert(
    conn: &Connection,
    stream_name: &str,
    at: Time,
    label: &str,
    confidence: f64,
    bbox_json: Option<&str>,
) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO detection_results (stream_name, time_ms, label, confidence, bbox_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![stream_name, at.unix_millis(), label, confidence, bbox_json],
    )?;
    let id = conn.last_insert_rowid();
    prune(conn, stream_name)?;
    Ok(id)
}

pub fn list_in_range(
    conn: &Connection,
    stream_name: &str,
    start: Time,
    end: Time,
) -> Result<Vec<DetectionResult>, Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM detection_results
         WHERE stream_name = ?1 AND time_ms >= ?2 AND time_ms < ?3
         ORDER BY time_ms",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![stream_name, start.unix_millis(), end.unix_millis()],
        row_to_result,
    )?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
}

/// Deletes the oldest rows for `stream_name` past [`RING_CAPACITY`].
fn prune(conn: &Connection, stream_name: &str) -> Result<(), Error> {
    conn.execute(
        "DELETE FROM detection_results
         WHERE stream_name = ?1 AND id NOT IN (
             SELECT id FROM detection_results
             WHERE stream_name = ?1
             ORDER BY time_ms DESC
             LIMIT ?2
         )",
        rusqlite::params![stream_name, RING_CAPACITY],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn seed_stream(conn: &Connection, name: &str) {
        conn.execute("INSERT INTO streams (name, url) VALUES (?1, 'rtsp://x')", [name]).unwrap();
    }

    #[test]
    fn insert_and_list() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        insert(&db.conn(), "cam1", Time::from_unix_millis(100), "person", 0.9, None).unwrap();
        let got = list_in_range(&db.conn(), "cam1", Time::from_unix_millis(0), Time::from_unix_millis(1000)).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].label, "person");
    }

    #[test]
    fn ring_caps_per_stream() {
        let db = testutil::TestDb::new();
        seed_stream(&db.conn(), "cam1");
        for i in 0..5 {
            insert(&db.conn(), "cam1", Time::from_unix_millis(i), "x", 0.5, None).unwrap();
        }
        // Below cap: nothing pruned.
        let count: i64 = db.conn().query_row("SELECT COUNT(*) FROM detection_results", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 5);
    }
}
