// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `streams` table: one row per configured camera.

use base::{err, Error, ErrorKind};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Per-stream knobs that don't need their own columns. Stored as JSON in
/// `streams.settings_json` so adding one doesn't force a migration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    pub segment_duration_sec: u32,
    pub retention_days: u32,
    pub motion_recording: bool,
    pub pre_buffer_sec: u32,
    pub post_buffer_sec: u32,
    pub priority: i32,
    pub record_mp4_directly: bool,
    /// Nominal resolution (spec.md §3: "advisory"): used to size the MP4
    /// `avc1` sample entry without parsing width/height out of the SPS
    /// ourselves. A mismatch against the stream's real encoded resolution
    /// doesn't break muxing; it just makes the advertised dimensions wrong.
    pub width_hint_px: u16,
    pub height_hint_px: u16,
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamSettings {
            segment_duration_sec: 900,
            retention_days: 30,
            motion_recording: false,
            pre_buffer_sec: 10,
            post_buffer_sec: 10,
            priority: 0,
            record_mp4_directly: false,
            width_hint_px: 1920,
            height_hint_px: 1080,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Stream {
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub streaming_enabled: bool,
    pub settings: StreamSettings,
}

fn row_to_stream(row: &rusqlite::Row) -> rusqlite::Result<Stream> {
    let settings_json: String = row.get("settings_json")?;
    let settings: StreamSettings = serde_json::from_str(&settings_json).unwrap_or_default();
    Ok(Stream {
        name: row.get("name")?,
        url: row.get("url")?,
        enabled: row.get("enabled")?,
        streaming_enabled: row.get("streaming_enabled")?,
        settings,
    })
}

/// Inserts a new stream. Errs with [`ErrorKind::AlreadyExists`] if `name` is
/// taken.
pub fn create(conn: &Connection, stream: &Stream) -> Result<(), Error> {
    let settings_json = serde_json::to_string(&stream.settings)
        .map_err(|e| err!(Internal, "serializing stream settings: {e}"))?;
    let n = conn
        .execute(
            "INSERT OR IGNORE INTO streams (name, url, enabled, streaming_enabled, settings_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                stream.name,
                stream.url,
                stream.enabled,
                stream.streaming_enabled,
                settings_json
            ],
        )?;
    if n == 0 {
        return Err(err!(AlreadyExists, "stream {:?} already exists", stream.name));
    }
    Ok(())
}

pub fn get(conn: &Connection, name: &str) -> Result<Stream, Error> {
    conn.query_row("SELECT * FROM streams WHERE name = ?1", [name], row_to_stream)
        .optional()?
        .ok_or_else(|| err!(NotFound, "no such stream {:?}", name))
}

pub fn list(conn: &Connection) -> Result<Vec<Stream>, Error> {
    let mut stmt = conn.prepare("SELECT * FROM streams ORDER BY name")?;
    let rows = stmt.query_map([], row_to_stream)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
}

pub fn set_enabled(conn: &Connection, name: &str, enabled: bool) -> Result<(), Error> {
    let n = conn.execute(
        "UPDATE streams SET enabled = ?1 WHERE name = ?2",
        rusqlite::params![enabled, name],
    )?;
    if n == 0 {
        return Err(err!(NotFound, "no such stream {:?}", name));
    }
    Ok(())
}

pub fn update_settings(conn: &Connection, name: &str, settings: &StreamSettings) -> Result<(), Error> {
    let settings_json = serde_json::to_string(settings)
        .map_err(|e| err!(Internal, "serializing stream settings: {e}"))?;
    let n = conn.execute(
        "UPDATE streams SET settings_json = ?1 WHERE name = ?2",
        rusqlite::params![settings_json, name],
    )?;
    if n == 0 {
        return Err(err!(NotFound, "no such stream {:?}", name));
    }
    Ok(())
}

/// Removes a stream row. The caller is responsible for stopping its
/// ingest worker and deciding what happens to its segments first; this
/// never cascades (segment rows reference `streams.name` but sqlite
/// doesn't enforce `ON DELETE` behavior we haven't asked for).
pub fn delete(conn: &Connection, name: &str) -> Result<(), Error> {
    let in_use: i64 = conn.query_row(
        "SELECT COUNT(*) FROM segments WHERE stream_name = ?1 AND state = 'active'",
        [name],
        |row| row.get(0),
    )?;
    if in_use > 0 {
        return Err(err!(
            FailedPrecondition,
            "stream {:?} still has {} active segments",
            name,
            in_use
        ));
    }
    let n = conn.execute("DELETE FROM streams WHERE name = ?1", [name])?;
    if n == 0 {
        return Err(err!(NotFound, "no such stream {:?}", name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn create_get_roundtrip() {
        let db = testutil::TestDb::new();
        let s = Stream {
            name: "front-door".into(),
            url: "rtsp://cam/front".into(),
            enabled: true,
            streaming_enabled: true,
            settings: StreamSettings::default(),
        };
        create(&db.conn(), &s).unwrap();
        let got = get(&db.conn(), "front-door").unwrap();
        assert_eq!(got.url, "rtsp://cam/front");
        assert_eq!(got.settings.retention_days, 30);
    }

    #[test]
    fn duplicate_name_rejected() {
        let db = testutil::TestDb::new();
        let s = Stream {
            name: "dup".into(),
            url: "rtsp://a".into(),
            enabled: true,
            streaming_enabled: true,
            settings: StreamSettings::default(),
        };
        create(&db.conn(), &s).unwrap();
        let e = create(&db.conn(), &s).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn delete_refuses_with_active_segments() {
        let db = testutil::TestDb::new();
        let s = Stream {
            name: "busy".into(),
            url: "rtsp://a".into(),
            enabled: true,
            streaming_enabled: true,
            settings: StreamSettings::default(),
        };
        create(&db.conn(), &s).unwrap();
        db.conn()
            .execute(
                "INSERT INTO segments (stream_name, path, container, start_ms, end_ms)
                 VALUES ('busy', '/x', 'mp4', 0, 1000)",
                [],
            )
            .unwrap();
        let e = delete(&db.conn(), "busy").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
    }
}
