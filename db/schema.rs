// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! DDL for the embedded recording-metadata database, plus the ordered,
//! idempotent migration scripts that bring an older database up to
//! `CURRENT_VERSION` (see [`crate::migrate`]).

pub const CURRENT_VERSION: i32 = 2;

/// `v0 -> v1`: initial schema. Mirrors the table list in the external
/// interfaces (`streams`, `segments`, `motion_events`, `users`,
/// `schema_version`), plus `settings` and `detection_results`, which are
/// owned by the core but primarily read/written by the (out-of-scope) web
/// and detection layers.
pub const V0_TO_V1: &str = r#"
CREATE TABLE streams (
    name                TEXT PRIMARY KEY CHECK (length(name) <= 63),
    url                 TEXT NOT NULL,
    enabled             INTEGER NOT NULL DEFAULT 1,
    streaming_enabled   INTEGER NOT NULL DEFAULT 1,
    settings_json       TEXT NOT NULL DEFAULT '{}'
) STRICT;

CREATE TABLE segments (
    id                  INTEGER PRIMARY KEY,
    stream_name         TEXT NOT NULL REFERENCES streams (name),
    path                TEXT NOT NULL,
    container           TEXT NOT NULL CHECK (container IN ('ts', 'mp4')),
    start_ms            INTEGER NOT NULL,
    end_ms              INTEGER NOT NULL,
    size_bytes          INTEGER NOT NULL DEFAULT 0,
    frame_count         INTEGER NOT NULL DEFAULT 0,
    has_detection       INTEGER NOT NULL DEFAULT 0,
    thumbnail_generated INTEGER NOT NULL DEFAULT 0,
    state               TEXT NOT NULL CHECK (state IN ('active', 'deleted')) DEFAULT 'active',
    CHECK (start_ms <= end_ms),
    UNIQUE (stream_name, start_ms)
) STRICT;

CREATE INDEX segments_stream_end_idx ON segments (stream_name, end_ms);
CREATE INDEX segments_end_idx ON segments (end_ms);

CREATE TABLE motion_events (
    id                  INTEGER PRIMARY KEY,
    stream_name         TEXT NOT NULL REFERENCES streams (name),
    start_ms            INTEGER NOT NULL,
    end_ms              INTEGER,
    source              TEXT NOT NULL CHECK (source IN ('onvif', 'analytic', 'manual')),
    segment_ids_json    TEXT NOT NULL DEFAULT '[]'
) STRICT;

CREATE INDEX motion_events_stream_idx ON motion_events (stream_name, start_ms);

CREATE TABLE users (
    id                  INTEGER PRIMARY KEY,
    username            TEXT UNIQUE NOT NULL,
    password_hash       TEXT NOT NULL,
    role                TEXT NOT NULL DEFAULT 'viewer'
) STRICT;

CREATE TABLE settings (
    key                 TEXT PRIMARY KEY,
    value               TEXT NOT NULL
) STRICT;

CREATE TABLE schema_version (
    version             INTEGER NOT NULL
) STRICT;
INSERT INTO schema_version (version) VALUES (1);
"#;

/// `v1 -> v2`: adds the detection-result ring, fed by the (out-of-scope)
/// inference pipeline. Kept capped at `detection::RING_CAPACITY` rows per
/// stream by `detection::prune`.
pub const V1_TO_V2: &str = r#"
CREATE TABLE detection_results (
    id                  INTEGER PRIMARY KEY,
    stream_name         TEXT NOT NULL REFERENCES streams (name),
    time_ms             INTEGER NOT NULL,
    label               TEXT NOT NULL,
    confidence          REAL NOT NULL,
    bbox_json           TEXT
) STRICT;

CREATE INDEX detection_results_stream_idx ON detection_results (stream_name, time_ms);

UPDATE schema_version SET version = 2;
"#;

pub const MIGRATIONS: &[(i32, &str)] = &[(1, V0_TO_V1), (2, V1_TO_V2)];
