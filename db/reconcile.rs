// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Startup reconciliation between the `segments` table and the recordings
//! directory tree. A process that died mid-write can leave either side
//! ahead of the other: a sealed file with no row (crash between rename
//! and insert), or a row with no file (crash between unlink and delete).
//! Both are resolved in favor of the filesystem never claiming to have
//! something it doesn't, and the index never dangling.

use crate::segment::{self, Container};
use base::time::Time;
use base::{err, Error};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// DB rows whose backing file was missing; marked deleted.
    pub rows_orphaned: u64,
    /// Files on disk with no DB row that reconciliation resolved: a
    /// re-registered `.mp4` or a removed `.ts`. Unreadable `.mp4` files
    /// renamed `.corrupt` are logged but not counted here, since nothing
    /// was reconciled into the index for them.
    pub files_orphaned: u64,
}

fn is_recording_file(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("ts") | Some("mp4"))
}

fn walk_recording_files(root: &Path, out: &mut HashSet<std::path::PathBuf>) -> Result<(), Error> {
    if !root.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_recording_files(&path, out)?;
        } else if file_type.is_file() && is_recording_file(&path) {
            out.insert(path);
        }
    }
    Ok(())
}

/// Runs a full two-way reconciliation. Call once at startup, before
/// accepting new segments, so the retention GC's byte-accounting starts
/// from truth.
pub fn reconcile(conn: &rusqlite::Connection, recordings_root: &Path) -> Result<ReconcileReport, Error> {
    let mut report = ReconcileReport::default();
    let mut files_on_disk = HashSet::new();
    walk_recording_files(recordings_root, &mut files_on_disk)?;

    let mut stmt = conn.prepare("SELECT id, path FROM segments WHERE state = 'active'")?;
    let rows: Vec<(i64, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    for (id, path) in rows {
        let path = std::path::PathBuf::from(&path);
        if files_on_disk.remove(&path) {
            continue; // present on both sides.
        }
        warn!(id, path = %path.display(), "segment row has no backing file, marking deleted");
        segment::mark_deleted(conn, id)?;
        report.rows_orphaned += 1;
    }

    // Whatever's left in `files_on_disk` has no row. `.mp4` files are
    // archival (spec.md §4.5 step 2): the only way one got sealed without
    // a row is a crash between rename and insert, so it's probed for
    // duration/frame count and registered rather than discarded (spec.md
    // §8 scenario 4). `.ts` files are HLS's ephemeral live-view segments,
    // never registered by design, so they're always safe to remove.
    for path in files_on_disk {
        if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
            warn!(path = %path.display(), "recording file has no segment row, removing");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove orphan file");
                continue;
            }
            report.files_orphaned += 1;
            continue;
        }
        match register_orphan_mp4(conn, recordings_root, &path) {
            Ok(()) => {
                info!(path = %path.display(), "registered orphan mp4 found by reconciliation");
                report.files_orphaned += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "orphan mp4 unreadable, renaming .corrupt");
                let corrupt_path = path.with_extension("mp4.corrupt");
                if let Err(e) = std::fs::rename(&path, &corrupt_path) {
                    warn!(path = %path.display(), error = %e, "failed to rename orphan to .corrupt");
                }
            }
        }
    }

    info!(
        rows_orphaned = report.rows_orphaned,
        files_orphaned = report.files_orphaned,
        "reconciliation complete"
    );
    Ok(report)
}

/// Re-registers one `.mp4` file reconciliation found with no `segments`
/// row: probes it for duration/frame count (spec.md §4.5 step 2, §8
/// scenario 4) and inserts it under the stream named by its first path
/// component relative to `recordings_root` (`src/segment_writer.rs`'s
/// `{recordings_root}/{stream_name}/{day}/{start_ms}.mp4` layout). Errs
/// if the file can't be parsed as MP4, or its owning stream no longer
/// exists (a `segments.stream_name` foreign-key failure, meaning the
/// file was orphaned by a deleted stream rather than a crash).
fn register_orphan_mp4(conn: &rusqlite::Connection, recordings_root: &Path, path: &Path) -> Result<(), Error> {
    let stream_name = path
        .strip_prefix(recordings_root)
        .ok()
        .and_then(|rel| rel.components().next())
        .and_then(|c| c.as_os_str().to_str())
        .ok_or_else(|| err!(InvalidArgument, "{path:?}: can't determine owning stream from path"))?
        .to_string();

    let start_unix_ms = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| err!(InvalidArgument, "{path:?}: filename isn't a start-time timestamp"))?;

    let (duration_us, frame_count) = probe_mp4(path)?;
    let size_bytes = std::fs::metadata(path).map_err(|e| err!(Unavailable, "stat {path:?}: {e}"))?.len() as i64;
    let start = Time::from_unix_millis(start_unix_ms);
    let end = Time::from_unix_millis(start_unix_ms + duration_us / 1000);
    let path_str = path.to_str().ok_or_else(|| err!(InvalidArgument, "{path:?}: non-utf8 path"))?;

    segment::insert(conn, &stream_name, path_str, Container::Mp4, start, end, size_bytes, frame_count as i64)?;
    Ok(())
}

/// Minimal ISO-BMFF box walk that recovers just what reconciliation needs
/// to re-register an orphan file: `moov/mvhd`'s duration and the summed
/// `moof/traf/trun` sample counts. Not a general-purpose parser — it
/// understands exactly the box shapes `src/mp4_writer.rs` writes, and
/// gives up rather than guessing on anything else, including a file
/// truncated mid-box by a power cut.
fn probe_mp4(path: &Path) -> Result<(i64, u32), Error> {
    let data = std::fs::read(path).map_err(|e| err!(Unavailable, "reading {path:?}: {e}"))?;
    let mut duration_us = None;
    let mut frame_count = 0u32;
    for (kind, payload) in top_level_boxes(&data) {
        if kind == *b"moov" {
            for (ck, cp) in top_level_boxes(payload) {
                if ck == *b"mvhd" && cp.len() >= 20 && cp[0] == 0 {
                    let timescale = u32::from_be_bytes(cp[12..16].try_into().unwrap()) as u64;
                    let units = u32::from_be_bytes(cp[16..20].try_into().unwrap()) as u64;
                    if timescale > 0 {
                        duration_us = Some((units * 1_000_000 / timescale) as i64);
                    }
                }
            }
        } else if kind == *b"moof" {
            for (ck, cp) in top_level_boxes(payload) {
                if ck == *b"traf" {
                    for (gk, gp) in top_level_boxes(cp) {
                        if gk == *b"trun" && gp.len() >= 8 {
                            frame_count += u32::from_be_bytes(gp[4..8].try_into().unwrap());
                        }
                    }
                }
            }
        }
    }
    duration_us
        .map(|us| (us, frame_count))
        .ok_or_else(|| err!(DataLoss, "{path:?}: no valid moov/mvhd box found"))
}

/// Walks sibling boxes at one nesting level, yielding `(four_cc, payload)`
/// pairs with the 8-byte size+type header stripped. Stops silently at the
/// first malformed or truncated box rather than erroring, since a
/// power-cut mid-write leaves exactly that behind.
fn top_level_boxes(data: &[u8]) -> Vec<([u8; 4], &[u8])> {
    let mut boxes = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        if size < 8 || pos + size > data.len() {
            break;
        }
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&data[pos + 4..pos + 8]);
        boxes.push((kind, &data[pos + 8..pos + size]));
        pos += size;
    }
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Container;
    use crate::testutil;
    use base::time::Time;

    #[test]
    fn orphan_row_is_marked_deleted() {
        let db = testutil::TestDb::new();
        db.conn().execute("INSERT INTO streams (name, url) VALUES ('cam1', 'rtsp://x')", []).unwrap();
        let dir = tempfile::tempdir().unwrap();
        segment::insert(
            &db.conn(),
            "cam1",
            dir.path().join("missing.mp4").to_str().unwrap(),
            Container::Mp4,
            Time::from_unix_millis(0),
            Time::from_unix_millis(1000),
            10,
            1,
        )
        .unwrap();

        let report = reconcile(&db.conn(), dir.path()).unwrap();
        assert_eq!(report.rows_orphaned, 1);
        assert_eq!(report.files_orphaned, 0);
    }

    #[test]
    fn orphan_ts_file_is_removed() {
        let db = testutil::TestDb::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stray.ts");
        std::fs::write(&path, b"data").unwrap();

        let report = reconcile(&db.conn(), dir.path()).unwrap();
        assert_eq!(report.files_orphaned, 1);
        assert!(!path.exists());
    }

    fn bmff_box(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
        b.extend_from_slice(kind);
        b.extend_from_slice(body);
        b
    }

    /// Builds just enough of a fragmented MP4 (`moov/mvhd` +
    /// `moof/traf/trun`) for [`probe_mp4`] to recover a duration and
    /// sample count, without depending on the root crate's real writer.
    fn minimal_test_mp4(timescale: u32, duration_units: u32, sample_count: u32) -> Vec<u8> {
        let mut mvhd_body = vec![0u8; 12];
        mvhd_body.extend_from_slice(&timescale.to_be_bytes());
        mvhd_body.extend_from_slice(&duration_units.to_be_bytes());
        let moov = bmff_box(b"moov", &bmff_box(b"mvhd", &mvhd_body));

        let mut trun_body = vec![0u8; 4];
        trun_body.extend_from_slice(&sample_count.to_be_bytes());
        let traf = bmff_box(b"traf", &bmff_box(b"trun", &trun_body));
        let moof = bmff_box(b"moof", &traf);

        let mut out = moov;
        out.extend_from_slice(&moof);
        out
    }

    #[test]
    fn orphan_mp4_is_probed_and_registered() {
        let db = testutil::TestDb::new();
        db.conn().execute("INSERT INTO streams (name, url) VALUES ('cam1', 'rtsp://x')", []).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join("cam1");
        std::fs::create_dir_all(&stream_dir).unwrap();
        let path = stream_dir.join("1000.mp4");
        std::fs::write(&path, minimal_test_mp4(1_000_000, 5_000_000, 150)).unwrap();

        let report = reconcile(&db.conn(), dir.path()).unwrap();
        assert_eq!(report.files_orphaned, 1);
        assert_eq!(report.rows_orphaned, 0);
        assert!(path.exists());

        let segments = segment::query(
            &db.conn(),
            "cam1",
            Time::from_unix_millis(0),
            Time::from_unix_millis(100_000),
        )
        .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start.unix_millis(), 1000);
        assert_eq!(segments[0].end.unix_millis(), 6000);
        assert_eq!(segments[0].frame_count, 150);
    }

    #[test]
    fn orphan_mp4_with_no_valid_moov_is_renamed_corrupt() {
        let db = testutil::TestDb::new();
        db.conn().execute("INSERT INTO streams (name, url) VALUES ('cam1', 'rtsp://x')", []).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join("cam1");
        std::fs::create_dir_all(&stream_dir).unwrap();
        let path = stream_dir.join("1000.mp4");
        std::fs::write(&path, b"not an mp4 file").unwrap();

        let report = reconcile(&db.conn(), dir.path()).unwrap();
        assert_eq!(report.files_orphaned, 0);
        assert!(!path.exists());
        assert!(stream_dir.join("1000.mp4.corrupt").exists());
    }

    #[test]
    fn matching_row_and_file_are_untouched() {
        let db = testutil::TestDb::new();
        db.conn().execute("INSERT INTO streams (name, url) VALUES ('cam1', 'rtsp://x')", []).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.mp4");
        std::fs::write(&path, b"data").unwrap();
        segment::insert(
            &db.conn(),
            "cam1",
            path.to_str().unwrap(),
            Container::Mp4,
            Time::from_unix_millis(0),
            Time::from_unix_millis(1000),
            4,
            1,
        )
        .unwrap();

        let report = reconcile(&db.conn(), dir.path()).unwrap();
        assert_eq!(report.rows_orphaned, 0);
        assert_eq!(report.files_orphaned, 0);
        assert!(path.exists());
    }
}
