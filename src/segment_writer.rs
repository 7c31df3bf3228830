// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Turns one stream's packet queue into HLS and MP4 segment files and
//! registers each sealed MP4 with the recording index (spec.md §4.4).
//! Runs on its own thread, one per stream, reading off the bounded
//! queue [`crate::router::PacketRouter`] built for it.

use crate::event_bus::{Event, EventBus};
use crate::h264;
use crate::hls_writer::{Playlist, TsSegmentWriter};
use crate::mp4_writer::Mp4Writer;
use crate::packet::{Packet, TrackKind};
use base::shutdown::Receiver as ShutdownReceiver;
use base::time::Time;
use base::{err, Error};
use db::segment::Container;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::error;

pub const DEFAULT_HLS_SEGMENT_DURATION_US: i64 = 4_000_000;
pub const DEFAULT_HLS_WINDOW: usize = 6;
pub const DEFAULT_MP4_SEGMENT_DURATION_US: i64 = 900_000_000;
pub const DEFAULT_MP4_SIZE_CAP_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct Config {
    pub hls_segment_duration_us: i64,
    pub hls_window: usize,
    pub mp4_segment_duration_us: i64,
    pub mp4_size_cap_bytes: u64,
    pub record_mp4_directly: bool,
    pub width_px: u16,
    pub height_px: u16,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            hls_segment_duration_us: DEFAULT_HLS_SEGMENT_DURATION_US,
            hls_window: DEFAULT_HLS_WINDOW,
            mp4_segment_duration_us: DEFAULT_MP4_SEGMENT_DURATION_US,
            mp4_size_cap_bytes: DEFAULT_MP4_SIZE_CAP_BYTES,
            record_mp4_directly: false,
            width_px: 1920,
            height_px: 1080,
        }
    }
}

/// Flag the motion-event machinery flips so the segment writer knows
/// whether to keep an MP4 open even when `record_mp4_directly` is off
/// (spec.md §4.4: "Only opened when ... a motion event is active").
pub type MotionActive = Arc<AtomicBool>;

struct HlsState {
    dir: PathBuf,
    writer: Option<TsSegmentWriter>,
    playlist: Playlist,
    segment_index: u64,
    segment_start_pts: i64,
    last_pts: i64,
    current_path: Option<PathBuf>,
}

struct Mp4State {
    dir_root: PathBuf,
    writer: Option<Mp4Writer>,
    segment_start_pts: i64,
    segment_start_unix_ms: i64,
}

pub struct SegmentWriter {
    stream_name: String,
    cfg: Config,
    db: Arc<Mutex<rusqlite::Connection>>,
    events: EventBus,
    rx: crossbeam_channel::Receiver<Packet>,
    shutdown: ShutdownReceiver,
    motion_active: MotionActive,

    hls: HlsState,
    mp4: Mp4State,
    pending_parameters: Option<(Vec<u8>, Vec<u8>)>,
    avc_scratch: Vec<u8>,
    stalled: bool,
}

impl SegmentWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_name: String,
        recordings_root: PathBuf,
        cfg: Config,
        db: Arc<Mutex<rusqlite::Connection>>,
        events: EventBus,
        rx: crossbeam_channel::Receiver<Packet>,
        shutdown: ShutdownReceiver,
        motion_active: MotionActive,
    ) -> Result<SegmentWriter, Error> {
        let hls_dir = recordings_root.join(&stream_name).join("hls");
        std::fs::create_dir_all(&hls_dir).map_err(|e| err!(Internal, "creating {hls_dir:?}: {e}"))?;
        let mp4_dir_root = recordings_root.join(&stream_name);
        std::fs::create_dir_all(&mp4_dir_root).map_err(|e| err!(Internal, "creating {mp4_dir_root:?}: {e}"))?;

        Ok(SegmentWriter {
            stream_name,
            hls: HlsState {
                playlist: Playlist::new(hls_dir.clone(), cfg.hls_window, (cfg.hls_segment_duration_us / 1_000_000) as u32),
                dir: hls_dir,
                writer: None,
                segment_index: 0,
                segment_start_pts: 0,
                last_pts: 0,
                current_path: None,
            },
            mp4: Mp4State { dir_root: mp4_dir_root, writer: None, segment_start_pts: 0, segment_start_unix_ms: 0 },
            cfg,
            db,
            events,
            rx,
            shutdown,
            motion_active,
            pending_parameters: None,
            avc_scratch: Vec::new(),
            stalled: false,
        })
    }

    /// Runs until the router side disconnects or shutdown is requested.
    /// Returns normally in both cases; per spec.md §4.4, no writer error
    /// is fatal, so this only returns `Err` for setup-time failures the
    /// caller already handled in `new`.
    pub fn run(mut self) -> Result<(), Error> {
        loop {
            if self.shutdown.check().is_err() {
                self.finish_all(true);
                return Ok(());
            }
            match self.rx.recv_timeout(Duration::from_millis(500)) {
                Ok(packet) => self.handle_packet(packet),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    self.finish_all(false);
                    return Ok(());
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        if packet.track != TrackKind::Video {
            return; // audio is best-effort and not muxed by either sub-writer yet.
        }

        // Back-pressure (spec.md §4.4): once the inbound queue is fully
        // saturated, drop non-keyframes until one arrives, rather than
        // let the backlog grow without bound or block the router.
        let saturated = self.rx.len() >= self.rx.capacity().unwrap_or(usize::MAX);
        if saturated && !packet.is_keyframe {
            self.stalled = true;
            return;
        }
        if self.stalled && packet.is_keyframe {
            self.stalled = false;
        }

        if let Some(params) = &packet.new_parameters {
            self.pending_parameters = Some(params.clone());
        }

        if packet.is_keyframe {
            self.maybe_rotate_hls(&packet);
            self.maybe_rotate_mp4(&packet);
        }

        if self.hls.writer.is_some() {
            self.push_hls(&packet);
        }
        let want_mp4 = self.cfg.record_mp4_directly || self.motion_active.load(Ordering::Relaxed);
        if want_mp4 && self.mp4.writer.is_some() {
            self.push_mp4(&packet);
        } else if !want_mp4 && self.mp4.writer.is_some() {
            self.seal_mp4();
        }
    }

    fn maybe_rotate_hls(&mut self, packet: &Packet) {
        let needs_rotation = match &self.hls.writer {
            None => true,
            Some(_) => {
                packet.new_parameters.is_some()
                    || packet.pts - self.hls.segment_start_pts >= self.cfg.hls_segment_duration_us
            }
        };
        if !needs_rotation {
            return;
        }
        if self.hls.writer.is_some() {
            self.seal_hls();
        }
        let path = self.hls.dir.join(format!("{}.ts", self.hls.segment_index));
        match TsSegmentWriter::create(&path) {
            Ok(w) => {
                self.hls.writer = Some(w);
                self.hls.current_path = Some(path);
                self.hls.segment_start_pts = packet.pts;
                self.hls.last_pts = packet.pts;
            }
            Err(e) => {
                error!(stream = %self.stream_name, error = %e, "failed to open HLS segment");
            }
        }
    }

    fn maybe_rotate_mp4(&mut self, packet: &Packet) {
        let want_mp4 = self.cfg.record_mp4_directly || self.motion_active.load(Ordering::Relaxed);
        if !want_mp4 {
            return;
        }
        let needs_rotation = match &self.mp4.writer {
            None => true,
            Some(w) => {
                packet.new_parameters.is_some()
                    || packet.pts - self.mp4.segment_start_pts >= self.cfg.mp4_segment_duration_us
                    || w.total_bytes() >= self.cfg.mp4_size_cap_bytes
            }
        };
        if !needs_rotation {
            return;
        }
        if self.mp4.writer.is_some() {
            self.seal_mp4();
        }
        let Some((sps, pps)) = self.pending_parameters.clone() else {
            // No parameter sets observed yet; can't build a sample entry.
            return;
        };
        let sample_entry = match h264::build_sample_entry(&sps, &pps, self.cfg.width_px, self.cfg.height_px) {
            Ok(e) => e,
            Err(e) => {
                error!(stream = %self.stream_name, error = %e, "failed to build sample entry");
                return;
            }
        };
        let start_unix_ms = Time::now().unix_millis();
        let day_dir = match Time::from_unix_millis(start_unix_ms).day_key() {
            Ok(d) => self.mp4.dir_root.join(d),
            Err(e) => {
                error!(stream = %self.stream_name, error = %e, "failed to compute day directory");
                return;
            }
        };
        if let Err(e) = std::fs::create_dir_all(&day_dir) {
            error!(stream = %self.stream_name, error = %e, "failed to create day directory");
            return;
        }
        match Mp4Writer::create(&day_dir, start_unix_ms, sample_entry) {
            Ok(w) => {
                self.mp4.writer = Some(w);
                self.mp4.segment_start_pts = packet.pts;
                self.mp4.segment_start_unix_ms = start_unix_ms;
            }
            Err(e) => error!(stream = %self.stream_name, error = %e, "failed to open MP4 segment"),
        }
    }

    fn push_hls(&mut self, packet: &Packet) {
        let Some(writer) = self.hls.writer.as_mut() else { return };
        if let Err(e) = writer.push_sample(&packet.data, packet.pts, packet.dts, packet.is_keyframe) {
            error!(stream = %self.stream_name, error = %e, "HLS write failed, segment marked corrupt");
            let writer = self.hls.writer.take().unwrap();
            if let Some(path) = self.hls.current_path.take() {
                writer.abort_to_corrupt(&path);
            }
            return;
        }
        self.hls.last_pts = packet.pts;
    }

    fn push_mp4(&mut self, packet: &Packet) {
        if h264::annex_b_to_avc(&packet.data, &mut self.avc_scratch).is_err() {
            return;
        }
        let Some(writer) = self.mp4.writer.as_mut() else { return };
        let res = writer.push_sample(&self.avc_scratch, packet.pts, packet.dts, packet.duration_us, packet.is_keyframe);
        if let Err(e) = res {
            error!(stream = %self.stream_name, error = %e, "MP4 write failed, segment marked corrupt");
            if let Some(writer) = self.mp4.writer.take() {
                writer.abort_to_corrupt();
            }
        }
    }

    fn seal_hls(&mut self) {
        let Some(writer) = self.hls.writer.take() else { return };
        let Some(path) = self.hls.current_path.take() else { return };
        let actual_pts_span = self.hls.last_pts - self.hls.segment_start_pts;
        match writer.finish() {
            Ok(_bytes) => {
                let duration_s = actual_pts_span.max(0) as f64 / 1_000_000.0;
                let filename = path.file_name().unwrap().to_string_lossy().to_string();
                if let Err(e) = self.hls.playlist.push_segment(filename, duration_s) {
                    error!(stream = %self.stream_name, error = %e, "failed to update HLS playlist");
                }
                self.hls.segment_index += 1;
            }
            Err(e) => {
                error!(stream = %self.stream_name, error = %e, "failed to finish HLS segment");
                let _ = std::fs::rename(&path, path.with_extension("ts.corrupt"));
            }
        }
    }

    fn seal_mp4(&mut self) {
        let Some(writer) = self.mp4.writer.take() else { return };
        let start = Time::from_unix_millis(self.mp4.segment_start_unix_ms);
        match writer.seal() {
            Ok(sealed) => {
                let end = Time::now();
                let path_str = sealed.path.to_string_lossy().to_string();
                let conn = self.db.lock().unwrap();
                match db::segment::insert(
                    &conn,
                    &self.stream_name,
                    &path_str,
                    Container::Mp4,
                    start,
                    end,
                    sealed.size_bytes as i64,
                    sealed.frame_count as i64,
                ) {
                    Ok(id) => {
                        if self.motion_active.load(Ordering::Relaxed) {
                            // Link to whichever event is open for this
                            // stream so it carries the full set of
                            // segments it spans (spec.md §3 MotionEvent).
                            match db::motion::open_events(&conn, &self.stream_name) {
                                Ok(open) => {
                                    if let Some(event) = open.first() {
                                        if let Err(e) = db::motion::link_segment(&conn, event.id, id) {
                                            error!(stream = %self.stream_name, error = %e, "failed to link segment to motion event");
                                        }
                                    }
                                }
                                Err(e) => error!(stream = %self.stream_name, error = %e, "failed to look up open motion events"),
                            }
                        }
                        drop(conn);
                        self.events.publish(Event::SegmentSealed {
                            stream_name: self.stream_name.clone(),
                            segment_id: id,
                            start,
                            end,
                        });
                    }
                    Err(e) => error!(stream = %self.stream_name, error = %e, "failed to register sealed segment"),
                }
            }
            Err(e) => {
                error!(stream = %self.stream_name, error = %e, "failed to seal MP4 segment");
            }
        }
    }

    fn finish_all(&mut self, partial: bool) {
        if let Some(writer) = self.hls.writer.take() {
            if partial {
                if let Some(path) = self.hls.current_path.take() {
                    let _ = writer.finish();
                    let _ = std::fs::rename(&path, path.with_extension("ts.partial"));
                }
            } else {
                self.hls.writer = Some(writer);
                self.seal_hls();
            }
        }
        if self.mp4.writer.is_some() {
            if partial {
                if let Some(writer) = self.mp4.writer.take() {
                    writer.abort_to_corrupt();
                }
            } else {
                self.seal_mp4();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TrackKind;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn open_test_db() -> rusqlite::Connection {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::migrate::upgrade(&mut conn).unwrap();
        conn.execute("INSERT INTO streams (name, url) VALUES ('cam1', 'rtsp://x')", []).unwrap();
        conn
    }

    #[rustfmt::skip]
    const ANNEX_B_KEYFRAME: [u8; 35] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x4d, 0x00, 0x1f,
        0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
        0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
        0x1d, 0x4c, 0x01, 0x00, 0x00, 0x00, 0x01, 0x68,
        0xee, 0x3c, 0x80,
    ];

    fn keyframe_packet(pts: i64, with_parameters: bool) -> Packet {
        let new_parameters = if with_parameters {
            h264::extract_parameter_sets(&ANNEX_B_KEYFRAME)
        } else {
            None
        };
        Packet {
            stream_name: "cam1".to_string(),
            data: Bytes::from_static(&ANNEX_B_KEYFRAME),
            pts,
            dts: pts,
            duration_us: 33_333,
            is_keyframe: true,
            track: TrackKind::Video,
            new_parameters,
        }
    }

    fn new_writer(dir: &std::path::Path, cfg: Config, motion_active: bool) -> (SegmentWriter, crossbeam_channel::Sender<Packet>, base::shutdown::Sender) {
        let (tx, rx) = crossbeam_channel::bounded(16);
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let conn = open_test_db();
        let w = SegmentWriter::new(
            "cam1".to_string(),
            dir.to_path_buf(),
            cfg,
            Arc::new(Mutex::new(conn)),
            EventBus::new(),
            rx,
            shutdown_rx,
            Arc::new(AtomicBool::new(motion_active)),
        )
        .unwrap();
        (w, tx, shutdown_tx)
    }

    #[test]
    fn opens_hls_segment_on_first_keyframe() {
        let dir = tempdir().unwrap();
        let (mut w, _tx, _shutdown) = new_writer(dir.path(), Config::default(), false);
        w.handle_packet(keyframe_packet(0, true));
        assert!(w.hls.writer.is_some());
    }

    #[test]
    fn mp4_not_opened_without_record_mp4_directly_or_motion() {
        let dir = tempdir().unwrap();
        let (mut w, _tx, _shutdown) = new_writer(dir.path(), Config::default(), false);
        w.handle_packet(keyframe_packet(0, true));
        assert!(w.mp4.writer.is_none());
    }

    #[test]
    fn mp4_opens_once_motion_active_and_parameters_known() {
        let dir = tempdir().unwrap();
        let (mut w, _tx, _shutdown) = new_writer(dir.path(), Config::default(), true);
        w.handle_packet(keyframe_packet(0, true));
        assert!(w.mp4.writer.is_some());
    }

    #[test]
    fn sealing_mp4_registers_a_segment_row() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.mp4_segment_duration_us = 1; // force rotation on the very next keyframe
        let (mut w, _tx, _shutdown) = new_writer(dir.path(), cfg, true);
        w.handle_packet(keyframe_packet(0, true));
        w.handle_packet(keyframe_packet(1_000_000, false));
        let conn = w.db.clone();
        let conn = conn.lock().unwrap();
        let total = db::segment::total_bytes_used(&conn).unwrap();
        assert!(total > 0);
    }

    #[test]
    fn sealing_mp4_links_segment_to_open_motion_event() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.mp4_segment_duration_us = 1;
        let (mut w, _tx, _shutdown) = new_writer(dir.path(), cfg, true);
        let event_id = {
            let conn = w.db.lock().unwrap();
            db::motion::start(&conn, "cam1", base::time::Time::from_unix_millis(0), db::motion::Source::Manual).unwrap()
        };
        w.handle_packet(keyframe_packet(0, true));
        w.handle_packet(keyframe_packet(1_000_000, false));
        let conn = w.db.clone();
        let conn = conn.lock().unwrap();
        let event = db::motion::get(&conn, event_id).unwrap();
        assert_eq!(event.segment_ids.len(), 1);
    }
}
