// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Live HLS output (spec.md §4.4): MPEG-TS segments plus a rolling
//! `.m3u8` playlist, written directly rather than by re-wrapping an MP4
//! sample store. The packetizer here is built against the MPEG-TS/HLS
//! specifications spec.md §6 names — one muxer per live segment, one
//! playlist writer per stream.

use base::{err, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const TS_PACKET_LEN: usize = 188;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const PCR_PID: u16 = VIDEO_PID;

/// Converts a microsecond timestamp to the 90kHz clock MPEG-TS/PES use,
/// truncated to 33 bits as the wire format requires.
fn to_90k(us: i64) -> u64 {
    ((us as i128 * 90 / 1000) as u64) & 0x1_ffff_ffff
}

/// One MPEG-TS segment file, corresponding to one HLS playlist entry.
/// PAT/PMT are repeated at the start of every segment so a player can
/// tune in without seeing earlier segments.
pub struct TsSegmentWriter {
    file: File,
    video_continuity: u8,
    pat_pmt_continuity: (u8, u8),
    wrote_pcr: bool,
    bytes_written: u64,
}

impl TsSegmentWriter {
    pub fn create(path: &Path) -> Result<TsSegmentWriter, Error> {
        let mut w = TsSegmentWriter {
            file: File::create(path).map_err(|e| err!(Internal, "creating {path:?}: {e}"))?,
            video_continuity: 0,
            pat_pmt_continuity: (0, 0),
            wrote_pcr: false,
            bytes_written: 0,
        };
        w.write_pat()?;
        w.write_pmt()?;
        Ok(w)
    }

    fn write_packet(&mut self, packet: &[u8; TS_PACKET_LEN]) -> Result<(), Error> {
        self.file.write_all(packet).map_err(|e| err!(Internal, "writing ts packet: {e}"))?;
        self.bytes_written += TS_PACKET_LEN as u64;
        Ok(())
    }

    fn write_pat(&mut self) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(16);
        payload.push(0); // pointer_field
        payload.push(0x00); // table_id: PAT
        let section_start = payload.len();
        payload.write_u16::<BigEndian>(0xb000).unwrap(); // section_syntax + length placeholder (patched below)
        payload.write_u16::<BigEndian>(1).unwrap(); // transport_stream_id
        payload.push(0xc1); // version 0, current_next
        payload.push(0); // section_number
        payload.push(0); // last_section_number
        payload.write_u16::<BigEndian>(1).unwrap(); // program_number
        payload.write_u16::<BigEndian>(0xe000 | PMT_PID).unwrap();
        let section_len = payload.len() - section_start - 2 + 4; // + CRC32
        BigEndian::write_u16(&mut payload[section_start..section_start + 2], 0xb000 | section_len as u16);
        let crc = crc32_mpeg2(&payload[section_start..]);
        payload.write_u32::<BigEndian>(crc).unwrap();
        let cc = self.pat_pmt_continuity.0;
        self.pat_pmt_continuity.0 = cc.wrapping_add(1) & 0x0f;
        let packet = pack_section(PAT_PID, cc, &payload);
        self.write_packet(&packet)
    }

    fn write_pmt(&mut self) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(24);
        payload.push(0); // pointer_field
        payload.push(0x02); // table_id: PMT
        let section_start = payload.len();
        payload.write_u16::<BigEndian>(0xb000).unwrap(); // placeholder
        payload.write_u16::<BigEndian>(1).unwrap(); // program_number
        payload.push(0xc1);
        payload.push(0);
        payload.push(0);
        payload.write_u16::<BigEndian>(0xe000 | PCR_PID).unwrap();
        payload.write_u16::<BigEndian>(0xf000).unwrap(); // program_info_length = 0
        payload.push(0x1b); // stream_type: H.264 video
        payload.write_u16::<BigEndian>(0xe000 | VIDEO_PID).unwrap();
        payload.write_u16::<BigEndian>(0xf000).unwrap(); // ES_info_length = 0
        let section_len = payload.len() - section_start - 2 + 4;
        BigEndian::write_u16(&mut payload[section_start..section_start + 2], 0xb000 | section_len as u16);
        let crc = crc32_mpeg2(&payload[section_start..]);
        payload.write_u32::<BigEndian>(crc).unwrap();
        let cc = self.pat_pmt_continuity.1;
        self.pat_pmt_continuity.1 = cc.wrapping_add(1) & 0x0f;
        let packet = pack_section(PMT_PID, cc, &payload);
        self.write_packet(&packet)
    }

    /// Packetizes one Annex B access unit into a PES then into 188-byte
    /// TS packets. `data` is Annex B (start-code delimited), the form
    /// `ingest` hands packets in; this writer does not rewrite it to
    /// AVC length-prefixed form the way `mp4_writer` does, since MPEG-TS
    /// elementary streams use Annex B by convention.
    pub fn push_sample(
        &mut self,
        data: &[u8],
        pts_us: i64,
        dts_us: i64,
        is_keyframe: bool,
    ) -> Result<(), Error> {
        let mut pes = Vec::with_capacity(data.len() + 32);
        pes.extend_from_slice(&[0x00, 0x00, 0x01, 0xe0]); // start code + stream_id
        pes.write_u16::<BigEndian>(0).unwrap(); // PES_packet_length: 0 = unbounded (video)
        pes.push(0x80); // marker bits + no scrambling
        let has_dts = dts_us != pts_us;
        pes.push(if has_dts { 0xc0 } else { 0x80}); // PTS (+DTS) flags
        pes.push(if has_dts { 10 } else { 5 }); // PES header data length
        write_pts_dts(&mut pes, 0x2, to_90k(pts_us));
        if has_dts {
            write_pts_dts(&mut pes, 0x1, to_90k(dts_us));
        }
        pes.extend_from_slice(data);

        let pcr = if is_keyframe || !self.wrote_pcr { Some(to_90k(dts_us) * 300) } else { None };
        self.wrote_pcr = true;
        self.write_pes_as_ts(&pes, pcr)
    }

    fn write_pes_as_ts(&mut self, pes: &[u8], pcr_27m: Option<u64>) -> Result<(), Error> {
        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            let cc = self.video_continuity;
            self.video_continuity = cc.wrapping_add(1) & 0x0f;
            let mut packet = [0xffu8; TS_PACKET_LEN];
            packet[0] = 0x47;
            let pusi = if first { 0x40 } else { 0x00 };
            BigEndian::write_u16(&mut packet[1..3], pusi | VIDEO_PID);

            let want_adaptation = first && pcr_27m.is_some();
            let mut header_len = 4;
            if want_adaptation {
                packet[3] = 0x30 | cc; // adaptation field + payload present
                let pcr = pcr_27m.unwrap();
                packet[4] = 7; // adaptation_field_length
                packet[5] = 0x10; // PCR_flag
                write_pcr(&mut packet[6..12], pcr);
                header_len = 12;
            } else {
                packet[3] = 0x10 | cc; // payload only
            }

            let remaining = pes.len() - offset;
            let space = TS_PACKET_LEN - header_len;
            if remaining < space {
                // Last packet: stuff with an adaptation field so the
                // packet is still exactly 188 bytes (spec.md §6 wire
                // format; a short final packet would desync readers).
                let stuff_len = space - remaining;
                if want_adaptation {
                    // Already has an adaptation field; grow it.
                    packet[4] += stuff_len as u8;
                    for b in &mut packet[12..12 + stuff_len] {
                        *b = 0xff;
                    }
                    packet[header_len + stuff_len..header_len + stuff_len + remaining]
                        .copy_from_slice(&pes[offset..offset + remaining]);
                } else if stuff_len >= 1 {
                    packet[3] = 0x30 | cc;
                    let af_len = stuff_len - 1;
                    packet[4] = af_len as u8;
                    if af_len > 0 {
                        packet[5] = 0x00;
                        for b in &mut packet[6..6 + af_len - 1] {
                            *b = 0xff;
                        }
                    }
                    let new_header_len = 4 + 1 + af_len;
                    packet[new_header_len..new_header_len + remaining]
                        .copy_from_slice(&pes[offset..offset + remaining]);
                } else {
                    packet[header_len..header_len + remaining].copy_from_slice(&pes[offset..offset + remaining]);
                }
                self.write_packet(&packet)?;
                offset += remaining;
            } else {
                packet[header_len..header_len + space].copy_from_slice(&pes[offset..offset + space]);
                self.write_packet(&packet)?;
                offset += space;
            }
            first = false;
        }
        Ok(())
    }

    /// Flushes and returns the final size; the file stays at its final
    /// path throughout (HLS segments are never partially visible to a
    /// player because the playlist is only updated afterward).
    pub fn finish(mut self) -> Result<u64, Error> {
        self.file.flush().map_err(|e| err!(Internal, "flushing ts segment: {e}"))?;
        Ok(self.bytes_written)
    }

    /// Abandons this segment after a write error, renaming it `.corrupt`
    /// instead of leaving a partial `.ts` file the playlist might later
    /// reference (it never will, since it's only added on a successful
    /// `finish`, but a stray partial file would otherwise sit there).
    pub fn abort_to_corrupt(self, path: &Path) -> Option<PathBuf> {
        drop(self.file);
        let corrupt_path = path.with_extension("ts.corrupt");
        std::fs::rename(path, &corrupt_path).ok().map(|_| corrupt_path)
    }
}

fn write_pts_dts(out: &mut Vec<u8>, prefix: u8, ticks: u64) {
    let t = ticks & 0x1_ffff_ffff;
    out.push((prefix << 4) | (((t >> 30) & 0x7) as u8) << 1 | 1);
    out.push(((t >> 22) & 0xff) as u8);
    out.push((((t >> 15) & 0x7f) as u8) << 1 | 1);
    out.push(((t >> 7) & 0xff) as u8);
    out.push(((t & 0x7f) as u8) << 1 | 1);
}

fn write_pcr(out: &mut [u8], pcr_27m: u64) {
    let base = (pcr_27m / 300) & 0x1_ffff_ffff;
    let ext = (pcr_27m % 300) & 0x1ff;
    out[0] = ((base >> 25) & 0xff) as u8;
    out[1] = ((base >> 17) & 0xff) as u8;
    out[2] = ((base >> 9) & 0xff) as u8;
    out[3] = ((base >> 1) & 0xff) as u8;
    out[4] = (((base & 1) as u8) << 7) | 0x7e | (((ext >> 8) & 1) as u8);
    out[5] = (ext & 0xff) as u8;
}

fn pack_section(pid: u16, continuity: u8, payload: &[u8]) -> [u8; TS_PACKET_LEN] {
    let mut packet = [0xffu8; TS_PACKET_LEN];
    packet[0] = 0x47;
    BigEndian::write_u16(&mut packet[1..3], 0x4000 | pid); // PUSI
    packet[3] = 0x10 | continuity;
    let n = payload.len().min(TS_PACKET_LEN - 4);
    packet[4..4 + n].copy_from_slice(&payload[..n]);
    packet
}

/// CRC-32/MPEG-2, used by PAT/PMT section trailers.
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04c1_1db7 } else { crc << 1 };
        }
    }
    crc
}

struct PlaylistEntry {
    filename: String,
    duration_s: f64,
}

/// Rolling `.m3u8` window for one stream's live view (spec.md §4.4:
/// "default 6 segments, 4 s each"). Segments that fall out of the
/// window are unlinked since HLS segments aren't registered in the
/// index and have no other owner.
pub struct Playlist {
    dir: PathBuf,
    window: VecDeque<PlaylistEntry>,
    max_window: usize,
    target_duration_s: u32,
    media_sequence: u64,
}

impl Playlist {
    pub fn new(dir: PathBuf, max_window: usize, target_duration_s: u32) -> Playlist {
        Playlist { dir, window: VecDeque::new(), max_window, target_duration_s, media_sequence: 0 }
    }

    /// Adds a newly sealed segment and rewrites the playlist file
    /// write-to-temp-then-rename, so a concurrent reader never observes
    /// a truncated file (spec.md §4.4).
    pub fn push_segment(&mut self, filename: String, duration_s: f64) -> Result<(), Error> {
        self.window.push_back(PlaylistEntry { filename, duration_s });
        while self.window.len() > self.max_window {
            let evicted = self.window.pop_front().unwrap();
            self.media_sequence += 1;
            let _ = std::fs::remove_file(self.dir.join(&evicted.filename));
        }
        self.write()
    }

    fn write(&self) -> Result<(), Error> {
        let mut body = String::new();
        body.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
        body.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration_s));
        body.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));
        for e in &self.window {
            body.push_str(&format!("#EXTINF:{:.3},\n{}\n", e.duration_s, e.filename));
        }
        let tmp_path = self.dir.join("index.m3u8.tmp");
        let final_path = self.dir.join("index.m3u8");
        std::fs::write(&tmp_path, body.as_bytes())
            .map_err(|e| err!(Internal, "writing {tmp_path:?}: {e}"))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| err!(Internal, "renaming {tmp_path:?} -> {final_path:?}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ts_segment_is_packet_aligned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.ts");
        let mut w = TsSegmentWriter::create(&path).unwrap();
        let data = vec![0u8; 1000];
        w.push_sample(&data, 0, 0, true).unwrap();
        let len = w.finish().unwrap();
        assert_eq!(len % TS_PACKET_LEN as u64, 0);
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, len);
    }

    #[test]
    fn playlist_rolls_window_and_deletes_evicted_segments() {
        let dir = tempdir().unwrap();
        for i in 0..3 {
            std::fs::write(dir.path().join(format!("{i}.ts")), b"x").unwrap();
        }
        let mut pl = Playlist::new(dir.path().to_path_buf(), 2, 4);
        pl.push_segment("0.ts".to_string(), 4.0).unwrap();
        pl.push_segment("1.ts".to_string(), 4.0).unwrap();
        pl.push_segment("2.ts".to_string(), 4.0).unwrap();
        assert!(!dir.path().join("0.ts").exists());
        assert!(dir.path().join("1.ts").exists());
        let m3u8 = std::fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        assert!(m3u8.contains("2.ts"));
        assert!(!m3u8.contains("0.ts"));
        assert!(m3u8.contains("#EXT-X-MEDIA-SEQUENCE:1"));
    }

    #[test]
    fn pts_dts_round_trip_through_90k_conversion() {
        assert_eq!(to_90k(0), 0);
        assert_eq!(to_90k(1_000_000), 90_000);
    }
}
