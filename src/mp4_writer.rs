// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Writes one fragmented, video-only MP4 file per segment (spec.md
//! §4.4). Unlike a read-time virtual-file builder that serves ranges out
//! of a packed sample store, this writer is write-time and one-shot: a
//! segment's sample bytes are appended to a scratch file as they arrive
//! (bounding memory to per-sample metadata, not sample payloads), and
//! `seal` assembles `ftyp`/`moov`/`moof`/`mdat` around them before an
//! atomic rename into place.
//!
//! Timescale is microseconds throughout: `Packet::pts`/`dts`/`duration_us`
//! need no rescaling to land in `mdhd`/`tkhd`/`trun`.

use crate::h264::SampleEntry;
use base::{bail, err, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TIMESCALE: u32 = 1_000_000;

/// ISO 14496-12 epoch (1904-01-01) offset from Unix epoch, in seconds.
const ISO_EPOCH_OFFSET_SECS: i64 = 24107 * 86400;

fn to_mp4_timestamp(unix_secs: i64) -> u32 {
    (unix_secs + ISO_EPOCH_OFFSET_SECS) as u32
}

/// Per-sample bookkeeping kept in memory for the life of one segment.
/// Bounded by sample count, not sample size, so a long high-bitrate
/// segment doesn't grow process memory with its frame payloads.
struct SampleMeta {
    size: u32,
    duration_us: u32,
    cts_offset_us: i32,
    is_keyframe: bool,
}

pub struct Mp4Writer {
    final_path: PathBuf,
    tmp_path: PathBuf,
    scratch_path: PathBuf,
    scratch: BufWriter<File>,
    sample_entry: SampleEntry,
    samples: Vec<SampleMeta>,
    start_unix_ms: i64,
    total_bytes: u64,
}

/// Filled in by [`Mp4Writer::seal`]; what `SegmentWriter` registers with
/// the index (spec.md §4.4's "Registration protocol (MP4)").
pub struct SealedMp4 {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub frame_count: u32,
}

impl Mp4Writer {
    /// `dir` must already exist; `stream_name`/`start_unix_ms` become
    /// part of the final filename (`{start_epoch_ms}.mp4`, spec.md §6).
    pub fn create(
        dir: &Path,
        start_unix_ms: i64,
        sample_entry: SampleEntry,
    ) -> Result<Mp4Writer, Error> {
        let final_path = dir.join(format!("{start_unix_ms}.mp4"));
        let tmp_path = dir.join(format!("{start_unix_ms}.mp4.partial"));
        let scratch_path = dir.join(format!("{start_unix_ms}.mp4.scratch"));
        let scratch = File::create(&scratch_path)
            .map_err(|e| err!(Internal, "creating mp4 scratch file {scratch_path:?}: {e}"))?;
        Ok(Mp4Writer {
            final_path,
            tmp_path,
            scratch_path,
            scratch: BufWriter::new(scratch),
            sample_entry,
            samples: Vec::new(),
            start_unix_ms,
            total_bytes: 0,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Abandons this segment after a write error, renaming whatever got
    /// written so far to a `.corrupt` path instead of leaving a `.partial`
    /// or scratch file behind (spec.md §4.4's failure semantics). Returns
    /// the path it renamed to, if anything had been written yet.
    pub fn abort_to_corrupt(self) -> Option<PathBuf> {
        drop(self.scratch);
        let corrupt_path = self.final_path.with_extension("mp4.corrupt");
        if self.tmp_path.exists() {
            let _ = std::fs::rename(&self.tmp_path, &corrupt_path);
            let _ = std::fs::remove_file(&self.scratch_path);
            return Some(corrupt_path);
        }
        if self.scratch_path.exists() {
            let _ = std::fs::rename(&self.scratch_path, &corrupt_path);
            return Some(corrupt_path);
        }
        None
    }

    pub fn frame_count(&self) -> u32 {
        self.samples.len() as u32
    }

    /// Appends one AVC (length-prefixed) access unit. `dts_us`/`pts_us`
    /// are this crate's extended 64-bit microsecond timestamps
    /// (`crate::ingest::PtsExtender`); only their difference from the
    /// segment's first dts and from each other matters here.
    pub fn push_sample(
        &mut self,
        avc_data: &[u8],
        pts_us: i64,
        dts_us: i64,
        duration_us: i64,
        is_keyframe: bool,
    ) -> Result<(), Error> {
        self.scratch
            .write_all(avc_data)
            .map_err(|e| err!(Internal, "writing mp4 sample data: {e}"))?;
        self.total_bytes += avc_data.len() as u64;
        self.samples.push(SampleMeta {
            size: u32::try_from(avc_data.len()).map_err(|_| err!(InvalidArgument, "sample too large"))?,
            duration_us: u32::try_from(duration_us.max(0)).unwrap_or(0),
            cts_offset_us: i32::try_from(pts_us - dts_us).unwrap_or(0),
            is_keyframe,
        });
        Ok(())
    }

    /// Assembles `ftyp`/`moov`/`moof`/`mdat`, fsyncs, and atomically
    /// renames into place (spec.md §4.4 step 1). On any I/O error the
    /// caller is expected to rename the partial file `.corrupt` rather
    /// than register it (spec.md §4.4's failure semantics); this
    /// function does not do that renaming itself so the caller can log
    /// with full segment context.
    pub fn seal(mut self) -> Result<SealedMp4, Error> {
        if self.samples.is_empty() {
            let _ = std::fs::remove_file(&self.scratch_path);
            bail!(FailedPrecondition, "sealing mp4 with no samples");
        }
        self.scratch
            .flush()
            .map_err(|e| err!(Internal, "flushing mp4 scratch file: {e}"))?;
        drop(self.scratch);

        let creation_ts = to_mp4_timestamp(self.start_unix_ms / 1000);
        let total_duration_us: u64 = self.samples.iter().map(|s| s.duration_us as u64).sum();

        let mut out = Vec::with_capacity(4096 + self.samples.len() * 16);
        write_ftyp(&mut out);
        write_moov(&mut out, &self.sample_entry, creation_ts, total_duration_us);
        write_moof(&mut out, &self.samples);

        let mut outfile = File::create(&self.tmp_path)
            .map_err(|e| err!(Internal, "creating {:?}: {e}", self.tmp_path))?;
        outfile
            .write_all(&out)
            .map_err(|e| err!(Internal, "writing mp4 headers: {e}"))?;

        // mdat: size(4) + 'mdat'(4) + sample bytes, copied from the
        // scratch file without loading it all into memory at once.
        let mdat_len = 8u64 + self.total_bytes;
        outfile
            .write_u32::<BigEndian>(u32::try_from(mdat_len).map_err(|_| err!(ResourceExhausted, "segment exceeds 4GiB"))?)
            .and_then(|_| outfile.write_all(b"mdat"))
            .map_err(|e| err!(Internal, "writing mdat header: {e}"))?;
        let mut scratch_in = File::open(&self.scratch_path)
            .map_err(|e| err!(Internal, "reopening scratch file: {e}"))?;
        scratch_in.seek(SeekFrom::Start(0)).ok();
        std::io::copy(&mut scratch_in, &mut outfile)
            .map_err(|e| err!(Internal, "copying mdat payload: {e}"))?;

        outfile.flush().map_err(|e| err!(Internal, "flushing mp4 file: {e}"))?;
        outfile.sync_all().map_err(|e| err!(Internal, "fsyncing mp4 file: {e}"))?;
        drop(outfile);
        let _ = std::fs::remove_file(&self.scratch_path);

        std::fs::rename(&self.tmp_path, &self.final_path)
            .map_err(|e| err!(Internal, "renaming {:?} -> {:?}: {e}", self.tmp_path, self.final_path))?;

        Ok(SealedMp4 {
            path: self.final_path,
            size_bytes: mdat_len + out_len_hint(&out),
            frame_count: self.samples.len() as u32,
        })
    }
}

fn out_len_hint(out: &[u8]) -> u64 {
    out.len() as u64
}

macro_rules! write_length {
    ($out:ident, $body:block) => {{
        let len_pos = $out.len();
        $out.write_u32::<BigEndian>(0).unwrap();
        $body;
        let len = ($out.len() - len_pos) as u32;
        BigEndian::write_u32(&mut $out[len_pos..len_pos + 4], len);
    }};
}

fn write_ftyp(out: &mut Vec<u8>) {
    write_length!(out, {
        out.extend_from_slice(b"ftypisom");
        out.write_u32::<BigEndian>(0x200).unwrap(); // minor version
        out.extend_from_slice(b"isomiso2avc1mp41");
    });
}

fn write_moov(out: &mut Vec<u8>, sample_entry: &SampleEntry, creation_ts: u32, duration_us: u64) {
    write_length!(out, {
        out.extend_from_slice(b"moov");
        write_mvhd(out, creation_ts, duration_us);
        write_video_trak(out, sample_entry, creation_ts, duration_us);
        write_mvex(out);
    });
}

fn write_mvhd(out: &mut Vec<u8>, creation_ts: u32, duration_us: u64) {
    write_length!(out, {
        out.extend_from_slice(b"mvhd");
        out.push(0); // version
        out.extend_from_slice(&[0, 0, 0]); // flags
        out.write_u32::<BigEndian>(creation_ts).unwrap();
        out.write_u32::<BigEndian>(creation_ts).unwrap();
        out.write_u32::<BigEndian>(TIMESCALE).unwrap();
        out.write_u32::<BigEndian>(duration_us.min(u32::MAX as u64) as u32).unwrap();
        out.write_u32::<BigEndian>(0x0001_0000).unwrap(); // rate 1.0
        out.write_u16::<BigEndian>(0x0100).unwrap(); // volume 1.0
        out.extend_from_slice(&[0; 10]); // reserved
        for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            out.write_u32::<BigEndian>(v).unwrap(); // unity matrix
        }
        out.extend_from_slice(&[0; 24]); // pre_defined
        out.write_u32::<BigEndian>(2).unwrap(); // next_track_id
    });
}

fn write_video_trak(out: &mut Vec<u8>, sample_entry: &SampleEntry, creation_ts: u32, duration_us: u64) {
    write_length!(out, {
        out.extend_from_slice(b"trak");
        write_tkhd(out, sample_entry, creation_ts, duration_us);
        write_mdia(out, sample_entry, creation_ts, duration_us);
    });
}

fn write_tkhd(out: &mut Vec<u8>, sample_entry: &SampleEntry, creation_ts: u32, duration_us: u64) {
    write_length!(out, {
        out.extend_from_slice(b"tkhd");
        out.push(0);
        out.extend_from_slice(&[0, 0, 7]); // track_enabled | track_in_movie | track_in_preview
        out.write_u32::<BigEndian>(creation_ts).unwrap();
        out.write_u32::<BigEndian>(creation_ts).unwrap();
        out.write_u32::<BigEndian>(1).unwrap(); // track_id
        out.write_u32::<BigEndian>(0).unwrap(); // reserved
        out.write_u32::<BigEndian>(duration_us.min(u32::MAX as u64) as u32).unwrap();
        out.extend_from_slice(&[0; 8]); // reserved
        out.write_u16::<BigEndian>(0).unwrap(); // layer
        out.write_u16::<BigEndian>(0).unwrap(); // alternate_group
        out.write_u16::<BigEndian>(0).unwrap(); // volume (video track)
        out.extend_from_slice(&[0; 2]); // reserved
        for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            out.write_u32::<BigEndian>(v).unwrap();
        }
        out.write_u32::<BigEndian>((sample_entry.width as u32) << 16).unwrap();
        out.write_u32::<BigEndian>((sample_entry.height as u32) << 16).unwrap();
    });
}

fn write_mdia(out: &mut Vec<u8>, sample_entry: &SampleEntry, creation_ts: u32, duration_us: u64) {
    write_length!(out, {
        out.extend_from_slice(b"mdia");
        write_length!(out, {
            out.extend_from_slice(b"mdhd");
            out.push(0);
            out.extend_from_slice(&[0, 0, 0]);
            out.write_u32::<BigEndian>(creation_ts).unwrap();
            out.write_u32::<BigEndian>(creation_ts).unwrap();
            out.write_u32::<BigEndian>(TIMESCALE).unwrap();
            out.write_u32::<BigEndian>(duration_us.min(u32::MAX as u64) as u32).unwrap();
            out.write_u16::<BigEndian>(0x55c4).unwrap(); // language "und"
            out.write_u16::<BigEndian>(0).unwrap();
        });
        write_length!(out, {
            out.extend_from_slice(b"hdlr");
            out.extend_from_slice(&[0; 4]);
            out.extend_from_slice(&[0; 4]); // pre_defined
            out.extend_from_slice(b"vide");
            out.extend_from_slice(&[0; 12]); // reserved
            out.extend_from_slice(b"LightNVR\0");
        });
        write_minf(out, sample_entry);
    });
}

fn write_minf(out: &mut Vec<u8>, sample_entry: &SampleEntry) {
    write_length!(out, {
        out.extend_from_slice(b"minf");
        write_length!(out, {
            out.extend_from_slice(b"vmhd");
            out.write_u32::<BigEndian>(1).unwrap(); // version 0, flags 1
            out.extend_from_slice(&[0; 8]); // graphicsmode + opcolor
        });
        write_length!(out, {
            out.extend_from_slice(b"dinf");
            write_length!(out, {
                out.extend_from_slice(b"dref");
                out.extend_from_slice(&[0; 4]);
                out.write_u32::<BigEndian>(1).unwrap();
                write_length!(out, {
                    out.extend_from_slice(b"url ");
                    out.write_u32::<BigEndian>(1).unwrap(); // self-contained flag
                });
            });
        });
        write_stbl(out, sample_entry);
    });
}

fn write_stbl(out: &mut Vec<u8>, sample_entry: &SampleEntry) {
    write_length!(out, {
        out.extend_from_slice(b"stbl");
        write_length!(out, {
            out.extend_from_slice(b"stsd");
            out.extend_from_slice(&[0; 4]);
            out.write_u32::<BigEndian>(1).unwrap();
            out.extend_from_slice(&sample_entry.data);
        });
        // Empty stts/stsc/stsz/stco: sample timing/size/location for a
        // fragmented track lives in each fragment's `trun`, not here.
        for name in [b"stts", b"stsc", b"stco"] {
            write_length!(out, {
                out.extend_from_slice(name);
                out.extend_from_slice(&[0; 4]);
                out.write_u32::<BigEndian>(0).unwrap();
            });
        }
        write_length!(out, {
            out.extend_from_slice(b"stsz");
            out.extend_from_slice(&[0; 4]);
            out.write_u32::<BigEndian>(0).unwrap(); // sample_size (0 = table follows)
            out.write_u32::<BigEndian>(0).unwrap(); // sample_count
        });
    });
}

fn write_mvex(out: &mut Vec<u8>) {
    write_length!(out, {
        out.extend_from_slice(b"mvex");
        write_length!(out, {
            out.extend_from_slice(b"trex");
            out.extend_from_slice(&[0; 4]);
            out.write_u32::<BigEndian>(1).unwrap(); // track_id
            out.write_u32::<BigEndian>(1).unwrap(); // default_sample_description_index
            out.write_u32::<BigEndian>(0).unwrap(); // default_sample_duration
            out.write_u32::<BigEndian>(0).unwrap(); // default_sample_size
            out.write_u32::<BigEndian>(0).unwrap(); // default_sample_flags
        });
    });
}

const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

fn write_moof(out: &mut Vec<u8>, samples: &[SampleMeta]) {
    let moof_start = out.len();
    write_length!(out, {
        out.extend_from_slice(b"moof");
        write_length!(out, {
            out.extend_from_slice(b"mfhd");
            out.extend_from_slice(&[0; 4]);
            out.write_u32::<BigEndian>(1).unwrap(); // sequence_number
        });
        write_length!(out, {
            out.extend_from_slice(b"traf");
            write_length!(out, {
                out.extend_from_slice(b"tfhd");
                out.write_u32::<BigEndian>(0x02_0000).unwrap(); // default-base-is-moof
                out.write_u32::<BigEndian>(1).unwrap(); // track_id
            });
            write_length!(out, {
                out.extend_from_slice(b"tfdt");
                out.push(1); // version 1: 64-bit baseMediaDecodeTime
                out.extend_from_slice(&[0, 0, 0]);
                out.write_u64::<BigEndian>(0).unwrap();
            });
            write_length!(out, {
                out.extend_from_slice(b"trun");
                // data-offset | sample-duration | sample-size | sample-flags | cts-offsets present.
                out.write_u32::<BigEndian>(0x0000_0f01).unwrap();
                out.write_u32::<BigEndian>(samples.len() as u32).unwrap();
                out.write_i32::<BigEndian>(0).unwrap(); // data_offset, patched below
                for s in samples {
                    out.write_u32::<BigEndian>(s.duration_us).unwrap();
                    out.write_u32::<BigEndian>(s.size).unwrap();
                    out.write_u32::<BigEndian>(if s.is_keyframe { SAMPLE_FLAGS_SYNC } else { SAMPLE_FLAGS_NON_SYNC }).unwrap();
                    out.write_i32::<BigEndian>(s.cts_offset_us).unwrap();
                }
            });
        });
    });
    // data_offset in trun is relative to the start of this moof; mdat's
    // own header (size+type, 8 bytes) follows immediately after moof.
    let moof_len = out.len() - moof_start;
    let data_offset = (moof_len + 8) as i32;
    patch_trun_data_offset(out, moof_start, data_offset);
}

/// `write_moof` can't know `data_offset` until the whole moof (including
/// the trun box it's embedded in) has been sized, so it's patched in
/// after the fact by re-locating the trun's data_offset field.
fn patch_trun_data_offset(out: &mut [u8], moof_start: usize, data_offset: i32) {
    let needle = b"trun";
    let mut i = moof_start;
    while i + 4 <= out.len() {
        if &out[i..i + 4] == needle {
            let pos = i + 4 + 4 + 4; // after 'trun', version+flags(4), sample_count(4)
            BigEndian::write_i32(&mut out[pos..pos + 4], data_offset);
            return;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264;
    use tempfile::tempdir;

    #[rustfmt::skip]
    const ANNEX_B: [u8; 35] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x4d, 0x00, 0x1f,
        0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
        0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
        0x1d, 0x4c, 0x01, 0x00, 0x00, 0x00, 0x01, 0x68,
        0xee, 0x3c, 0x80,
    ];

    fn entry() -> SampleEntry {
        let (sps, pps) = h264::extract_parameter_sets(&ANNEX_B).unwrap();
        h264::build_sample_entry(&sps, &pps, 1280, 720).unwrap()
    }

    #[test]
    fn seal_produces_well_formed_top_level_boxes() {
        let dir = tempdir().unwrap();
        let mut w = Mp4Writer::create(dir.path(), 1_700_000_000_000, entry()).unwrap();
        let mut avc = Vec::new();
        h264::annex_b_to_avc(&ANNEX_B, &mut avc).unwrap();
        w.push_sample(&avc, 0, 0, 33_333, true).unwrap();
        w.push_sample(&avc, 33_333, 33_333, 33_333, false).unwrap();
        let sealed = w.seal().unwrap();
        assert_eq!(sealed.frame_count, 2);
        assert!(sealed.path.exists());

        let bytes = std::fs::read(&sealed.path).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
        let ftyp_len = BigEndian::read_u32(&bytes[0..4]) as usize;
        assert_eq!(&bytes[ftyp_len + 4..ftyp_len + 8], b"moov");
    }

    #[test]
    fn sealing_with_no_samples_fails() {
        let dir = tempdir().unwrap();
        let w = Mp4Writer::create(dir.path(), 1_700_000_000_000, entry()).unwrap();
        assert!(w.seal().is_err());
    }

    #[test]
    fn total_bytes_tracks_pushed_sample_sizes() {
        let dir = tempdir().unwrap();
        let mut w = Mp4Writer::create(dir.path(), 1_700_000_000_000, entry()).unwrap();
        let mut avc = Vec::new();
        h264::annex_b_to_avc(&ANNEX_B, &mut avc).unwrap();
        w.push_sample(&avc, 0, 0, 33_333, true).unwrap();
        assert_eq!(w.total_bytes(), avc.len() as u64);
    }
}
