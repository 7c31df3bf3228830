// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The unit of work flowing from [`crate::ingest`] through
//! [`crate::router`] to the segment and motion-buffer consumers.

use bytes::Bytes;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// An encoded frame, carried opaque to the core past demuxing.
///
/// `pts` is a per-stream monotonic microsecond counter (see
/// [`crate::ingest::PtsExtender`]), not wall-clock time; the mapping to
/// wall-clock happens once, when a segment records its `start`/`end` in
/// [`db::segment`].
#[derive(Clone, Debug)]
pub struct Packet {
    pub stream_name: String,
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub duration_us: i64,
    pub is_keyframe: bool,
    pub track: TrackKind,
    /// Set when the source signalled new SPS/PPS alongside this packet
    /// (spec.md §4.2); `SegmentWriter` starts a new segment at the next
    /// keyframe when it sees this.
    pub new_parameters: Option<(Vec<u8>, Vec<u8>)>,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
