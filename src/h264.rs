// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! H.264 bitstream handling.
//!
//! RTSP sources (via `retina`) hand us Annex B byte streams (ISO/IEC
//! 14496-10 Annex B); `.mp4` files need AVC access units (ISO/IEC
//! 14496-15) instead, with NAL units prefixed by a 4-byte length rather
//! than a start code. This module does that conversion, and builds the
//! `avcC`/`avc1` sample-entry bytes `mp4_writer` embeds in `stsd`.

use base::{err, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::convert::TryFrom;

pub const NAL_TYPE_MASK: u8 = 0x1f;
pub const NAL_UNIT_NON_IDR: u8 = 1;
pub const NAL_UNIT_IDR: u8 = 5;
pub const NAL_UNIT_SEI: u8 = 6;
pub const NAL_UNIT_SEQ_PARAMETER_SET: u8 = 7;
pub const NAL_UNIT_PIC_PARAMETER_SET: u8 = 8;

pub fn nal_type(nal: &[u8]) -> u8 {
    nal[0] & NAL_TYPE_MASK
}

/// Splits an Annex B byte stream into NAL units, calling `f` for each.
/// `f` sees the NAL header byte and payload, start-code and trailing
/// padding stripped.
pub fn for_each_nal<'a, F: FnMut(&'a [u8]) -> Result<(), Error>>(
    mut data: &'a [u8],
    mut f: F,
) -> Result<(), Error> {
    let start_code: &[u8] = b"\x00\x00\x01";
    'outer: while let Some(pos) = find_subslice(data, start_code) {
        let mut unit = &data[..pos];
        data = &data[pos + start_code.len()..];
        loop {
            match unit.last() {
                None => continue 'outer,
                Some(0) => unit = &unit[..unit.len() - 1],
                Some(_) => break,
            }
        }
        f(unit)?;
    }
    if !data.is_empty() {
        f(data)?;
    }
    Ok(())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// True if `data` (an Annex B access unit, possibly containing multiple
/// NAL units) contains an IDR slice.
pub fn is_keyframe(data: &[u8]) -> bool {
    let mut found = false;
    let _ = for_each_nal(data, |nal| {
        if nal_type(nal) == NAL_UNIT_IDR {
            found = true;
        }
        Ok(())
    });
    found
}

/// Extracts the most recent SPS and PPS from an Annex B access unit, if
/// present. A stream that changes SPS/PPS mid-stream (spec.md §4.2) is
/// detected by comparing this against the segment writer's currently
/// active parameter sets.
pub fn extract_parameter_sets(data: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut sps = None;
    let mut pps = None;
    let _ = for_each_nal(data, |nal| {
        match nal_type(nal) {
            NAL_UNIT_SEQ_PARAMETER_SET => sps = Some(nal.to_vec()),
            NAL_UNIT_PIC_PARAMETER_SET => pps = Some(nal.to_vec()),
            _ => {}
        }
        Ok(())
    });
    match (sps, pps) {
        (Some(s), Some(p)) => Some((s, p)),
        _ => None,
    }
}

/// Rewrites an Annex B access unit into AVC form: each NAL unit prefixed
/// by its big-endian 4-byte length instead of a start code.
pub fn annex_b_to_avc(annex_b: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
    out.clear();
    out.reserve(annex_b.len() + 4);
    for_each_nal(annex_b, |nal| {
        out.write_u32::<BigEndian>(nal.len() as u32)
            .map_err(|e| err!(Internal, "writing AVC length prefix: {e}"))?;
        out.extend_from_slice(nal);
        Ok(())
    })
}

/// The `avc1` sample entry `mp4_writer` embeds in `stsd`, derived from a
/// stream's SPS/PPS.
pub struct SampleEntry {
    pub data: Vec<u8>,
    pub width: u16,
    pub height: u16,
    pub rfc6381_codec: String,
}

/// Builds the `avc1`+`avcC` sample entry box bytes from a stream's raw
/// (Annex B form) SPS and PPS NAL units.
pub fn build_sample_entry(sps: &[u8], pps: &[u8], width: u16, height: u16) -> Result<SampleEntry, Error> {
    let mut e = Vec::with_capacity(128);

    // SampleEntry (ISO/IEC 14496-12 §8.5.2) + VisualSampleEntry (§12.1.3).
    let avc1_len_pos = e.len();
    e.extend_from_slice(b"\x00\x00\x00\x00avc1\x00\x00\x00\x00\x00\x00\x00\x01");
    e.extend_from_slice(&[0; 16]);
    e.write_u16::<BigEndian>(width).unwrap();
    e.write_u16::<BigEndian>(height).unwrap();
    e.extend_from_slice(&[
        0x00, 0x48, 0x00, 0x00, // horizresolution 72dpi
        0x00, 0x48, 0x00, 0x00, // vertresolution 72dpi
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x01, // frame count
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // compressorname (32 bytes)
        0x00, 0x18, 0xff, 0xff, // depth + pre_defined
    ]);

    // AVCConfigurationBox (ISO/IEC 14496-15 §5.3.4.1).
    let avcc_len_pos = e.len();
    e.extend_from_slice(b"\x00\x00\x00\x00avcC");
    e.push(1); // configurationVersion
    e.push(sps[1]); // profile_idc
    e.push(sps[2]); // profile_compatibility
    e.push(sps[3]); // level_idc
    e.push(0xff); // lengthSizeMinusOne = 3, reserved bits set
    e.push(0xe1); // reserved bits + numOfSequenceParameterSets = 1
    e.write_u16::<BigEndian>(u16::try_from(sps.len()).map_err(|_| err!(InvalidArgument, "SPS too large"))?)
        .unwrap();
    e.extend_from_slice(sps);
    e.push(1); // numOfPictureParameterSets
    e.write_u16::<BigEndian>(u16::try_from(pps.len()).map_err(|_| err!(InvalidArgument, "PPS too large"))?)
        .unwrap();
    e.extend_from_slice(pps);

    let cur = e.len();
    BigEndian::write_u32(&mut e[avcc_len_pos..avcc_len_pos + 4], (cur - avcc_len_pos) as u32);
    let cur = e.len();
    BigEndian::write_u32(&mut e[avc1_len_pos..avc1_len_pos + 4], (cur - avc1_len_pos) as u32);

    let profile_idc = sps[1];
    let constraint_flags = sps[2];
    let level_idc = sps[3];
    let rfc6381_codec = format!("avc1.{profile_idc:02x}{constraint_flags:02x}{level_idc:02x}");

    Ok(SampleEntry { data: e, width, height, rfc6381_codec })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    const ANNEX_B_TEST_INPUT: [u8; 35] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x4d, 0x00, 0x1f,
        0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
        0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
        0x1d, 0x4c, 0x01, 0x00, 0x00, 0x00, 0x01, 0x68,
        0xee, 0x3c, 0x80,
    ];

    #[test]
    fn for_each_nal_splits_on_start_codes() {
        let mut pieces = Vec::new();
        for_each_nal(&ANNEX_B_TEST_INPUT, |n| {
            pieces.push(n.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(nal_type(&pieces[0]), NAL_UNIT_SEQ_PARAMETER_SET);
        assert_eq!(nal_type(&pieces[1]), NAL_UNIT_PIC_PARAMETER_SET);
    }

    #[test]
    fn extracts_sps_and_pps() {
        let (sps, pps) = extract_parameter_sets(&ANNEX_B_TEST_INPUT).unwrap();
        assert_eq!(nal_type(&sps), NAL_UNIT_SEQ_PARAMETER_SET);
        assert_eq!(nal_type(&pps), NAL_UNIT_PIC_PARAMETER_SET);
    }

    #[test]
    fn annex_b_to_avc_uses_length_prefixes() {
        let mut out = Vec::new();
        annex_b_to_avc(&ANNEX_B_TEST_INPUT, &mut out).unwrap();
        // First NAL is 23 bytes (SPS), second is 4 (PPS).
        assert_eq!(BigEndian::read_u32(&out[0..4]), 23);
        assert_eq!(out[4] & NAL_TYPE_MASK, NAL_UNIT_SEQ_PARAMETER_SET);
    }

    #[test]
    fn idr_detected_as_keyframe() {
        let idr = [0x00, 0x00, 0x01, (NAL_UNIT_IDR) | 0x80, 0x01, 0x02];
        assert!(is_keyframe(&idr));
        let non_idr = [0x00, 0x00, 0x01, NAL_UNIT_NON_IDR, 0x01, 0x02];
        assert!(!is_keyframe(&non_idr));
    }

    #[test]
    fn sample_entry_has_expected_codec_string() {
        let (sps, pps) = extract_parameter_sets(&ANNEX_B_TEST_INPUT).unwrap();
        let e = build_sample_entry(&sps, &pps, 1280, 720).unwrap();
        assert_eq!(e.rfc6381_codec, "avc1.4d001f");
        assert_eq!(e.width, 1280);
    }
}
