//! H.264 byte-stream parsing
//!
//! The encoder emits Annex-B: NAL units prefixed with `00 00 01` or
//! `00 00 00 01` start codes. This module classifies NAL units and parses
//! the Sequence Parameter Set far enough to recover the coded picture size
//! and the `avc1.*` codec string a hardware decoder needs.

use bytes::Bytes;

use crate::error::MediaError;

/// NAL unit type, from the low 5 bits of the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalType {
    /// Non-IDR coded slice
    NonIdr,
    /// Coded slice data partition A/B/C
    Partition(u8),
    /// IDR coded slice (keyframe)
    Idr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// Anything else
    Other(u8),
}

impl NalType {
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalType::NonIdr,
            n @ 2..=4 => NalType::Partition(n),
            5 => NalType::Idr,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::Aud,
            n => NalType::Other(n),
        }
    }

    /// Video coding layer NALs carry slice data and define frame boundaries.
    pub fn is_vcl(self) -> bool {
        matches!(self, NalType::NonIdr | NalType::Partition(_) | NalType::Idr)
    }

    pub fn is_keyframe(self) -> bool {
        self == NalType::Idr
    }
}

/// Remove emulation-prevention bytes: `00 00 03` becomes `00 00`.
pub fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

/// MSB-first bit reader over an RBSP.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<u32, MediaError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(MediaError::SpsTruncated(self.pos))?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    fn read_bits(&mut self, count: u32) -> Result<u32, MediaError> {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    /// Unsigned Exp-Golomb
    fn read_ue(&mut self) -> Result<u32, MediaError> {
        let mut leading_zeros = 0;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(MediaError::SpsInvalid("exp-golomb code too long"));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let rest = self.read_bits(leading_zeros)?;
        Ok((1 << leading_zeros) - 1 + rest)
    }

    /// Signed Exp-Golomb
    fn read_se(&mut self) -> Result<i32, MediaError> {
        let code = self.read_ue()?;
        let value = ((code + 1) / 2) as i32;
        Ok(if code % 2 == 0 { -value } else { value })
    }
}

/// What a decoder needs from the SPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u8,
    pub frame_mbs_only: bool,
    /// Display size after cropping
    pub width: u32,
    pub height: u32,
}

impl SpsInfo {
    /// MIME codec parameter, e.g. `avc1.42c01f`.
    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }
}

/// Profiles whose SPS carries the chroma/bit-depth block.
fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: u32) -> Result<(), MediaError> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Parse a complete SPS NAL unit (header byte included, start code not).
pub fn parse_sps(nal: &[u8]) -> Result<SpsInfo, MediaError> {
    match nal.first().map(|b| NalType::from_header(*b)) {
        Some(NalType::Sps) => {}
        _ => return Err(MediaError::NotSps),
    }

    let rbsp = strip_emulation_prevention(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)? as u8;
    let constraint_flags = r.read_bits(8)? as u8;
    let level_idc = r.read_bits(8)? as u8;
    let _seq_parameter_set_id = r.read_ue()?;

    let mut chroma_format_idc = 1;
    if has_chroma_info(profile_idc) {
        chroma_format_idc = r.read_ue()? as u8;
        if chroma_format_idc == 3 {
            let _separate_colour_plane = r.read_bit()?;
        }
        let _bit_depth_luma = r.read_ue()?;
        let _bit_depth_chroma = r.read_ue()?;
        let _transform_bypass = r.read_bit()?;
        if r.read_bit()? == 1 {
            let list_count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..list_count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.read_ue()?;
    let pic_order_cnt_type = r.read_ue()?;
    match pic_order_cnt_type {
        0 => {
            let _log2_max_poc_lsb = r.read_ue()?;
        }
        1 => {
            let _delta_always_zero = r.read_bit()?;
            let _offset_non_ref = r.read_se()?;
            let _offset_top_bottom = r.read_se()?;
            let cycles = r.read_ue()?;
            for _ in 0..cycles {
                let _offset = r.read_se()?;
            }
        }
        2 => {}
        _ => return Err(MediaError::SpsInvalid("pic_order_cnt_type")),
    }

    let _max_num_ref_frames = r.read_ue()?;
    let _gaps_allowed = r.read_bit()?;

    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()? == 1;
    if !frame_mbs_only {
        let _mb_adaptive = r.read_bit()?;
    }
    let _direct_8x8 = r.read_bit()?;

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_bit()? == 1 {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    // Crop units depend on chroma subsampling and field coding (7.4.2.1.1).
    let (sub_width, sub_height) = match chroma_format_idc {
        0 => (1, 1),
        1 => (2, 2),
        2 => (2, 1),
        3 => (1, 1),
        _ => return Err(MediaError::SpsInvalid("chroma_format_idc")),
    };
    let crop_unit_x = sub_width;
    let crop_unit_y = sub_height * if frame_mbs_only { 1 } else { 2 };

    let frame_height_factor = if frame_mbs_only { 1 } else { 2 };
    let width = pic_width_in_mbs * 16 - (crop_left + crop_right) * crop_unit_x;
    let height =
        pic_height_in_map_units * 16 * frame_height_factor - (crop_top + crop_bottom) * crop_unit_y;

    Ok(SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        chroma_format_idc,
        frame_mbs_only,
        width,
        height,
    })
}

/// Read `first_mb_in_slice` from a VCL NAL's slice header.
///
/// Zero marks the first slice of a picture, which is the frame boundary the
/// demuxer keys on.
pub fn first_mb_in_slice(nal: &[u8]) -> Option<u32> {
    if nal.len() < 2 {
        return None;
    }
    // The field sits right after the NAL header; eight bytes of RBSP is more
    // than any realistic encoding of it.
    let end = nal.len().min(9);
    let rbsp = strip_emulation_prevention(&nal[1..end]);
    BitReader::new(&rbsp).read_ue().ok()
}

/// Owned SPS bytes alongside the parse, for callers that cache both.
pub fn sps_payload(nal: &[u8]) -> Option<(Bytes, SpsInfo)> {
    let info = parse_sps(nal).ok()?;
    Some((Bytes::copy_from_slice(nal), info))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// MSB-first bit writer used to synthesize known SPS payloads.
    pub(crate) struct BitWriter {
        bytes: Vec<u8>,
        bit: u8,
    }

    impl BitWriter {
        pub(crate) fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit: 0,
            }
        }

        pub(crate) fn write_bit(&mut self, value: u32) {
            if self.bit == 0 {
                self.bytes.push(0);
            }
            if value != 0 {
                *self.bytes.last_mut().unwrap() |= 1 << (7 - self.bit);
            }
            self.bit = (self.bit + 1) % 8;
        }

        pub(crate) fn write_bits(&mut self, value: u32, count: u32) {
            for i in (0..count).rev() {
                self.write_bit((value >> i) & 1);
            }
        }

        pub(crate) fn write_ue(&mut self, value: u32) {
            let code = value + 1;
            let bits = 32 - code.leading_zeros();
            self.write_bits(0, bits - 1);
            self.write_bits(code, bits);
        }

        pub(crate) fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit + alignment
            self.write_bit(1);
            while self.bit != 0 {
                self.write_bit(0);
            }
            self.bytes
        }
    }

    /// Baseline SPS with the given geometry; mirrors what the Pi encoder
    /// emits for constrained baseline.
    pub(crate) fn make_sps(width_mbs: u32, height_map_units: u32, crop_bottom: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_bits(66, 8); // profile_idc: baseline
        w.write_bits(0xC0, 8); // constraint_set0+1
        w.write_bits(31, 8); // level 3.1
        w.write_ue(0); // seq_parameter_set_id
        w.write_ue(0); // log2_max_frame_num_minus4
        w.write_ue(0); // pic_order_cnt_type
        w.write_ue(0); // log2_max_pic_order_cnt_lsb_minus4
        w.write_ue(1); // max_num_ref_frames
        w.write_bit(0); // gaps_in_frame_num_value_allowed
        w.write_ue(width_mbs - 1);
        w.write_ue(height_map_units - 1);
        w.write_bit(1); // frame_mbs_only
        w.write_bit(1); // direct_8x8_inference
        if crop_bottom > 0 {
            w.write_bit(1); // frame_cropping
            w.write_ue(0);
            w.write_ue(0);
            w.write_ue(0);
            w.write_ue(crop_bottom);
        } else {
            w.write_bit(0);
        }
        w.write_bit(0); // vui_parameters_present

        let mut nal = vec![0x67];
        nal.extend(w.finish());
        nal
    }

    #[test]
    fn test_nal_type_classification() {
        assert_eq!(NalType::from_header(0x65), NalType::Idr);
        assert_eq!(NalType::from_header(0x41), NalType::NonIdr);
        assert_eq!(NalType::from_header(0x67), NalType::Sps);
        assert_eq!(NalType::from_header(0x68), NalType::Pps);
        assert_eq!(NalType::from_header(0x06), NalType::Sei);
        assert_eq!(NalType::from_header(0x09), NalType::Aud);
        assert_eq!(NalType::from_header(0x0A), NalType::Other(10));

        assert!(NalType::Idr.is_vcl());
        assert!(NalType::NonIdr.is_vcl());
        assert!(!NalType::Sps.is_vcl());
        assert!(NalType::Idr.is_keyframe());
        assert!(!NalType::NonIdr.is_keyframe());
    }

    #[test]
    fn test_emulation_prevention_stripping() {
        assert_eq!(strip_emulation_prevention(&[0, 0, 3, 1]), vec![0, 0, 1]);
        assert_eq!(
            strip_emulation_prevention(&[0, 0, 3, 0, 0, 3]),
            vec![0, 0, 0, 0]
        );
        // 0x03 without two preceding zeros is data, not an escape.
        assert_eq!(strip_emulation_prevention(&[0, 3, 1]), vec![0, 3, 1]);
        assert_eq!(strip_emulation_prevention(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn test_sps_720p() {
        let nal = make_sps(80, 45, 0);
        let info = parse_sps(&nal).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.constraint_flags, 0xC0);
        assert_eq!(info.level_idc, 31);
        assert!(info.frame_mbs_only);
        assert_eq!(info.codec_string(), "avc1.42c01f");
    }

    #[test]
    fn test_sps_1080p_cropped() {
        // 1080 lines are coded as 68 macroblock rows (1088) with an 8-line
        // bottom crop; crop units are 2 luma lines in 4:2:0 frame coding.
        let nal = make_sps(120, 68, 4);
        let info = parse_sps(&nal).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
    }

    #[test]
    fn test_sps_high_profile_chroma_block() {
        let mut w = BitWriter::new();
        w.write_bits(100, 8); // high profile
        w.write_bits(0x00, 8);
        w.write_bits(40, 8); // level 4.0
        w.write_ue(0); // sps id
        w.write_ue(1); // chroma_format_idc 4:2:0
        w.write_ue(0); // bit_depth_luma_minus8
        w.write_ue(0); // bit_depth_chroma_minus8
        w.write_bit(0); // transform bypass
        w.write_bit(0); // scaling matrix absent
        w.write_ue(0); // log2_max_frame_num_minus4
        w.write_ue(2); // pic_order_cnt_type 2
        w.write_ue(2); // max_num_ref_frames
        w.write_bit(0); // gaps
        w.write_ue(39); // 640 wide
        w.write_ue(29); // 480 tall
        w.write_bit(1); // frame_mbs_only
        w.write_bit(1); // direct_8x8
        w.write_bit(0); // no cropping
        w.write_bit(0); // no vui
        let mut nal = vec![0x67];
        nal.extend(w.finish());

        let info = parse_sps(&nal).unwrap();
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 480);
        assert_eq!(info.codec_string(), "avc1.640028");
    }

    #[test]
    fn test_sps_rejects_non_sps() {
        assert_eq!(parse_sps(&[0x65, 0x88]), Err(MediaError::NotSps));
        assert_eq!(parse_sps(&[]), Err(MediaError::NotSps));
    }

    #[test]
    fn test_sps_truncated() {
        let nal = make_sps(80, 45, 0);
        let result = parse_sps(&nal[..4]);
        assert!(matches!(result, Err(MediaError::SpsTruncated(_))));
    }

    #[test]
    fn test_first_mb_in_slice() {
        // ue(0) is a single 1 bit: 0x88 = 1000_1000.
        assert_eq!(first_mb_in_slice(&[0x65, 0x88]), Some(0));
        // ue(1) = 010 -> 0x40 = 0100_0000.
        assert_eq!(first_mb_in_slice(&[0x41, 0x40]), Some(1));
        assert_eq!(first_mb_in_slice(&[0x65]), None);
    }
}
