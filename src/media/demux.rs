//! Incremental Annex-B Access-Unit demuxer
//!
//! Reassembles complete Access Units from an H.264 Annex-B byte stream fed
//! in arbitrary chunks. Bytes before the first start code are discarded; a
//! trailing partial NAL is carried to the next call.
//!
//! Two consumption styles:
//! - [`AuDemuxer::feed`] is strictly incremental: a NAL only completes when
//!   the next start code arrives, so any byte split of the stream yields the
//!   same output.
//! - [`AuDemuxer::feed_message`] additionally flushes at the end of the
//!   chunk, treating the tail as a complete NAL. This is the mode matching
//!   this crate's wire contract, where every WebSocket message carries
//!   exactly one encoded unit; flushing there avoids a one-frame latency
//!   penalty.

use bytes::{BufMut, Bytes, BytesMut};

use super::h264::{self, NalType, SpsInfo};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// One reassembled Access Unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Retained NAL units, start codes stripped. AUD and SEI are dropped.
    pub nals: Vec<Bytes>,
    /// True when the unit contains an IDR slice.
    pub is_keyframe: bool,
}

impl AccessUnit {
    /// The unit re-framed with 4-byte start codes, ready for a decoder.
    pub fn to_annexb(&self) -> Bytes {
        let len = self.nals.iter().map(|n| n.len() + 4).sum();
        let mut out = BytesMut::with_capacity(len);
        for nal in &self.nals {
            out.put_slice(&START_CODE);
            out.put_slice(nal);
        }
        out.freeze()
    }

    pub fn nal_types(&self) -> Vec<NalType> {
        self.nals
            .iter()
            .filter_map(|n| n.first().map(|b| NalType::from_header(*b)))
            .collect()
    }
}

/// Stateful Access-Unit assembler.
pub struct AuDemuxer {
    /// Unconsumed bytes; once aligned, always begins with a start code.
    buf: Vec<u8>,
    /// Whether we have seen the first start code yet.
    aligned: bool,
    /// NALs accumulated for the Access Unit in progress.
    pending: Vec<Bytes>,
    pending_has_vcl: bool,
    pending_has_idr: bool,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    sps_info: Option<SpsInfo>,
}

impl AuDemuxer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            aligned: false,
            pending: Vec::new(),
            pending_has_vcl: false,
            pending_has_idr: false,
            sps: None,
            pps: None,
            sps_info: None,
        }
    }

    /// Latest sequence parameter set seen, raw.
    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    /// Latest picture parameter set seen, raw.
    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    /// Parsed view of the latest SPS.
    pub fn sps_info(&self) -> Option<SpsInfo> {
        self.sps_info
    }

    /// Consume a chunk; returns every Access Unit completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        if !self.aligned {
            match find_start_code(&self.buf, 0) {
                Some((start, _)) => {
                    self.buf.drain(..start);
                    self.aligned = true;
                }
                None => {
                    // Keep only a suffix that could still grow into a start
                    // code; everything before it is garbage.
                    let keep = start_code_prefix_len(&self.buf);
                    self.buf.drain(..self.buf.len() - keep);
                    return out;
                }
            }
        }

        loop {
            let code_len = leading_start_code_len(&self.buf);
            debug_assert!(code_len > 0, "aligned buffer must begin with a start code");
            match find_start_code(&self.buf, code_len) {
                Some((next, _)) => {
                    let nal = Bytes::copy_from_slice(&self.buf[code_len..next]);
                    self.buf.drain(..next);
                    if let Some(au) = self.push_nal(nal) {
                        out.push(au);
                    }
                }
                None => break,
            }
        }

        out
    }

    /// Treat the buffered tail as a complete NAL and emit any pending
    /// accumulation that contains slice data.
    pub fn flush(&mut self) -> Vec<AccessUnit> {
        let mut out = Vec::new();

        if self.aligned {
            let code_len = leading_start_code_len(&self.buf);
            if self.buf.len() > code_len {
                let nal = Bytes::copy_from_slice(&self.buf[code_len..]);
                if let Some(au) = self.push_nal(nal) {
                    out.push(au);
                }
            }
            self.buf.clear();
            self.aligned = false;
        }

        if self.pending_has_vcl {
            out.push(self.take_pending());
        }
        out
    }

    /// Feed one wire message: chunk plus end-of-message flush.
    pub fn feed_message(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
        let mut out = self.feed(chunk);
        out.extend(self.flush());
        out
    }

    /// Route one complete NAL; may complete the Access Unit in progress.
    fn push_nal(&mut self, nal: Bytes) -> Option<AccessUnit> {
        let ty = match nal.first() {
            Some(b) => NalType::from_header(*b),
            None => return None,
        };

        let mut finished = None;

        if ty.is_vcl() {
            // A VCL starting a new picture closes the previous one.
            if self.pending_has_vcl && h264::first_mb_in_slice(&nal) == Some(0) {
                finished = Some(self.take_pending());
            }
            self.pending_has_vcl = true;
            self.pending_has_idr |= ty.is_keyframe();
            self.pending.push(nal);
            return finished;
        }

        // Any non-VCL NAL closes a picture in progress.
        if self.pending_has_vcl {
            finished = Some(self.take_pending());
        }

        match ty {
            NalType::Sps => {
                if let Some((raw, info)) = h264::sps_payload(&nal) {
                    self.sps = Some(raw);
                    self.sps_info = Some(info);
                } else {
                    self.sps = Some(nal.clone());
                }
                self.pending.push(nal);
            }
            NalType::Pps => {
                self.pps = Some(nal.clone());
                self.pending.push(nal);
            }
            // Delimiters and SEI are boundary markers only; decoders get
            // nothing from them here.
            NalType::Aud | NalType::Sei => {}
            _ => self.pending.push(nal),
        }

        finished
    }

    fn take_pending(&mut self) -> AccessUnit {
        let au = AccessUnit {
            nals: std::mem::take(&mut self.pending),
            is_keyframe: self.pending_has_idr,
        };
        self.pending_has_vcl = false;
        self.pending_has_idr = false;
        au
    }
}

impl Default for AuDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the next `00 00 01` / `00 00 00 01`, returning (offset, length).
fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    if buf.len() < 3 {
        return None;
    }
    let mut i = from;
    while i + 2 < buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            if i > from && buf[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Length of the start code the buffer begins with (0 if none).
fn leading_start_code_len(buf: &[u8]) -> usize {
    if buf.len() >= 3 && buf[0] == 0 && buf[1] == 0 && buf[2] == 1 {
        3
    } else if buf.len() >= 4 && buf[0] == 0 && buf[1] == 0 && buf[2] == 0 && buf[3] == 1 {
        4
    } else {
        0
    }
}

/// Longest suffix of `buf` that is a proper prefix of a start code.
fn start_code_prefix_len(buf: &[u8]) -> usize {
    for keep in (1..=3.min(buf.len())).rev() {
        if buf[buf.len() - keep..].iter().all(|b| *b == 0) {
            return keep;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1F, 0xE1, 0xA2];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21, 0xFF];
    // first_mb_in_slice == 0 (leading 1 bit after the header byte)
    const SLICE: &[u8] = &[0x41, 0x9A, 0x26, 0x05];
    const SEI: &[u8] = &[0x06, 0x05, 0x11];
    const AUD: &[u8] = &[0x09, 0xF0];

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_single_message_keyframe() {
        let stream = annexb(&[SPS, PPS, IDR]);
        let mut demuxer = AuDemuxer::new();
        let aus = demuxer.feed_message(&stream);

        assert_eq!(aus.len(), 1);
        let au = &aus[0];
        assert!(au.is_keyframe);
        assert_eq!(
            au.nal_types(),
            vec![NalType::Sps, NalType::Pps, NalType::Idr]
        );
        assert!(demuxer.sps().is_some());
        assert!(demuxer.pps().is_some());
    }

    #[test]
    fn test_inter_frame_message() {
        let mut demuxer = AuDemuxer::new();
        demuxer.feed_message(&annexb(&[SPS, PPS, IDR]));
        let aus = demuxer.feed_message(&annexb(&[SLICE]));

        assert_eq!(aus.len(), 1);
        assert!(!aus[0].is_keyframe);
        assert_eq!(aus[0].nal_types(), vec![NalType::NonIdr]);
    }

    #[test]
    fn test_three_byte_start_codes() {
        let mut stream = Vec::new();
        for nal in [SPS, PPS, IDR] {
            stream.extend_from_slice(&[0, 0, 1]);
            stream.extend_from_slice(nal);
        }
        let mut demuxer = AuDemuxer::new();
        let aus = demuxer.feed_message(&stream);
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].nals.len(), 3);
    }

    #[test]
    fn test_leading_garbage_dropped() {
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF];
        stream.extend(annexb(&[SPS, PPS, IDR]));
        let mut demuxer = AuDemuxer::new();
        let aus = demuxer.feed_message(&stream);
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].nals[0], Bytes::copy_from_slice(SPS));
    }

    #[test]
    fn test_aud_and_sei_dropped() {
        let stream = annexb(&[AUD, SPS, PPS, SEI, IDR]);
        let mut demuxer = AuDemuxer::new();
        let aus = demuxer.feed_message(&stream);
        assert_eq!(aus.len(), 1);
        assert_eq!(
            aus[0].nal_types(),
            vec![NalType::Sps, NalType::Pps, NalType::Idr]
        );
    }

    #[test]
    fn test_split_at_every_byte_offset() {
        let stream = annexb(&[SPS, PPS, IDR]);
        let mut reference = AuDemuxer::new();
        let expected = reference.feed_message(&stream);
        assert_eq!(expected.len(), 1);

        for split in 0..=stream.len() {
            let mut demuxer = AuDemuxer::new();
            let mut aus = demuxer.feed(&stream[..split]);
            aus.extend(demuxer.feed(&stream[split..]));
            aus.extend(demuxer.flush());
            assert_eq!(aus, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_incrementality_over_multiple_aus() {
        let mut stream = annexb(&[SPS, PPS, IDR]);
        stream.extend(annexb(&[SLICE]));
        stream.extend(annexb(&[SLICE]));

        let mut reference = AuDemuxer::new();
        let mut expected = reference.feed(&stream);
        expected.extend(reference.flush());
        assert_eq!(expected.len(), 3);

        for split in 0..=stream.len() {
            let mut demuxer = AuDemuxer::new();
            let mut aus = demuxer.feed(&stream[..split]);
            aus.extend(demuxer.feed(&stream[split..]));
            aus.extend(demuxer.flush());
            assert_eq!(aus, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_left_inverse_of_assembly() {
        // Feeding the assembled output of a sequence of AUs yields the same
        // sequence back.
        let mut demuxer = AuDemuxer::new();
        let mut first = demuxer.feed_message(&annexb(&[SPS, PPS, IDR]));
        first.extend(demuxer.feed_message(&annexb(&[SLICE])));
        assert_eq!(first.len(), 2);

        let mut replay = AuDemuxer::new();
        let mut replayed = Vec::new();
        for au in &first {
            replayed.extend(replay.feed_message(&au.to_annexb()));
        }
        assert_eq!(replayed, first);
    }

    #[test]
    fn test_strict_mode_holds_tail() {
        // Without a flush, the IDR tail is incomplete and nothing is emitted.
        let stream = annexb(&[SPS, PPS, IDR]);
        let mut demuxer = AuDemuxer::new();
        assert!(demuxer.feed(&stream).is_empty());
        // The end-of-stream flush completes it.
        let aus = demuxer.flush();
        assert_eq!(aus.len(), 1);
        assert!(aus[0].is_keyframe);
    }

    #[test]
    fn test_sps_parsed_from_stream() {
        let sps = super::super::h264::tests::make_sps(80, 45, 0);
        let stream = annexb(&[&sps, PPS, IDR]);
        let mut demuxer = AuDemuxer::new();
        let aus = demuxer.feed_message(&stream);
        assert_eq!(aus.len(), 1);

        let info = demuxer.sps_info().expect("sps parsed");
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.codec_string(), "avc1.42c01f");
    }

    #[test]
    fn test_slice_boundary_without_parameter_sets() {
        // Two slices of the same picture (first_mb_in_slice 0 then nonzero)
        // form one AU; the next first_mb==0 slice starts a new one.
        let slice_continued: &[u8] = &[0x41, 0x40, 0x26, 0x05]; // first_mb == 1
        let mut stream = annexb(&[SLICE]);
        stream.extend(annexb(&[slice_continued]));
        stream.extend(annexb(&[SLICE]));

        let mut demuxer = AuDemuxer::new();
        let aus = demuxer.feed_message(&stream);
        assert_eq!(aus.len(), 2);
        assert_eq!(aus[0].nals.len(), 2);
        assert_eq!(aus[1].nals.len(), 1);
    }

    #[test]
    fn test_garbage_split_across_feeds() {
        // Trailing zeros of a garbage prefix may be the start of a start
        // code arriving in the next chunk.
        let mut demuxer = AuDemuxer::new();
        assert!(demuxer.feed(&[0xAA, 0x00, 0x00]).is_empty());
        let mut stream = vec![0x01];
        stream.extend_from_slice(SPS);
        stream.extend(annexb(&[PPS, IDR]));
        let aus = demuxer.feed_message(&stream);
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].nals.len(), 3);
    }

    #[test]
    fn test_to_annexb_framing() {
        let mut demuxer = AuDemuxer::new();
        let aus = demuxer.feed_message(&annexb(&[SPS, PPS, IDR]));
        let assembled = aus[0].to_annexb();
        assert_eq!(&assembled[..], &annexb(&[SPS, PPS, IDR])[..]);
    }

    #[test]
    fn test_empty_and_tiny_feeds() {
        let mut demuxer = AuDemuxer::new();
        assert!(demuxer.feed(&[]).is_empty());
        assert!(demuxer.feed(&[0]).is_empty());
        assert!(demuxer.feed(&[0]).is_empty());
        assert!(demuxer.flush().is_empty());
    }
}
