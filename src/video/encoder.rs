//! V4L2 memory-to-memory H.264 encoder
//!
//! Queue roles:
//! - OUTPUT (raw frames in): DMABUF mode, slot i permanently paired with the
//!   session's DMA buffer i. Queuing a slot hands the capture frame to the
//!   codec without a copy.
//! - CAPTURE (bitstream out): MMAP mode, count chosen by the driver, mapped
//!   once at init and recycled for the whole session.
//!
//! The encode cycle returns an [`EncodedFrame`] guard borrowing the mapped
//! bitstream; dropping the guard requeues the CAPTURE slot, so the bytes can
//! never be recycled while a reader still holds them.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::error::VideoError;
use crate::video::dma::DmaBuffer;
use crate::video::format::{CaptureFormat, FourCc};
use crate::video::sys;

const ENCODER_POLL_TIMEOUT: Duration = Duration::from_secs(5);
/// Bitstream slot size; a safe ceiling for one encoded unit at any
/// supported resolution and bitrate.
const BITSTREAM_SLOT_SIZE: u32 = 512 * 1024;

/// Rate-control and GOP settings applied at init.
#[derive(Debug, Clone, Copy)]
pub struct EncoderSettings {
    pub bitrate: u32,
    pub gop_size: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bitrate: 1_000_000,
            gop_size: 3,
        }
    }
}

struct BitstreamSlot {
    region: sys::MmapRegion,
    length: u32,
}

/// Stateful M2M encoder device.
pub struct M2mEncoder {
    file: File,
    path: String,
    /// DMABUF fd + length per OUTPUT slot, same indexing as the capture side.
    output_slots: Vec<(RawFd, u32)>,
    bitstream_slots: Vec<BitstreamSlot>,
    streaming: bool,
}

impl M2mEncoder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path_str = path.as_ref().display().to_string();
        // Non-blocking so the OUTPUT reclaim dequeue can report "nothing yet"
        // instead of stalling the pump.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path.as_ref())
            .map_err(|source| VideoError::OpenFailed {
                path: path_str.clone(),
                source,
            })?;
        Ok(Self {
            file,
            path: path_str,
            output_slots: Vec::new(),
            bitstream_slots: Vec::new(),
            streaming: false,
        })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Full bring-up. The setup order is mandated by the stateful-encoder
    /// contract: formats, controls, OUTPUT buffers, CAPTURE buffers, then
    /// STREAMON OUTPUT before CAPTURE.
    pub fn init(
        &mut self,
        format: CaptureFormat,
        settings: EncoderSettings,
        dmabufs: &[DmaBuffer],
    ) -> Result<(), VideoError> {
        let mut caps: sys::v4l2_capability = sys::zeroed();
        sys::retry_eintr(|| unsafe { sys::vidioc_querycap(self.fd(), &mut caps) })
            .map_err(VideoError::QueryCapFailed)?;
        if caps.capabilities & sys::V4L2_CAP_VIDEO_M2M_MPLANE == 0 {
            return Err(VideoError::NotEncoder);
        }
        if caps.capabilities & sys::V4L2_CAP_STREAMING == 0 {
            return Err(VideoError::NoStreaming);
        }

        self.set_format_output(format)?;
        self.set_format_bitstream(format)?;
        self.apply_settings(settings)?;
        self.request_output_buffers(dmabufs)?;
        self.setup_bitstream_buffers(dmabufs.len() as u32)?;

        self.stream_on(sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE)?;
        self.stream_on(sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE)?;
        self.streaming = true;

        info!(
            device = %self.path,
            bitrate = settings.bitrate,
            gop = settings.gop_size,
            slots = self.output_slots.len(),
            bitstream_slots = self.bitstream_slots.len(),
            "encoder streaming"
        );
        Ok(())
    }

    fn set_format_output(&mut self, format: CaptureFormat) -> Result<(), VideoError> {
        let mut fmt: sys::v4l2_format = sys::zeroed();
        fmt.type_ = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE;
        unsafe {
            let pix = &mut fmt.fmt.pix_mp;
            pix.width = format.width;
            pix.height = format.height;
            pix.pixelformat = format.fourcc.raw();
            pix.field = sys::V4L2_FIELD_NONE;
            pix.num_planes = 1;
            pix.plane_fmt[0].sizeimage = format.sizeimage;
            pix.plane_fmt[0].bytesperline = format.bytesperline;
        }
        sys::retry_eintr(|| unsafe { sys::vidioc_s_fmt(self.fd(), &mut fmt) })
            .map_err(VideoError::SetFormatFailed)
            .map(|_| ())
    }

    fn set_format_bitstream(&mut self, format: CaptureFormat) -> Result<(), VideoError> {
        let mut fmt: sys::v4l2_format = sys::zeroed();
        fmt.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        unsafe {
            let pix = &mut fmt.fmt.pix_mp;
            pix.width = format.width;
            pix.height = format.height;
            pix.pixelformat = FourCc::H264.raw();
            pix.field = sys::V4L2_FIELD_NONE;
            pix.num_planes = 1;
            pix.plane_fmt[0].sizeimage = BITSTREAM_SLOT_SIZE;
        }
        sys::retry_eintr(|| unsafe { sys::vidioc_s_fmt(self.fd(), &mut fmt) })
            .map_err(VideoError::SetFormatFailed)
            .map(|_| ())
    }

    fn apply_settings(&mut self, settings: EncoderSettings) -> Result<(), VideoError> {
        self.set_control(sys::V4L2_CID_MPEG_VIDEO_BITRATE, settings.bitrate as i32)?;
        self.set_control(
            sys::V4L2_CID_MPEG_VIDEO_H264_I_PERIOD,
            settings.gop_size as i32,
        )?;
        self.set_control(
            sys::V4L2_CID_MPEG_VIDEO_H264_PROFILE,
            sys::V4L2_MPEG_VIDEO_H264_PROFILE_CONSTRAINED_BASELINE,
        )?;
        // Late joiners self-synchronize on the next keyframe only if the
        // parameter sets ride along with every IDR.
        self.set_control(sys::V4L2_CID_MPEG_VIDEO_REPEAT_SEQ_HEADER, 1)?;
        // Not every codec exposes these two; the I-period above already pins
        // the GOP for H.264.
        self.try_set_control(sys::V4L2_CID_MPEG_VIDEO_GOP_SIZE, settings.gop_size as i32);
        self.try_set_control(sys::V4L2_CID_MPEG_VIDEO_B_FRAMES, 0);
        Ok(())
    }

    fn set_control(&self, id: u32, value: i32) -> Result<(), VideoError> {
        let mut ctrl = sys::v4l2_control { id, value };
        sys::retry_eintr(|| unsafe { sys::vidioc_s_ctrl(self.fd(), &mut ctrl) })
            .map_err(|errno| VideoError::SetControlFailed { id, errno })
            .map(|_| ())
    }

    fn try_set_control(&self, id: u32, value: i32) {
        if let Err(err) = self.set_control(id, value) {
            warn!(device = %self.path, %err, "optional encoder control rejected");
        }
    }

    fn request_output_buffers(&mut self, dmabufs: &[DmaBuffer]) -> Result<(), VideoError> {
        let mut req: sys::v4l2_requestbuffers = sys::zeroed();
        req.count = dmabufs.len() as u32;
        req.type_ = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE;
        req.memory = sys::V4L2_MEMORY_DMABUF;
        sys::retry_eintr(|| unsafe { sys::vidioc_reqbufs(self.fd(), &mut req) })
            .map_err(VideoError::ReqBufsFailed)?;

        self.output_slots = dmabufs.iter().map(|b| (b.fd(), b.len() as u32)).collect();
        Ok(())
    }

    fn setup_bitstream_buffers(&mut self, count: u32) -> Result<(), VideoError> {
        let mut req: sys::v4l2_requestbuffers = sys::zeroed();
        req.count = count;
        req.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        req.memory = sys::V4L2_MEMORY_MMAP;
        sys::retry_eintr(|| unsafe { sys::vidioc_reqbufs(self.fd(), &mut req) })
            .map_err(VideoError::ReqBufsFailed)?;

        // The driver picks the final count.
        for index in 0..req.count {
            let mut plane: sys::v4l2_plane = sys::zeroed();
            let mut buf: sys::v4l2_buffer = sys::zeroed();
            buf.index = index;
            buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
            buf.memory = sys::V4L2_MEMORY_MMAP;
            buf.length = 1;
            buf.m.planes = &mut plane;
            sys::retry_eintr(|| unsafe { sys::vidioc_querybuf(self.fd(), &mut buf) })
                .map_err(VideoError::QueryBufFailed)?;

            let length = plane.length;
            let offset = unsafe { plane.m.mem_offset };
            let region = sys::MmapRegion::map(self.fd(), offset as libc::off_t, length as usize)
                .map_err(VideoError::MmapFailed)?;
            self.bitstream_slots.push(BitstreamSlot { region, length });

            self.queue_bitstream_slot(index)?;
        }

        debug!(device = %self.path, count = req.count, "bitstream slots mapped");
        Ok(())
    }

    fn queue_bitstream_slot(&self, index: u32) -> Result<(), VideoError> {
        let mut plane: sys::v4l2_plane = sys::zeroed();
        plane.length = self.bitstream_slots[index as usize].length;

        let mut buf: sys::v4l2_buffer = sys::zeroed();
        buf.index = index;
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        buf.memory = sys::V4L2_MEMORY_MMAP;
        buf.length = 1;
        buf.m.planes = &mut plane;
        sys::retry_eintr(|| unsafe { sys::vidioc_qbuf(self.fd(), &mut buf) })
            .map_err(VideoError::QBufFailed)
            .map(|_| ())
    }

    fn stream_on(&self, type_: u32) -> Result<(), VideoError> {
        let type_: libc::c_int = type_ as libc::c_int;
        sys::retry_eintr(|| unsafe { sys::vidioc_streamon(self.fd(), &type_) })
            .map_err(VideoError::StreamOnFailed)
            .map(|_| ())
    }

    /// Push capture slot `index` through the codec and borrow the resulting
    /// bitstream.
    ///
    /// Also drains at most one consumed OUTPUT slot; its index is reported on
    /// the returned frame so the pump can requeue that DMABUF on the capture
    /// device.
    pub fn encode(
        &mut self,
        index: u32,
        bytesused: u32,
    ) -> Result<EncodedFrame<'_>, VideoError> {
        if !self.streaming {
            return Err(VideoError::NotStreaming);
        }

        self.queue_output_slot(index, bytesused)?;

        let ready = sys::poll_readable(self.fd(), ENCODER_POLL_TIMEOUT.as_millis() as i32)
            .map_err(VideoError::PollFailed)?;
        if !ready {
            return Err(VideoError::PollTimeout);
        }

        let mut plane: sys::v4l2_plane = sys::zeroed();
        let mut buf: sys::v4l2_buffer = sys::zeroed();
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        buf.memory = sys::V4L2_MEMORY_MMAP;
        buf.length = 1;
        buf.m.planes = &mut plane;
        sys::retry_eintr(|| unsafe { sys::vidioc_dqbuf(self.fd(), &mut buf) })
            .map_err(VideoError::DQBufFailed)?;

        let keyframe = buf.flags & sys::V4L2_BUF_FLAG_KEYFRAME != 0;
        let bitstream_index = buf.index;
        let bytes = plane.bytesused;

        let reclaimed = self.reclaim_output_slot()?;

        Ok(EncodedFrame {
            encoder: self,
            bitstream_index,
            bytesused: bytes,
            keyframe,
            reclaimed,
        })
    }

    fn queue_output_slot(&self, index: u32, bytesused: u32) -> Result<(), VideoError> {
        let (fd, length) = self.output_slots[index as usize];

        let mut plane: sys::v4l2_plane = sys::zeroed();
        plane.bytesused = bytesused;
        plane.length = length;
        plane.m.fd = fd;

        let mut buf: sys::v4l2_buffer = sys::zeroed();
        buf.index = index;
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE;
        buf.memory = sys::V4L2_MEMORY_DMABUF;
        buf.length = 1;
        buf.m.planes = &mut plane;
        sys::retry_eintr(|| unsafe { sys::vidioc_qbuf(self.fd(), &mut buf) })
            .map_err(VideoError::QBufFailed)
            .map(|_| ())
    }

    /// Non-blocking drain of one consumed OUTPUT slot.
    fn reclaim_output_slot(&self) -> Result<Option<u32>, VideoError> {
        let mut plane: sys::v4l2_plane = sys::zeroed();
        let mut buf: sys::v4l2_buffer = sys::zeroed();
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE;
        buf.memory = sys::V4L2_MEMORY_DMABUF;
        buf.length = 1;
        buf.m.planes = &mut plane;
        match sys::retry_eintr(|| unsafe { sys::vidioc_dqbuf(self.fd(), &mut buf) }) {
            Ok(_) => Ok(Some(buf.index)),
            Err(Errno::EAGAIN) => Ok(None),
            Err(errno) => Err(VideoError::DQBufFailed(errno)),
        }
    }

    /// Ask the codec to emit an IDR on the next frame.
    pub fn force_keyframe(&self) {
        // Best effort; a missed request only delays sync by one GOP.
        if let Err(err) = self.set_control(sys::V4L2_CID_MPEG_VIDEO_FORCE_KEY_FRAME, 1) {
            warn!(device = %self.path, %err, "keyframe request rejected");
        }
    }

    /// Stop both queues. Mapped bitstream slots stay valid until drop.
    pub fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        for type_ in [
            sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        ] {
            let type_: libc::c_int = type_ as libc::c_int;
            if let Err(errno) =
                sys::retry_eintr(|| unsafe { sys::vidioc_streamoff(self.fd(), &type_) })
            {
                warn!(device = %self.path, %errno, "encoder STREAMOFF failed");
            }
        }
        self.streaming = false;
        debug!(device = %self.path, "encoder stopped");
    }
}

impl Drop for M2mEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Borrowed view of one encoded unit.
///
/// Holds the CAPTURE slot out of the driver's hands; dropping the guard
/// requeues it. The borrow therefore spans exactly the broadcast call in the
/// single-threaded pump.
pub struct EncodedFrame<'a> {
    encoder: &'a M2mEncoder,
    bitstream_index: u32,
    bytesused: u32,
    keyframe: bool,
    reclaimed: Option<u32>,
}

impl EncodedFrame<'_> {
    /// The encoded bytes: one or more Annex-B-prefixed NAL units.
    pub fn data(&self) -> &[u8] {
        self.encoder.bitstream_slots[self.bitstream_index as usize]
            .region
            .as_slice(self.bytesused as usize)
    }

    pub fn len(&self) -> usize {
        self.bytesused as usize
    }

    pub fn is_empty(&self) -> bool {
        self.bytesused == 0
    }

    pub fn is_keyframe(&self) -> bool {
        self.keyframe
    }

    /// OUTPUT slot the codec released this cycle, if any. The pump requeues
    /// that DMABUF on the capture device.
    pub fn reclaimed_index(&self) -> Option<u32> {
        self.reclaimed
    }
}

impl Drop for EncodedFrame<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.encoder.queue_bitstream_slot(self.bitstream_index) {
            warn!(%err, index = self.bitstream_index, "bitstream slot requeue failed");
        }
    }
}
