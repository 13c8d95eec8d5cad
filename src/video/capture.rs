//! V4L2 capture bound to externally-owned DMABUFs
//!
//! The capture device never allocates pixel memory of its own: it queues the
//! session's DMA-heap buffers and the kernel fills them. User space only
//! ever moves the fds between queues.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::VideoError;
use crate::video::dma::DmaBuffer;
use crate::video::format::{CaptureFormat, FourCc, SignalInfo};
use crate::video::sys;

/// One filled buffer handed back by the driver.
#[derive(Debug, Clone, Copy)]
pub struct DequeuedFrame {
    pub index: u32,
    pub bytesused: u32,
}

/// A streaming V4L2 capture device.
pub struct CaptureDevice {
    file: File,
    path: String,
    /// fd + length per DMABUF slot; index is the slot identity.
    slots: Vec<(RawFd, u32)>,
    format: Option<CaptureFormat>,
    streaming: bool,
}

impl CaptureDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path_str = path.as_ref().display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|source| VideoError::OpenFailed {
                path: path_str.clone(),
                source,
            })?;
        Ok(Self {
            file,
            path: path_str,
            slots: Vec::new(),
            format: None,
            streaming: false,
        })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Negotiate the pixel format and read back what the driver granted.
    ///
    /// Split out from [`init`](Self::init) so the supervisor can size the
    /// DMA buffers from `sizeimage` before it has any to bind.
    pub fn negotiate_format(&mut self, fourcc: FourCc) -> Result<CaptureFormat, VideoError> {
        let mut caps: sys::v4l2_capability = sys::zeroed();
        sys::retry_eintr(|| unsafe { sys::vidioc_querycap(self.fd(), &mut caps) })
            .map_err(VideoError::QueryCapFailed)?;

        if caps.capabilities & sys::V4L2_CAP_VIDEO_CAPTURE == 0 {
            return Err(VideoError::NotCaptureDevice);
        }
        if caps.capabilities & sys::V4L2_CAP_STREAMING == 0 {
            return Err(VideoError::NoStreaming);
        }

        let mut fmt: sys::v4l2_format = sys::zeroed();
        fmt.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        sys::retry_eintr(|| unsafe { sys::vidioc_g_fmt(self.fd(), &mut fmt) })
            .map_err(VideoError::GetFormatFailed)?;

        // Keep the driver's geometry (set upstream by the EDID/signal probe),
        // request only our pixel format.
        unsafe {
            fmt.fmt.pix.pixelformat = fourcc.raw();
            fmt.fmt.pix.field = sys::V4L2_FIELD_NONE;
        }
        sys::retry_eintr(|| unsafe { sys::vidioc_s_fmt(self.fd(), &mut fmt) })
            .map_err(VideoError::SetFormatFailed)?;

        // The driver may have narrowed the request; its answer is binding.
        let granted = unsafe {
            CaptureFormat {
                fourcc: FourCc(fmt.fmt.pix.pixelformat),
                width: fmt.fmt.pix.width,
                height: fmt.fmt.pix.height,
                sizeimage: fmt.fmt.pix.sizeimage,
                bytesperline: fmt.fmt.pix.bytesperline,
            }
        };

        if granted.fourcc != fourcc {
            warn!(
                device = %self.path,
                requested = %fourcc,
                granted = %granted.fourcc,
                "driver substituted pixel format"
            );
        }
        info!(
            device = %self.path,
            format = %granted.fourcc,
            width = granted.width,
            height = granted.height,
            sizeimage = granted.sizeimage,
            "capture format negotiated"
        );

        self.format = Some(granted);
        Ok(granted)
    }

    /// Bind the session's DMABUFs, queue them all, and start streaming.
    ///
    /// [`negotiate_format`](Self::negotiate_format) must have run first.
    pub fn init(&mut self, dmabufs: &[DmaBuffer]) -> Result<(), VideoError> {
        debug_assert!(self.format.is_some(), "negotiate_format must run before init");

        let mut req: sys::v4l2_requestbuffers = sys::zeroed();
        req.count = dmabufs.len() as u32;
        req.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = sys::V4L2_MEMORY_DMABUF;
        sys::retry_eintr(|| unsafe { sys::vidioc_reqbufs(self.fd(), &mut req) })
            .map_err(VideoError::ReqBufsFailed)?;

        self.slots = dmabufs.iter().map(|b| (b.fd(), b.len() as u32)).collect();

        for index in 0..self.slots.len() as u32 {
            self.queue(index)?;
        }

        let type_: libc::c_int = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        sys::retry_eintr(|| unsafe { sys::vidioc_streamon(self.fd(), &type_) })
            .map_err(VideoError::StreamOnFailed)?;
        self.streaming = true;

        info!(device = %self.path, buffers = self.slots.len(), "capture streaming");
        Ok(())
    }

    /// Wait up to `timeout` for a filled buffer.
    ///
    /// `Timeout` is a distinct error so the caller can count stalls without
    /// tearing the session down on the first quiet interval.
    pub fn dequeue(&mut self, timeout: Duration) -> Result<DequeuedFrame, VideoError> {
        if !self.streaming {
            return Err(VideoError::NotStreaming);
        }

        let ready = sys::poll_readable(self.fd(), timeout.as_millis() as i32)
            .map_err(VideoError::PollFailed)?;
        if !ready {
            return Err(VideoError::Timeout);
        }

        let mut buf: sys::v4l2_buffer = sys::zeroed();
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = sys::V4L2_MEMORY_DMABUF;
        sys::retry_eintr(|| unsafe { sys::vidioc_dqbuf(self.fd(), &mut buf) })
            .map_err(VideoError::DQBufFailed)?;

        Ok(DequeuedFrame {
            index: buf.index,
            bytesused: buf.bytesused,
        })
    }

    /// Return slot `index` to the driver.
    ///
    /// Every successful dequeue must be balanced by a queue, either here or
    /// via the encoder's OUTPUT reclaim path.
    pub fn queue(&mut self, index: u32) -> Result<(), VideoError> {
        let (fd, length) = self.slots[index as usize];

        let mut buf: sys::v4l2_buffer = sys::zeroed();
        buf.index = index;
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = sys::V4L2_MEMORY_DMABUF;
        buf.m.fd = fd;
        buf.length = length;
        sys::retry_eintr(|| unsafe { sys::vidioc_qbuf(self.fd(), &mut buf) })
            .map_err(VideoError::QBufFailed)
            .map(|_| ())
    }

    /// Stop streaming. The DMABUF fds stay valid; they are not ours to close.
    pub fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        let type_: libc::c_int = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        if let Err(errno) =
            sys::retry_eintr(|| unsafe { sys::vidioc_streamoff(self.fd(), &type_) })
        {
            warn!(device = %self.path, %errno, "capture STREAMOFF failed");
        }
        self.streaming = false;
        debug!(device = %self.path, "capture stopped");
    }

    pub fn format(&self) -> Option<CaptureFormat> {
        self.format
    }

    /// Negotiated geometry plus the driver's frame interval, when it
    /// reports one.
    pub fn signal_info(&self) -> Option<SignalInfo> {
        let format = self.format?;

        let mut parm: sys::v4l2_streamparm = sys::zeroed();
        parm.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let fps = match sys::retry_eintr(|| unsafe { sys::vidioc_g_parm(self.fd(), &mut parm) }) {
            Ok(_) => {
                let tpf = unsafe { parm.parm.capture.timeperframe };
                if tpf.numerator > 0 && tpf.denominator > 0 {
                    tpf.denominator / tpf.numerator
                } else {
                    0
                }
            }
            Err(_) => 0,
        };

        Some(SignalInfo {
            width: format.width,
            height: format.height,
            fps,
        })
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
