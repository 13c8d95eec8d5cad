//! DMA heap allocation
//!
//! Buffers come from the kernel DMA heap so the same fd can be queued on the
//! capture device and the encoder's OUTPUT queue without any user-space
//! copies. The process owns each fd; the drivers only ever see it through
//! `QBUF`.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::VideoError;
use crate::video::sys;

/// Contiguous-memory heap exposed by the CMA driver; preferred because the
/// Pi's codec block requires physically contiguous frames.
pub const CMA_HEAP: &str = "/dev/dma_heap/linux,cma";
/// Fallback heap on kernels without a CMA region.
pub const SYSTEM_HEAP: &str = "/dev/dma_heap/system";

/// One kernel DMA buffer: an fd plus its length.
///
/// The fd is closed when the buffer drops, which releases the kernel memory
/// once the drivers have also dropped their references.
#[derive(Debug)]
pub struct DmaBuffer {
    fd: OwnedFd,
    len: usize,
}

impl DmaBuffer {
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Handle to a DMA heap device, scoped to one capture session.
pub struct DmaHeap {
    file: File,
    path: PathBuf,
}

impl DmaHeap {
    /// Open the CMA heap, falling back to the system heap.
    pub fn open_default() -> Result<Self, VideoError> {
        match Self::open(CMA_HEAP) {
            Ok(heap) => Ok(heap),
            Err(_) => Self::open(SYSTEM_HEAP),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| VideoError::OpenFailed {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { file, path })
    }

    /// Allocate one buffer of `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<DmaBuffer, VideoError> {
        let mut data: sys::dma_heap_allocation_data = sys::zeroed();
        data.len = len as u64;
        data.fd_flags = (libc::O_RDWR | libc::O_CLOEXEC) as u32;

        sys::retry_eintr(|| unsafe {
            sys::dma_heap_ioctl_alloc(self.file.as_raw_fd(), &mut data)
        })
        .map_err(|errno| VideoError::AllocFailed { len, errno })?;

        debug!(heap = %self.path.display(), fd = data.fd, len, "allocated dma buffer");

        // Safety: the ioctl returned a fresh fd that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) };
        Ok(DmaBuffer { fd, len })
    }

    /// Allocate the fixed per-session buffer set.
    pub fn alloc_n(&self, len: usize, count: usize) -> Result<Vec<DmaBuffer>, VideoError> {
        (0..count).map(|_| self.alloc(len)).collect()
    }
}
