//! Zero-copy video pipeline: DMA heap, V4L2 capture, V4L2 M2M encoder
//!
//! One set of DMA buffers is shared by fd between the capture device and the
//! encoder's OUTPUT queue; frames travel between the two drivers without
//! entering user space. Only the encoded bitstream is ever mapped.

pub mod capture;
pub mod dma;
pub mod encoder;
pub mod format;
pub mod slots;
pub mod sys;

pub use capture::{CaptureDevice, DequeuedFrame};
pub use dma::{DmaBuffer, DmaHeap};
pub use encoder::{EncodedFrame, EncoderSettings, M2mEncoder};
pub use format::{CaptureFormat, FourCc, SignalInfo};
pub use slots::{SlotState, SlotTracker};

/// Number of shared DMABUF slots per session.
pub const SLOT_COUNT: usize = 6;
