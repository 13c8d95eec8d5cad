//! kvmcast: a single-box KVM-over-IP core
//!
//! Captures an HDMI signal through a V4L2 device, hardware-encodes it to
//! H.264 via a V4L2 memory-to-memory codec, and fans the bitstream out to
//! browsers over TLS WebSockets. Keyboard and mouse events come back on the
//! same sockets as JSON and are injected into the attached host through USB
//! HID gadget devices.
//!
//! ```text
//! HDMI -> capture (DMABUF) -> M2M encoder -> supervisor pump
//!                                               |
//!                                               v
//!                  browsers <- TLS WebSocket <- hub (fan-out)
//!                      |
//!                      v JSON input events
//!                  injector -> /dev/hidg*
//! ```
//!
//! The capture and encoder share one set of DMA-heap buffers by fd, so
//! pixels never enter user space; only the encoded bitstream is mapped, and
//! it is borrowed rather than copied for the duration of each broadcast.
//!
//! The pump is deliberately single-threaded to keep V4L2 queue state serial.
//! Parallelism exists only across client connections and between the pump
//! and the HTTPS acceptor.

pub mod error;
pub mod hub;
pub mod input;
pub mod media;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stats;
pub mod video;

pub use error::{Error, Result};
pub use hub::Hub;
pub use input::InputInjector;
pub use media::{AccessUnit, AuDemuxer, SpsInfo};
pub use server::{Server, ServerConfig, StaticFiles, ViewerHub};
pub use session::{Supervisor, SupervisorConfig};
pub use video::EncoderSettings;
