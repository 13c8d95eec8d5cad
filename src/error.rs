//! Error types for kvmcast
//!
//! Each domain has its own error enum; the crate-level [`Error`] folds them
//! together for callers that cross domains (the binary, the supervisor).

use nix::errno::Errno;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("video: {0}")]
    Video(#[from] VideoError),

    #[error("media: {0}")]
    Media(#[from] MediaError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the DMABUF heap and the two V4L2 devices
#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("VIDIOC_QUERYCAP failed: {0}")]
    QueryCapFailed(Errno),

    #[error("device does not support video capture")]
    NotCaptureDevice,

    #[error("device does not support memory-to-memory encoding")]
    NotEncoder,

    #[error("device does not support streaming I/O")]
    NoStreaming,

    #[error("VIDIOC_G_FMT failed: {0}")]
    GetFormatFailed(Errno),

    #[error("VIDIOC_S_FMT failed: {0}")]
    SetFormatFailed(Errno),

    #[error("VIDIOC_REQBUFS failed: {0}")]
    ReqBufsFailed(Errno),

    #[error("VIDIOC_QUERYBUF failed: {0}")]
    QueryBufFailed(Errno),

    #[error("VIDIOC_QBUF failed: {0}")]
    QBufFailed(Errno),

    #[error("VIDIOC_DQBUF failed: {0}")]
    DQBufFailed(Errno),

    #[error("VIDIOC_STREAMON failed: {0}")]
    StreamOnFailed(Errno),

    #[error("VIDIOC_S_CTRL({id:#x}) failed: {errno}")]
    SetControlFailed { id: u32, errno: Errno },

    #[error("no frame within the dequeue deadline")]
    Timeout,

    #[error("encoder produced no output within the poll deadline")]
    PollTimeout,

    #[error("poll failed: {0}")]
    PollFailed(std::io::Error),

    #[error("device is not streaming")]
    NotStreaming,

    #[error("DMA heap allocation of {len} bytes failed: {errno}")]
    AllocFailed { len: usize, errno: Errno },

    #[error("mmap of encoded buffer failed: {0}")]
    MmapFailed(std::io::Error),
}

impl VideoError {
    /// Whether this error means "no signal right now" rather than a broken device.
    pub fn is_timeout(&self) -> bool {
        matches!(self, VideoError::Timeout | VideoError::PollTimeout)
    }
}

/// Errors from the H.264 byte-stream layer
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("SPS truncated after {0} bits")]
    SpsTruncated(usize),

    #[error("SPS field out of range: {0}")]
    SpsInvalid(&'static str),

    #[error("not an SPS NAL unit")]
    NotSps,
}

/// Errors from the HTTP/WebSocket front end
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("request head exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("malformed HTTP request")]
    BadRequest,

    #[error("peer closed before completing the request")]
    TruncatedRequest,

    #[error("websocket: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("bad control frame: {0}")]
    BadControlFrame(#[from] serde_json::Error),
}

/// Errors that end a capture session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("capture signal lost ({0} consecutive dequeue timeouts)")]
    SignalLost(u32),

    #[error("encoder stalled")]
    EncoderStalled,

    #[error("first session bring-up failed: {0}")]
    FirstInitFailed(#[source] Box<Error>),
}
