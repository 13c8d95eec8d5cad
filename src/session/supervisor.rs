//! Capture session supervisor
//!
//! Owns the video pump: the single OS thread that touches the V4L2 devices
//! and the DMABUF fds after init. One cycle is
//! dequeue -> encode -> requeue reclaimed slot -> broadcast, and broadcast of
//! frame N completes before frame N+1 is dequeued, so the encoder's mapped
//! bitstream is never read and recycled concurrently.
//!
//! Sessions are rebuilt from scratch on signal loss. Only the very first
//! bring-up is allowed to take the process down; after that the supervisor
//! keeps probing until the signal returns or shutdown is requested.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures_util::Sink;
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use tungstenite::Message;

use crate::error::{Error, Result, SessionError, VideoError};
use crate::hub::Hub;
use crate::session::state::{SessionLifecycle, MAX_CONSECUTIVE_TIMEOUTS};
use crate::stats::PumpStats;
use crate::video::{
    CaptureDevice, DmaHeap, EncoderSettings, FourCc, M2mEncoder, SlotTracker, SLOT_COUNT,
};

/// Devices, formats and pacing for the pump.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub capture_device: PathBuf,
    pub encoder_device: PathBuf,
    /// Pixel format requested from the HDMI bridge.
    pub fourcc: FourCc,
    pub settings: EncoderSettings,
    /// Capture dequeue deadline; three in a row end the session.
    pub dequeue_timeout: Duration,
    /// Pause between rebuild attempts while the signal is away.
    pub recover_backoff: Duration,
    pub stats_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(capture_device: impl Into<PathBuf>, encoder_device: impl Into<PathBuf>) -> Self {
        Self {
            capture_device: capture_device.into(),
            encoder_device: encoder_device.into(),
            fourcc: FourCc::UYVY,
            settings: EncoderSettings::default(),
            dequeue_timeout: Duration::from_secs(2),
            recover_backoff: Duration::from_secs(2),
            stats_interval: Duration::from_secs(5),
        }
    }

    pub fn settings(mut self, settings: EncoderSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Drives capture -> encode -> broadcast on a dedicated thread.
pub struct Supervisor<S> {
    config: SupervisorConfig,
    hub: Arc<Hub<S>>,
    runtime: Handle,
    stop: Arc<AtomicBool>,
}

impl<S> Supervisor<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    pub fn new(
        config: SupervisorConfig,
        hub: Arc<Hub<S>>,
        runtime: Handle,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            hub,
            runtime,
            stop,
        }
    }

    /// Start the pump thread.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name("video-pump".into())
            .spawn(move || self.run())
    }

    /// Session loop: probe, run, recover, until shutdown or a fatal
    /// first-session failure.
    pub fn run(&self) -> Result<()> {
        let mut lifecycle = SessionLifecycle::new();

        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(());
            }

            match self.run_session(&mut lifecycle) {
                // Clean exit only happens on shutdown request.
                Ok(()) => return Ok(()),
                Err(err) => {
                    if lifecycle.is_first_session() {
                        lifecycle.fatal();
                        error!(%err, "first session bring-up failed");
                        return Err(Error::Session(SessionError::FirstInitFailed(Box::new(
                            err,
                        ))));
                    }
                    lifecycle.begin_recovery();
                    warn!(%err, "session ended, waiting for signal");
                    self.backoff();
                }
            }
            lifecycle.begin_probe();
        }
    }

    /// One full session: bring-up, pump until shutdown (`Ok`) or until the
    /// session dies (`Err`: signal loss, encoder stall, device failure).
    fn run_session(&self, lifecycle: &mut SessionLifecycle) -> Result<()> {
        // Probing. The DMA buffers are sized from what the driver actually
        // granted, and the encoder binds the fds before capture queues them.
        let mut capture = CaptureDevice::open(&self.config.capture_device)?;
        let format = capture.negotiate_format(self.config.fourcc)?;

        let heap = DmaHeap::open_default()?;
        let buffers = heap.alloc_n(format.sizeimage as usize, SLOT_COUNT)?;

        let mut encoder = M2mEncoder::open(&self.config.encoder_device)?;
        encoder.init(format, self.config.settings, &buffers)?;
        capture.init(&buffers)?;

        lifecycle.session_started();
        if let Some(signal) = capture.signal_info() {
            info!(%signal, "session running");
        }

        let mut tracker = SlotTracker::new(SLOT_COUNT);
        let mut stats = PumpStats::new(self.config.stats_interval);

        let result = loop {
            if self.stop.load(Ordering::Relaxed) {
                break Ok(());
            }

            if self.hub.take_keyframe_request() {
                encoder.force_keyframe();
            }

            let frame = match capture.dequeue(self.config.dequeue_timeout) {
                Ok(frame) => {
                    lifecycle.on_frame();
                    frame
                }
                Err(VideoError::Timeout) => {
                    if lifecycle.on_timeout() {
                        break Err(Error::Session(SessionError::SignalLost(
                            MAX_CONSECUTIVE_TIMEOUTS,
                        )));
                    }
                    continue;
                }
                // Anything but a quiet interval means the device is wedged.
                Err(err) => break Err(err.into()),
            };
            track(tracker.captured(frame.index), "dequeue", frame.index);

            match encoder.encode(frame.index, frame.bytesused) {
                Ok(encoded) => {
                    track(tracker.sent_to_encoder(frame.index), "encode", frame.index);
                    let bytes = encoded.len();
                    let keyframe = encoded.is_keyframe();

                    // Return the freed DMABUF slot to the capture device
                    // before broadcast, which can stall on a slow viewer;
                    // the driver must not run short of buffers meanwhile.
                    if let Some(index) = encoded.reclaimed_index() {
                        track(tracker.reclaimed(index), "reclaim", index);
                        capture.queue(index)?;
                        track(tracker.requeued(index), "requeue", index);
                    }

                    // The bitstream borrow spans exactly this call; dropping
                    // the guard below requeues the slot.
                    let viewers = self.runtime.block_on(self.hub.broadcast(encoded.data()));
                    drop(encoded);

                    stats.record(bytes, keyframe, viewers);
                }
                Err(err) if err.is_timeout() => {
                    warn!(%err, "encoder stalled");
                    break Err(Error::Session(SessionError::EncoderStalled));
                }
                Err(err) => {
                    warn!(%err, index = frame.index, "encode failed, returning frame");
                    capture.queue(frame.index)?;
                    track(tracker.requeued(frame.index), "error requeue", frame.index);
                }
            }
        };

        // Draining. Buffers release when they drop at end of scope, after
        // both devices stopped referencing them.
        lifecycle.begin_drain();
        capture.stop();
        encoder.stop();
        info!(
            frames = stats.total_frames,
            keyframes = stats.total_keyframes,
            "session ended"
        );

        result
    }

    /// Sleep the recovery backoff, waking early on shutdown.
    fn backoff(&self) {
        let deadline = Instant::now() + self.config.recover_backoff;
        while Instant::now() < deadline {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

/// A rejected custody transition means a queue accounting bug; the kernel
/// still holds the real state, so the pump keeps going but complains.
fn track(ok: bool, stage: &str, index: u32) {
    if !ok {
        warn!(stage, index, "slot custody violation");
    }
}
