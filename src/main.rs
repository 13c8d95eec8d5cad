//! kvmcast binary: wire the pump, the hub and the TLS front end together.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tokio::runtime::Handle;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kvmcast::error::Result;
use kvmcast::input::InputInjector;
use kvmcast::server::{tls, Server, ServerConfig, StaticFiles, ViewerHub};
use kvmcast::session::{Supervisor, SupervisorConfig};
use kvmcast::shutdown::{self, ShutdownHandle};
use kvmcast::video::EncoderSettings;
use kvmcast::Hub;

#[derive(Debug, Parser)]
#[command(name = "kvmcast", about = "KVM-over-IP video and input service")]
struct Args {
    /// TLS certificate chain (PEM)
    #[arg(long)]
    cert: PathBuf,

    /// TLS private key (PEM)
    #[arg(long)]
    key: PathBuf,

    /// HTTPS/WSS port
    #[arg(long, default_value_t = 8443)]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    listen: IpAddr,

    /// V4L2 capture device (HDMI bridge)
    #[arg(long, default_value = "/dev/video0")]
    device: PathBuf,

    /// V4L2 M2M H.264 encoder device
    #[arg(long, default_value = "/dev/video11")]
    encoder: PathBuf,

    /// Encoder bitrate in bits per second
    #[arg(long, default_value_t = 1_000_000)]
    bitrate: u32,

    /// Keyframe interval in frames
    #[arg(long, default_value_t = 3)]
    gop: u32,

    /// HID gadget keyboard device
    #[arg(long, default_value = "/dev/hidg0")]
    hid_keyboard: PathBuf,

    /// HID gadget mouse device
    #[arg(long, default_value = "/dev/hidg1")]
    hid_mouse: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tls_config = tls::load_server_config(&args.cert, &args.key)?;
    let assets = StaticFiles::embedded()?;

    let hub: Arc<ViewerHub> = Arc::new(Hub::new());
    let injector = Arc::new(InputInjector::open(&args.hid_keyboard, &args.hid_mouse));
    let stop = Arc::new(AtomicBool::new(false));
    let shutdown = ShutdownHandle::new(Arc::clone(&stop), Arc::clone(&injector));

    let pump = Supervisor::new(
        SupervisorConfig::new(&args.device, &args.encoder).settings(EncoderSettings {
            bitrate: args.bitrate,
            gop_size: args.gop,
        }),
        Arc::clone(&hub),
        Handle::current(),
        Arc::clone(&stop),
    )
    .spawn()?;
    let mut pump_task = tokio::task::spawn_blocking(move || pump.join());

    let server = Server::new(
        ServerConfig::new(SocketAddr::new(args.listen, args.port), &args.cert, &args.key),
        tls_config,
        assets,
        Arc::clone(&hub),
        injector,
    );

    // Either a signal stops the listener, or the pump ends on its own; a
    // fatal first-session failure must take the process down with it.
    let mut server_result = Ok(());
    let mut pump_joined = None;
    tokio::select! {
        result = server.run_until(shutdown::wait_for_signal()) => {
            server_result = result;
        }
        joined = &mut pump_task => {
            pump_joined = Some(joined);
        }
    }

    shutdown.shutdown();
    let pump_joined = match pump_joined {
        Some(joined) => joined,
        // The pump notices the stop flag within one dequeue interval.
        None => pump_task.await,
    };
    server_result?;

    match pump_joined {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => {
            warn!("video pump panicked");
            Ok(())
        }
        Err(err) => {
            warn!(%err, "failed to join video pump");
            Ok(())
        }
    }
}
