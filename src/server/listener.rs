//! TLS listener and protocol dispatch
//!
//! One accept loop, one spawned task per connection. Each task terminates
//! TLS, reads the first request head, and routes it: WebSocket upgrades
//! enter the viewer frame loop, everything else gets a static-file response
//! and `Connection: close`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::input::InputInjector;
use crate::server::assets::StaticFiles;
use crate::server::config::ServerConfig;
use crate::server::request::{read_request_head, RequestHead};
use crate::server::ws::{serve_websocket, ViewerHub};

/// The HTTPS/WSS front end.
pub struct Server {
    config: ServerConfig,
    acceptor: TlsAcceptor,
    assets: Arc<StaticFiles>,
    hub: Arc<ViewerHub>,
    injector: Arc<InputInjector>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        tls_config: Arc<rustls::ServerConfig>,
        assets: StaticFiles,
        hub: Arc<ViewerHub>,
        injector: Arc<InputInjector>,
    ) -> Self {
        Self {
            config,
            acceptor: TlsAcceptor::from(tls_config),
            assets: Arc::new(assets),
            hub,
            injector,
        }
    }

    /// Run the accept loop until the shutdown future resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "https listening");

        tokio::select! {
            _ = shutdown => {
                info!("listener shutting down");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => self.handle_connection(socket, peer),
                Err(err) => warn!(%err, "accept failed"),
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer: SocketAddr) {
        if self.config.tcp_nodelay {
            if let Err(err) = socket.set_nodelay(true) {
                warn!(%peer, %err, "TCP_NODELAY failed");
            }
        }

        let acceptor = self.acceptor.clone();
        let assets = Arc::clone(&self.assets);
        let hub = Arc::clone(&self.hub);
        let injector = Arc::clone(&self.injector);
        let config = self.config.clone();

        tokio::spawn(async move {
            debug!(%peer, "connection opened");
            if let Err(err) = handle(socket, peer, acceptor, assets, hub, injector, config).await {
                debug!(%peer, %err, "connection closed with error");
            } else {
                debug!(%peer, "connection closed");
            }
        });
    }
}

async fn handle(
    socket: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    assets: Arc<StaticFiles>,
    hub: Arc<ViewerHub>,
    injector: Arc<InputInjector>,
    config: ServerConfig,
) -> Result<()> {
    let mut stream = acceptor.accept(socket).await?;

    let (head_text, rest) = read_request_head(&mut stream, config.max_request_head).await?;
    let head = RequestHead::parse(&head_text)?;

    if head.is_websocket_upgrade() {
        serve_websocket(
            stream,
            &head,
            rest,
            peer.to_string(),
            hub,
            injector,
            config.max_message_size,
        )
        .await?;
    } else {
        // Query strings never select a different asset.
        let path = head.path.split('?').next().unwrap_or("/");
        debug!(%peer, method = %head.method, path, "static request");
        let response = assets.response_for(path);
        stream.write_all(&response).await?;
        stream.shutdown().await?;
    }

    Ok(())
}
