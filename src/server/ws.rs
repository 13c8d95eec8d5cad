//! WebSocket viewer sessions
//!
//! The upgrade request head was already consumed by the classifier, so the
//! RFC 6455 response is written by hand from the parsed key and the frame
//! codec is attached directly to the TLS stream. Any bytes the peer sent
//! after its request head are replayed through [`PrefixedStream`] so the
//! codec sees an intact byte stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::SplitSink;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use tungstenite::handshake::derive_accept_key;
use tungstenite::protocol::{Role, WebSocketConfig};
use tungstenite::Message;

use crate::error::ProtocolError;
use crate::hub::Hub;
use crate::input::InputInjector;
use crate::server::request::RequestHead;

/// Byte stream a viewer session runs over.
pub type ViewerStream = PrefixedStream<TlsStream<TcpStream>>;
/// Write half handed to the hub.
pub type ViewerSink = SplitSink<WebSocketStream<ViewerStream>, Message>;
/// The hub type the server wires together.
pub type ViewerHub = Hub<ViewerSink>;

/// Complete the handshake and run the viewer until it disconnects.
pub async fn serve_websocket(
    mut stream: TlsStream<TcpStream>,
    head: &RequestHead,
    rest: Vec<u8>,
    peer: String,
    hub: Arc<ViewerHub>,
    injector: Arc<InputInjector>,
    max_message_size: usize,
) -> Result<(), ProtocolError> {
    let key = head.websocket_key().ok_or(ProtocolError::BadRequest)?;
    let accept = derive_accept_key(key.as_bytes());

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|_| ProtocolError::TruncatedRequest)?;
    stream
        .flush()
        .await
        .map_err(|_| ProtocolError::TruncatedRequest)?;

    let config = WebSocketConfig {
        max_message_size: Some(max_message_size),
        max_frame_size: Some(max_message_size),
        ..Default::default()
    };
    let ws = WebSocketStream::from_raw_socket(
        PrefixedStream::new(rest, stream),
        Role::Server,
        Some(config),
    )
    .await;

    let (sink, mut source) = ws.split();
    let id = hub.add(peer, sink).await;

    // Frames out of this loop are client input only; video flows the other
    // way through the hub-held sink.
    let mut close_error = None;
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => injector.handle_text(&text),
            Ok(Message::Binary(_)) => debug!("ignoring binary frame from viewer"),
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong handled by the protocol layer
            Err(err) => {
                close_error = Some(err);
                break;
            }
        }
    }

    hub.remove(id).await;
    match close_error {
        Some(err) => Err(ProtocolError::Ws(err)),
        None => Ok(()),
    }
}

/// Replays a fixed prefix before reading from the inner stream; writes pass
/// straight through.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.pos += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
