//! TLS/HTTP/WebSocket multiplexer

pub mod assets;
pub mod config;
pub mod listener;
pub mod request;
pub mod tls;
pub mod ws;

pub use assets::StaticFiles;
pub use config::ServerConfig;
pub use listener::Server;
pub use request::RequestHead;
pub use ws::{ViewerHub, ViewerSink};
