//! Embedded static assets
//!
//! The browser UI ships inside the binary as a tar archive packed by
//! `build.rs`. At startup the archive is unpacked into a path map; requests
//! are answered from memory with `Connection: close` semantics.

use std::collections::HashMap;
use std::io::{self, Read};

use bytes::Bytes;
use tracing::debug;

/// Archive produced by `build.rs` from the `web/` directory.
pub const EMBEDDED_ARCHIVE: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/assets.tar"));

/// In-memory static file set.
pub struct StaticFiles {
    files: HashMap<String, Bytes>,
}

impl StaticFiles {
    /// Unpack a tar archive. Entry names are normalized: a leading `./` is
    /// stripped, directories are skipped.
    pub fn from_tar(archive: &[u8]) -> io::Result<Self> {
        let mut files = HashMap::new();
        let mut tar = tar::Archive::new(archive);

        for entry in tar.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            let name = name.strip_prefix("./").unwrap_or(&name).to_string();
            if name.is_empty() {
                continue;
            }

            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            debug!(file = %name, bytes = data.len(), "embedded asset");
            files.insert(name, Bytes::from(data));
        }

        Ok(Self { files })
    }

    /// The archive compiled into this binary.
    pub fn embedded() -> io::Result<Self> {
        Self::from_tar(EMBEDDED_ARCHIVE)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Map a request path to an archive entry: `/` serves `index.html`, any
    /// other path has its leading `/` stripped.
    pub fn lookup(&self, path: &str) -> Option<&Bytes> {
        let name = match path {
            "/" => "index.html",
            other => other.strip_prefix('/').unwrap_or(other),
        };
        self.files.get(name)
    }

    /// Full HTTP/1.1 response bytes for a request path.
    pub fn response_for(&self, path: &str) -> Vec<u8> {
        match self.lookup(path) {
            Some(body) => http_response("200 OK", content_type(path), body),
            None => http_response("404 Not Found", "text/plain", b"not found"),
        }
    }
}

/// Content-Type from the path extension.
pub fn content_type(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn http_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}
