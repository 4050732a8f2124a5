//! Unix domain socket transport.
//!
//! Endpoints are `ipc://<path>` strings. Every message travels as one
//! length-prefixed frame: `[4-byte BE u32 length][payload bytes]`.
//! The same frame helpers serve the broker and client proxies.

use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::config::MiddlewareConfig;
use crate::error::{MiddlewareError, Result};

/// Extract the socket path from an `ipc://` endpoint.
pub fn socket_path(endpoint: &str) -> Result<PathBuf> {
    match endpoint.strip_prefix(MiddlewareConfig::ENDPOINT_SCHEME) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(MiddlewareError::invalid_argument(format!(
            "bad endpoint: \"{}\" (expected {}<path>)",
            endpoint,
            MiddlewareConfig::ENDPOINT_SCHEME
        ))),
    }
}

/// Format a socket path as an endpoint string.
pub fn endpoint_for(path: &Path) -> String {
    format!("{}{}", MiddlewareConfig::ENDPOINT_SCHEME, path.display())
}

/// A listening socket that unlinks its path when dropped.
#[derive(Debug)]
pub struct BoundEndpoint {
    listener: UnixListener,
    path: PathBuf,
}

impl BoundEndpoint {
    /// The listening socket.
    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    /// Filesystem path of the socket.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BoundEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to unlink {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Bind a listening socket without taking over a live endpoint.
///
/// Unix sockets let a second binder silently replace the path of the first,
/// so an existing socket file is probed with a connect before anything is
/// removed. A live peer fails the bind with `AddressInUse`; a stale file is
/// unlinked. Must be called from within a tokio runtime.
pub fn safe_bind(endpoint: &str) -> Result<BoundEndpoint> {
    let path = socket_path(endpoint)?;

    if let Ok(metadata) = std::fs::symlink_metadata(&path) {
        if !metadata.file_type().is_socket() {
            return Err(MiddlewareError::io(format!(
                "safe_bind(): {} exists and is not a socket",
                path.display()
            )));
        }
        if StdUnixStream::connect(&path).is_ok() {
            return Err(MiddlewareError::AddressInUse {
                endpoint: endpoint.to_string(),
            });
        }
        debug!("Removing stale socket {}", path.display());
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    match UnixListener::bind(&path) {
        Ok(listener) => Ok(BoundEndpoint { listener, path }),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(MiddlewareError::AddressInUse {
            endpoint: endpoint.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Open a client connection to an endpoint.
///
/// Gives up after `MiddlewareConfig::CONNECT_TIMEOUT`.
pub async fn connect(endpoint: &str) -> Result<UnixStream> {
    let path = socket_path(endpoint)?;
    tokio::time::timeout(MiddlewareConfig::CONNECT_TIMEOUT, UnixStream::connect(&path))
        .await
        .map_err(|_| MiddlewareError::Timeout {
            operation: format!("connect to {}", endpoint),
            timeout: MiddlewareConfig::CONNECT_TIMEOUT,
        })?
        .map_err(|e| MiddlewareError::Io {
            message: format!("cannot connect to {}: {}", endpoint, e),
            source: Some(e),
        })
}

fn check_frame_len(len: usize) -> Result<()> {
    if len > MiddlewareConfig::MAX_FRAME_SIZE {
        return Err(MiddlewareError::FrameTooLarge {
            size: len,
            max: MiddlewareConfig::MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Read one frame. Returns `None` on a clean EOF before the length prefix.
///
/// A stream that ends inside the prefix or the payload is an error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(MiddlewareError::io(format!(
                "stream closed after {} of {} length prefix bytes",
                filled,
                len_buf.len()
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_frame_len(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_socket_path_parsing() {
        assert_eq!(
            socket_path("ipc:///tmp/scope.sock").unwrap(),
            PathBuf::from("/tmp/scope.sock")
        );
        assert!(socket_path("ipc://").is_err());
        assert!(socket_path("/tmp/scope.sock").is_err());
        assert!(socket_path("tcp://127.0.0.1:80").is_err());
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge_len = (MiddlewareConfig::MAX_FRAME_SIZE + 1) as u32;
        client.write_all(&huge_len.to_be_bytes()).await.unwrap();
        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(MiddlewareError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_frame_read_truncated_prefix_returns_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        assert!(matches!(read_frame(&mut server).await, Err(MiddlewareError::Io { .. })));
    }

    #[tokio::test]
    async fn test_frame_read_truncated_payload_returns_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&8u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(matches!(read_frame(&mut server).await, Err(MiddlewareError::Io { .. })));
    }

    #[tokio::test]
    async fn test_frames_over_unix_socket() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_for(&dir.path().join("frames.sock"));
        let bound = safe_bind(&endpoint).unwrap();

        let mut client = connect(&endpoint).await.unwrap();
        let (mut server, _) = bound.listener().accept().await.unwrap();

        write_frame(&mut client, b"abc").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"abc");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_for(&dir.path().join("nobody.sock"));
        assert!(matches!(connect(&endpoint).await, Err(MiddlewareError::Io { .. })));
    }

    #[tokio::test]
    async fn test_safe_bind_detects_live_endpoint() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint_for(&dir.path().join("live.sock"));

        let first = safe_bind(&endpoint).unwrap();
        let second = safe_bind(&endpoint);
        assert!(matches!(second, Err(MiddlewareError::AddressInUse { .. })));

        drop(first);
        assert!(!dir.path().join("live.sock").exists());
    }

    #[tokio::test]
    async fn test_safe_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        // A bound std listener that is dropped without unlinking leaves a stale file.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let bound = safe_bind(&endpoint_for(&path)).unwrap();
        assert_eq!(bound.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_safe_bind_refuses_regular_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();
        assert!(safe_bind(&endpoint_for(&path)).is_err());
        assert!(path.exists());
    }
}
