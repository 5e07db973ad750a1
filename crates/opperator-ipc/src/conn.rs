//! Transport-agnostic connection to a daemon: `unix://PATH`, `tcp://HOST:PORT`,
//! or a bare path (legacy unix). TCP performs a line auth handshake; unix
//! connections skip it.

use opperator_core::{Error, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

pin_project_lite::pin_project! {
    #[project = ConnProj]
    pub enum Conn {
        Tcp{ #[pin] inner: TcpStream },
        Unix{ #[pin] inner: UnixStream },
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.project() {
            ConnProj::Tcp { inner } => inner.poll_read(cx, buf),
            ConnProj::Unix { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.project() {
            ConnProj::Tcp { inner } => inner.poll_write(cx, buf),
            ConnProj::Unix { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            ConnProj::Tcp { inner } => inner.poll_flush(cx),
            ConnProj::Unix { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            ConnProj::Tcp { inner } => inner.poll_shutdown(cx),
            ConnProj::Unix { inner } => inner.poll_shutdown(cx),
        }
    }
}

/// Parsed address form for a daemon endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(String),
    Tcp(String, u16),
}

impl Address {
    pub fn parse(addr: &str) -> Result<Self> {
        if let Some(path) = addr.strip_prefix("unix://") {
            return Ok(Address::Unix(path.to_string()));
        }
        if let Some(hostport) = addr.strip_prefix("tcp://") {
            let (host, port) = hostport
                .rsplit_once(':')
                .ok_or_else(|| Error::ConfigError(format!("invalid tcp address: {addr}")))?;
            let port: u16 = port
                .parse()
                .map_err(|_| Error::ConfigError(format!("invalid tcp port: {addr}")))?;
            return Ok(Address::Tcp(host.to_string(), port));
        }
        // Bare path: legacy unix socket.
        Ok(Address::Unix(addr.to_string()))
    }
}

/// Connects and, for TCP, performs the `AUTH <token>\n` -> `OK\n` handshake.
/// Unix connections skip authentication entirely.
pub async fn connect(addr: &Address, auth_token: Option<&str>) -> Result<Conn> {
    match addr {
        Address::Unix(path) => {
            let inner = UnixStream::connect(path)
                .await
                .map_err(|e| Error::ConnectFailed(e.to_string()))?;
            Ok(Conn::Unix { inner })
        }
        Address::Tcp(host, port) => {
            let mut inner = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|e| Error::ConnectFailed(e.to_string()))?;
            let line = format!("AUTH {}\n", auth_token.unwrap_or(""));
            inner
                .write_all(line.as_bytes())
                .await
                .map_err(|e| Error::ConnectFailed(e.to_string()))?;
            let mut reader = tokio::io::BufReader::new(&mut inner);
            let mut resp = String::new();
            use tokio::io::AsyncBufReadExt;
            reader
                .read_line(&mut resp)
                .await
                .map_err(|e| Error::ConnectFailed(e.to_string()))?;
            if resp.trim_end() != "OK" {
                return Err(Error::AuthFailed(resp.trim_end().to_string()));
            }
            Ok(Conn::Tcp { inner })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_scheme() {
        assert_eq!(
            Address::parse("unix:///tmp/d.sock").unwrap(),
            Address::Unix("/tmp/d.sock".to_string())
        );
    }

    #[test]
    fn parses_tcp_scheme() {
        assert_eq!(
            Address::parse("tcp://127.0.0.1:9000").unwrap(),
            Address::Tcp("127.0.0.1".to_string(), 9000)
        );
    }

    #[test]
    fn bare_path_is_legacy_unix() {
        assert_eq!(
            Address::parse("/var/run/d.sock").unwrap(),
            Address::Unix("/var/run/d.sock".to_string())
        );
    }

    #[test]
    fn rejects_invalid_tcp_port() {
        assert!(Address::parse("tcp://host:notaport").is_err());
    }
}
