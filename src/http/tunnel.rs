use async_trait::async_trait;
use http::uri::Authority;
use std::{fmt, io, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};

/// A bidirectional byte stream the proxy can serve.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

/// A CONNECT tunnel whose traffic is neither intercepted TLS nor HTTP.
pub struct Tunnel {
    /// `host:port` from the CONNECT request line.
    pub target: Authority,
    pub peer: SocketAddr,
    pub source: SocketAddr,
    /// Client side of the tunnel, with any sniffed bytes still readable.
    pub stream: Box<dyn Io>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("target", &self.target)
            .field("peer", &self.peer)
            .field("source", &self.source)
            .finish()
    }
}

/// Takes ownership of opaque tunnels.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, tunnel: Tunnel) -> io::Result<()>;
}

/// Connects straight to the CONNECT target and relays bytes.
#[derive(Clone, Debug)]
pub struct DirectDispatcher {
    connect_timeout: Duration,
}

impl DirectDispatcher {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn dispatch(&self, mut tunnel: Tunnel) -> io::Result<()> {
        let target = tunnel.target.as_str();
        let mut server = timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        match tokio::io::copy_bidirectional(&mut tunnel.stream, &mut server).await {
            Ok((from_client, from_server)) => {
                tracing::debug!(
                    "client wrote {} bytes and received {} bytes",
                    from_client,
                    from_server
                );
            }
            Err(err) => {
                tracing::debug!("tunnel error: {}", err);
            }
        }

        Ok(())
    }
}
