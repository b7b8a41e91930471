use super::{conn::Proxy, ProxyOptions};
use std::{
    future::Future,
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};

/// MITM proxy listener.
pub struct Server {
    listener: TcpListener,
    proxy: Arc<Proxy>,
}

impl Server {
    /// Bind the listening socket. Must be called within a Tokio runtime.
    pub fn bind(options: ProxyOptions) -> io::Result<Self> {
        let socket = if options.bind.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(options.bind)?;

        let backlog = u32::try_from(options.concurrent).unwrap_or(u32::MAX);
        let listener = socket.listen(backlog)?;
        let proxy = Proxy::new(options).map_err(io_other)?;

        Ok(Self {
            listener,
            proxy: Arc::new(proxy),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve in a background task.
    pub fn start(self) -> io::Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(self.serve(async move {
            let _ = signal.await;
        }));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// The listener is dropped on return. Connections already accepted keep
    /// running to completion.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) {
        let local_addr = self.listener.local_addr().ok();
        tracing::info!("Proxy server listening on {:?}", local_addr);

        tokio::pin!(shutdown);
        loop {
            let (tcp_stream, peer) = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                result = accept(&self.listener) => result,
            };

            tokio::spawn(self.proxy.clone().serve(tcp_stream, peer));
        }

        tracing::info!("Proxy server on {:?} closed", local_addr);
    }
}

/// A running [`Server`]. Dropping the handle stops the listener as well.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the listener to be released.
    pub async fn close(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            tracing::warn!("proxy server task failed: {}", err);
        }
    }
}

async fn accept(listener: &TcpListener) -> (TcpStream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(value) => return value,
            Err(err) => {
                tracing::trace!("accept failed: {}", err);
                tokio::time::sleep(Duration::from_millis(50)).await
            }
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) fn io_other<E: Into<BoxError>>(error: E) -> io::Error {
    io::Error::new(ErrorKind::Other, error)
}
