#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] http::Error),

    #[error(transparent)]
    Hyper(#[from] hyper::Error),

    #[error(transparent)]
    HyperLegacy(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    Certificate(#[from] crate::ca::Error),

    #[error("timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("invalid URL")]
    InvalidUrl,

    #[error("invalid response")]
    InvalidResponse,
}
