#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    AddressParseError(#[from] std::net::AddrParseError),

    #[error(transparent)]
    CertificateError(#[from] vmitm::ca::Error),

    #[error("rules: {0}")]
    RuleError(#[from] vmitm::rewrite::RuleError),

    #[error(transparent)]
    LogInitError(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error(transparent)]
    LogDirectiveError(#[from] tracing_subscriber::filter::ParseError),
}
