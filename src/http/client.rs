use super::Body;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use moka::sync::Cache;
use std::{net::IpAddr, str::FromStr, sync::Arc, time::Duration};
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

/// Clients idle longer than this are dropped with their connections.
const CLIENT_IDLE: Duration = Duration::from_secs(90);

pub(crate) type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// How upstream TLS certificates are checked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpstreamTls {
    /// Accept any upstream certificate.
    ///
    /// The proxy terminates the client's TLS itself, so the client never sees
    /// the origin certificate either way.
    #[default]
    Insecure,
    /// Verify upstream certificates against the webpki roots.
    Verify,
}

impl FromStr for UpstreamTls {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insecure" => Ok(UpstreamTls::Insecure),
            "verify" => Ok(UpstreamTls::Verify),
            other => Err(format!("unknown upstream TLS mode `{other}`")),
        }
    }
}

/// HTTP clients keyed by client identity (source IP, user agent).
pub(crate) struct ClientPool {
    clients: Cache<(IpAddr, String), HttpClient>,
    tls: ClientConfig,
    connect_timeout: Duration,
}

impl ClientPool {
    pub(crate) fn new(
        upstream_tls: UpstreamTls,
        connect_timeout: Duration,
    ) -> Result<Self, rustls::Error> {
        Ok(Self {
            clients: Cache::builder()
                .max_capacity(1024)
                .time_to_idle(CLIENT_IDLE)
                .build(),
            tls: client_config(upstream_tls)?,
            connect_timeout,
        })
    }

    /// The client for this identity, created on first use.
    pub(crate) fn get(&self, source: IpAddr, user_agent: &str) -> HttpClient {
        self.clients
            .get_with((source, user_agent.to_owned()), || self.build())
    }

    fn build(&self) -> HttpClient {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(self.connect_timeout));
        http.set_nodelay(true);
        http.enforce_http(false);

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(self.tls.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(CLIENT_IDLE)
            .pool_timer(TokioTimer::new())
            .build(https)
    }
}

fn client_config(upstream_tls: UpstreamTls) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(ring::default_provider());
    let builder =
        ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let config = match upstream_tls {
        UpstreamTls::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
            .with_no_client_auth(),
        UpstreamTls::Verify => {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    Ok(config)
}

/// Accepts any certificate chain but still checks handshake signatures.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
