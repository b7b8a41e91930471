mod alloc;
mod error;
mod serve;

use clap::{Args, Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf};
use vmitm::http::{UpstreamTls, DEFAULT_API_HOST};

type Result<T, E = error::Error> = std::result::Result<T, E>;

#[derive(Parser)]
#[clap(author, version, about, arg_required_else_help = true)]
#[command(args_conflicts_with_subcommands = true)]
struct Opt {
    #[clap(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run server
    Run(BootArgs),

    /// Generate a root CA certificate and key
    GenCa(GenCaArgs),
}

/// Choose the authentication type
#[derive(Args, Clone)]
pub struct AuthMode {
    /// Authentication username
    #[clap(short, long, requires = "password")]
    pub username: Option<String>,

    /// Authentication password
    #[clap(short, long, requires = "username")]
    pub password: Option<String>,
}

#[derive(Args, Clone)]
pub struct GenCaArgs {
    /// Certificate output file
    #[clap(long, default_value = "ca.crt")]
    pub cert: PathBuf,

    /// Private key output file
    #[clap(long, default_value = "ca.key")]
    pub key: PathBuf,
}

#[derive(Args, Clone)]
pub struct BootArgs {
    /// Log level e.g. trace, debug, info, warn, error
    #[clap(long, env = "VMITM_LOG", default_value = "info")]
    log: tracing::Level,

    /// Bind address
    #[clap(short, long, default_value = "0.0.0.0:1080")]
    bind: SocketAddr,

    /// Connection timeout in seconds
    #[clap(short = 'T', long, default_value = "10")]
    connect_timeout: u64,

    /// Concurrent connections
    #[clap(short, long, default_value = "1024")]
    concurrent: usize,

    /// Idle timeout between requests in seconds
    #[clap(long, default_value = "30")]
    idle_timeout: u64,

    /// Client TLS handshake timeout in seconds
    #[clap(long, default_value = "10")]
    handshake_timeout: u64,

    /// Upstream response timeout in seconds
    #[clap(long, default_value = "60")]
    upstream_timeout: u64,

    /// Host answered by the proxy itself, e.g. for the CA download
    #[clap(long, default_value = DEFAULT_API_HOST)]
    api_host: String,

    /// Upstream certificate checking: insecure or verify
    #[clap(long, default_value = "insecure")]
    upstream_tls: UpstreamTls,

    /// Root CA certificate file
    #[clap(long, requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// Root CA private key file
    #[clap(long, requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Directory caching a generated root CA when no CA files are given
    #[clap(long, conflicts_with = "ca_cert")]
    ca_dir: Option<PathBuf>,

    /// Relay TLS tunnels without intercepting them
    #[clap(long, conflicts_with_all = ["ca_cert", "ca_dir"])]
    no_intercept: bool,

    /// Issue one wildcard leaf per parent domain
    #[clap(long)]
    wildcard: bool,

    /// Rewrite rules file, reloaded on SIGHUP
    #[clap(short, long)]
    rules: Option<PathBuf>,

    /// Authentication type
    #[clap(flatten)]
    auth: AuthMode,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    match opt.commands {
        Commands::Run(args) => serve::run(args),
        Commands::GenCa(args) => serve::gen_ca(args),
    }
}
