use crate::{BootArgs, GenCaArgs, Result};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vmitm::{
    ca::{Authority, CertStore, DomainTrieStore, LeafScope, RootCa},
    http::{Credentials, ProxyOptions, Server},
    rewrite::{RewriteHandler, RuleSet, Rewrites},
};

/// Run the server with the provided boot arguments.
pub fn run(args: BootArgs) -> Result<()> {
    // rustls reports every rejected handshake, which is routine for a MITM proxy
    let filter = EnvFilter::from_default_env()
        .add_directive(args.log.into())
        .add_directive("rustls=error".parse()?);

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(args.log)
            .with_env_filter(filter)
            .finish(),
    )?;

    tracing::info!("OS: {}", std::env::consts::OS);
    tracing::info!("Arch: {}", std::env::consts::ARCH);
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Concurrent: {}", args.concurrent);
    tracing::info!("Connect timeout: {:?}s", args.connect_timeout);

    let context = Context::new(args)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get())
        .max_blocking_threads(context.concurrent)
        .build()?
        .block_on(async move {
            #[cfg(target_family = "unix")]
            if let (Some(rewrites), Some(path)) = (&context.rewrites, &context.rules) {
                tokio::spawn(reload_on_hangup(rewrites.clone(), path.clone()));
            }

            let server = Server::bind(context.options)?;
            server
                .serve(async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for ctrl-c: {}", err);
                        std::future::pending::<()>().await;
                    }
                })
                .await;
            Ok(())
        })
}

/// Write a fresh root CA to disk.
pub fn gen_ca(args: GenCaArgs) -> Result<()> {
    RootCa::generate_and_save(&args.cert, &args.key)?;
    println!("Root certificate: {}", args.cert.display());
    println!("Private key: {}", args.key.display());
    Ok(())
}

/// Everything the server needs, resolved from the command line.
struct Context {
    concurrent: usize,
    options: ProxyOptions,
    rewrites: Option<Arc<Rewrites>>,
    rules: Option<PathBuf>,
}

impl Context {
    fn new(args: BootArgs) -> Result<Self> {
        let mut options = ProxyOptions::new(args.bind)
            .with_connect_timeout(Duration::from_secs(args.connect_timeout))
            .with_api_host(args.api_host)
            .with_upstream_tls(args.upstream_tls);
        options.concurrent = args.concurrent;
        options.idle_timeout = Duration::from_secs(args.idle_timeout);
        options.handshake_timeout = Duration::from_secs(args.handshake_timeout);
        options.upstream_timeout = Duration::from_secs(args.upstream_timeout);

        if !args.no_intercept {
            let root = match (&args.ca_cert, &args.ca_key) {
                (Some(cert), Some(key)) => RootCa::load(cert, key)?,
                _ => {
                    let dir = args
                        .ca_dir
                        .unwrap_or_else(|| std::env::temp_dir().join(env!("CARGO_PKG_NAME")));
                    RootCa::load_or_generate(dir)?
                }
            };

            let authority = if args.wildcard {
                let store: Arc<dyn CertStore> = Arc::new(DomainTrieStore::new());
                Authority::new(root, Some(store))?.with_scope(LeafScope::Wildcard)
            } else {
                Authority::new(root, None)?
            };
            options = options.with_authority(Arc::new(authority));
        }

        if let (Some(username), Some(password)) = (args.auth.username, args.auth.password) {
            options = options.with_authenticator(Credentials::new(username, password));
        }

        let mut rewrites = None;
        if let Some(path) = &args.rules {
            let text = std::fs::read_to_string(path)?;
            let loaded = Arc::new(Rewrites::load(&text)?);
            tracing::info!(
                "Loaded {} rewrite rules from {}",
                loaded.current().len(),
                path.display()
            );
            options = options.with_handler(RewriteHandler::new(loaded.clone()));
            rewrites = Some(loaded);
        }

        Ok(Self {
            concurrent: args.concurrent,
            options,
            rewrites,
            rules: args.rules,
        })
    }
}

/// Re-read the rules file on every SIGHUP. A bad file keeps the current rules.
#[cfg(target_family = "unix")]
async fn reload_on_hangup(rewrites: Arc<Rewrites>, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            tracing::warn!("Failed to listen for SIGHUP: {}", err);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        let parsed = std::fs::read_to_string(&path)
            .map_err(crate::error::Error::from)
            .and_then(|text| RuleSet::parse(&text).map_err(Into::into));
        match parsed {
            Ok(rules) => {
                tracing::info!("Reloaded {} rewrite rules from {}", rules.len(), path.display());
                rewrites.reload(rules);
            }
            Err(err) => tracing::warn!("Keeping current rewrite rules: {}", err),
        }
    }
}
