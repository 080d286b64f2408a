//! NsBroker Server - hosts namespaces and serves them over TCP or stdio.
//!
//! Prints `LISTEN=<addr>` on stdout once the listener is bound so a parent
//! process can pick up an auto-assigned port.

use anyhow::{Context, Result};
use clap::Parser;
use nsbroker_core::config::ProtocolConfig;
use nsbroker_core::{
    apply_directives, serve_stdio, Broker, BrokerConfig, BrokerServer, Directive, Password,
    ServerConfig,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "nsbroker-server")]
#[command(about = "Namespace-execution broker server")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = ProtocolConfig::DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Serve one connection over stdin/stdout instead of listening
    #[arg(long)]
    stdio: bool,

    /// Password clients must send
    #[arg(long, conflicts_with = "password_sha256")]
    password: Option<String>,

    /// SHA-256 hex digest of the password clients must send
    #[arg(long)]
    password_sha256: Option<String>,

    /// Refuse to create namespaces on first use
    #[arg(long)]
    no_new_namespaces: bool,

    /// Only these names may be created on first use (repeatable)
    #[arg(long = "whitelist", value_name = "NS")]
    whitelist: Vec<String>,

    /// Create NS and run CODE in it (repeatable, NS=CODE)
    #[arg(long = "init", value_name = "NS=CODE")]
    init: Vec<String>,

    /// Export NS to the broker at HOSTSPEC (repeatable, NS=HOSTSPEC)
    #[arg(long = "export", value_name = "NS=HOSTSPEC")]
    export: Vec<String>,

    /// Import NS from the broker at HOSTSPEC (repeatable, NS=HOSTSPEC)
    #[arg(long = "import", value_name = "NS=HOSTSPEC")]
    import: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Truncate logged messages to this many bytes (0 = no limit)
    #[arg(long, default_value_t = ServerConfig::DEFAULT_DEBUG_LIMIT)]
    debug_limit: usize,
}

impl Args {
    fn broker_config(&self) -> BrokerConfig {
        let mut config = BrokerConfig::default()
            .allow_new_namespaces(!self.no_new_namespaces)
            .with_debug_limit(self.debug_limit);
        if !self.whitelist.is_empty() {
            config = config.with_local_whitelist(self.whitelist.iter().cloned());
        }
        if let Some(password) = &self.password {
            config = config.with_password(Password::Plaintext(password.clone()));
        } else if let Some(digest) = &self.password_sha256 {
            config = config.with_password(Password::Sha256(digest.to_lowercase()));
        }
        config
    }

    fn directives(&self) -> Result<Vec<Directive>> {
        let groups = [
            ("init", &self.init),
            ("export", &self.export),
            ("import", &self.import),
        ];
        let mut directives = Vec::new();
        for (kind, args) in groups {
            for arg in args {
                directives.push(Directive::parse(kind, arg)?);
            }
        }
        Ok(directives)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout is reserved for LISTEN= and --stdio traffic
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting NsBroker server");

    let directives = args.directives()?;
    let broker = Broker::new(args.broker_config());
    apply_directives(&broker, &directives)
        .await
        .context("applying startup directives")?;

    if args.stdio {
        let state = serve_stdio(Arc::clone(&broker)).await;
        info!("stdio connection ended in {:?}", state);
    } else {
        let server = BrokerServer::start(Arc::clone(&broker), (args.host.as_str(), args.port))
            .await
            .with_context(|| format!("binding {}:{}", args.host, args.port))?;

        // Intentional stdout for the parent process
        println!("LISTEN={}", server.addr());

        let mut shutdown = broker.shutdown_signal();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received, exiting");
                server.shutdown();
            }
            _ = shutdown.wait_for(|stopping| *stopping) => {
                info!("Shutdown requested by a client");
            }
        }
        server.stopped().await;
    }

    broker.cleanup().await;
    Ok(())
}
