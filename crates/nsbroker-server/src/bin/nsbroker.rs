//! One-shot command-line client for a running broker.

use anyhow::Result;
use clap::{Parser, Subcommand};
use nsbroker_core::Client;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "nsbroker")]
#[command(about = "Run code in a namespace broker")]
struct Args {
    /// Broker address, `[scheme://][password@]host[:port][/namespace]`
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Namespace to work in (overrides the host spec's)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run statements
    Exec { code: String },
    /// Evaluate an expression and print its value
    Eval { expr: String },
    /// Run statements in the background and print the result id
    Submit { code: String },
    /// Wait for a background result and print it
    Read { result_id: String },
    /// List finished background results
    Poll,
    /// List local namespaces
    LsLocal,
    /// List namespaces forwarded to other brokers
    LsRemote,
    /// Print whether a namespace is local or remote
    NsType { name: String },
    /// Drop a namespace
    Drop { name: String },
    /// Force-release a namespace lock
    Unlock { name: String },
    /// Shut the server down (or the owner of a remote namespace)
    Kill { name: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let mut client = Client::connect(&args.host).await?;
    if let Some(ns) = args.namespace {
        client = client.with_default_namespace(ns);
    }
    let ns = client.default_namespace().to_string();

    match args.command {
        Command::Exec { code } => client.exec(&code).await?,
        Command::Eval { expr } => println!("{}", client.eval(&expr).await?.repr()),
        Command::Submit { code } => {
            let handle = client.exec_async_in(&ns, &code).await?;
            println!("{}", handle.result_id);
        }
        Command::Read { result_id } => {
            let handle = nsbroker_core::AsyncHandle::new(ns, result_id);
            println!("{}", client.read_rv(&handle).await?.repr());
        }
        Command::Poll => {
            for handle in client.poll_rvs(&ns).await? {
                println!("{}", handle.result_id);
            }
        }
        Command::LsLocal => {
            for name in client.ls_local().await? {
                println!("{}", name);
            }
        }
        Command::LsRemote => {
            for name in client.ls_remote().await? {
                println!("{}", name);
            }
        }
        Command::NsType { name } => match client.ns_type(&name).await? {
            Some(kind) => println!("{}", kind),
            None => anyhow::bail!("unknown namespace \"{}\"", name),
        },
        Command::Drop { name } => client.drop_ns(&name).await?,
        Command::Unlock { name } => println!("{}", client.unlock_ns(&name).await?),
        Command::Kill { name } => client.kill_server(name.as_deref()).await?,
    }
    Ok(())
}
