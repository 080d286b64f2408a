//! Server bootstrap: TCP listener, stdio serving and startup directives.
//!
//! The listener accepts connections until the broker's shutdown signal
//! fires, handing each one to its own [`ConnectionHandler`] task.

use crate::broker::Broker;
use crate::client::Client;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionSlot};
use crate::handler::{ConnectionHandler, ConnectionOptions, HandlerState};
use crate::hostspec::HostSpec;
use crate::{BrokerError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a running server. Dropping it stops accepting connections.
#[derive(Debug)]
pub struct BrokerServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    broker: Arc<Broker>,
    active_connections: Arc<AtomicUsize>,
    task_handle: Option<JoinHandle<()>>,
}

impl BrokerServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Accepted connections still open, including those now relaying
    /// traffic for an exported namespace.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Ask the broker to shut down; the accept loop and every handler stop.
    pub fn shutdown(&self) {
        self.broker.request_shutdown();
    }

    /// Wait until the accept loop has stopped.
    pub async fn stopped(mut self) {
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                debug!("accept loop ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for BrokerServerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// TCP front end of a [`Broker`].
pub struct BrokerServer;

impl BrokerServer {
    /// Bind `addr` and serve in background tasks.
    pub async fn start(broker: Arc<Broker>, addr: impl ToSocketAddrs) -> Result<BrokerServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("broker listening on {}", addr);

        let active_connections = Arc::new(AtomicUsize::new(0));
        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&broker),
            Arc::clone(&active_connections),
        ));

        Ok(BrokerServerHandle {
            addr,
            port: addr.port(),
            broker,
            active_connections,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        broker: Arc<Broker>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let mut shutdown = broker.shutdown_signal();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("broker server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let Some(slot) = ConnectionSlot::acquire(
                                &active_connections,
                                ServerConfig::MAX_CONNECTIONS,
                            ) else {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    ServerConfig::MAX_CONNECTIONS
                                );
                                continue;
                            };

                            // The slot lives as long as the socket, which
                            // outlives the handler once it is relaying.
                            let handler = ConnectionHandler::new(
                                Arc::clone(&broker),
                                Connection::from_tcp(stream).holding(slot),
                            );

                            tokio::spawn(async move {
                                debug!("connection {} from {}", handler.id(), peer_addr);
                                let state = handler.run().await;
                                debug!("connection from {} ended in {:?}", peer_addr, state);
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// Serve a single connection over this process's stdin/stdout.
///
/// The parent process that spawned us is trusted, so no handshake is
/// required. The server shuts down when the pipe closes.
pub async fn serve_stdio(broker: Arc<Broker>) -> HandlerState {
    ConnectionHandler::new(broker, Connection::stdio())
        .skip_auth()
        .with_options(ConnectionOptions {
            kill_server_on_close: true,
        })
        .run()
        .await
}

/// A startup action, written `NS=ARG` on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Force-create `namespace` and run `code` in it.
    Init { namespace: String, code: String },
    /// Export `namespace` to the broker at `hostspec` and serve its requests.
    Export { namespace: String, hostspec: String },
    /// Import `namespace` from the broker at `hostspec`.
    Import { namespace: String, hostspec: String },
}

impl Directive {
    /// Parse `kind` (`init`, `export` or `import`) with its `NS=ARG` argument.
    pub fn parse(kind: &str, arg: &str) -> Result<Self> {
        let (namespace, value) = arg
            .split_once('=')
            .filter(|(ns, _)| !ns.is_empty())
            .ok_or_else(|| BrokerError::Config {
                message: format!("{} directive \"{}\" is not NS=ARG", kind, arg),
            })?;
        let namespace = namespace.to_string();
        let value = value.to_string();
        match kind {
            "init" => Ok(Directive::Init {
                namespace,
                code: value,
            }),
            "export" => Ok(Directive::Export {
                namespace,
                hostspec: value,
            }),
            "import" => Ok(Directive::Import {
                namespace,
                hostspec: value,
            }),
            other => Err(BrokerError::Config {
                message: format!("unknown directive \"{}\"", other),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Directive::Init { namespace, .. }
            | Directive::Export { namespace, .. }
            | Directive::Import { namespace, .. } => namespace,
        }
    }
}

/// Apply directives in order.
///
/// A failing `init` is only logged; export and import failures abort.
pub async fn apply_directives(broker: &Arc<Broker>, directives: &[Directive]) -> Result<()> {
    for directive in directives {
        match directive {
            Directive::Init { namespace, code } => {
                broker.init_namespace(namespace, code).await?;
            }
            Directive::Export {
                namespace,
                hostspec,
            } => {
                export_to(broker, namespace, &HostSpec::parse(hostspec)?).await?;
            }
            Directive::Import {
                namespace,
                hostspec,
            } => {
                let client = Client::connect_spec(&HostSpec::parse(hostspec)?).await?;
                broker
                    .import_namespace(namespace, client.into_connection())
                    .await?;
                info!("imported namespace \"{}\" from {}", namespace, hostspec);
            }
        }
    }
    Ok(())
}

/// Export a local namespace to another broker and serve the requests it
/// forwards. Losing that connection shuts this server down.
pub async fn export_to(broker: &Arc<Broker>, namespace: &str, spec: &HostSpec) -> Result<JoinHandle<HandlerState>> {
    broker.registry().get_or_create(namespace, true)?;
    let client = Client::connect_spec(spec).await?;
    client.export_ns(namespace).await?;
    info!("exported namespace \"{}\" to {}", namespace, spec);

    let handler = ConnectionHandler::new(Arc::clone(broker), client.into_connection())
        .skip_auth()
        .with_options(ConnectionOptions {
            kill_server_on_close: true,
        });
    Ok(tokio::spawn(handler.run()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::value::Value;

    #[test]
    fn test_parse_directives() {
        assert_eq!(
            Directive::parse("init", "n=x = 1").unwrap(),
            Directive::Init {
                namespace: "n".into(),
                code: "x = 1".into()
            }
        );
        assert_eq!(
            Directive::parse("export", "n=hub:9000").unwrap().namespace(),
            "n"
        );
        assert!(Directive::parse("init", "no-equals").is_err());
        assert!(Directive::parse("init", "=code").is_err());
        assert!(Directive::parse("launch", "n=x").is_err());
    }

    #[tokio::test]
    async fn test_server_serves_tcp_clients() {
        let broker = Broker::new(BrokerConfig::default());
        let handle = BrokerServer::start(broker, "127.0.0.1:0").await.unwrap();

        let client = Client::connect(&format!("127.0.0.1:{}", handle.port))
            .await
            .unwrap();
        client.exec("x = 5").await.unwrap();
        assert_eq!(client.eval("x").await.unwrap(), Value::Int(5));

        handle.shutdown();
        handle.stopped().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let broker = Broker::new(BrokerConfig::default());
        let handle = BrokerServer::start(broker, "127.0.0.1:0").await.unwrap();
        let client = Client::connect(&format!("127.0.0.1:{}", handle.port))
            .await
            .unwrap();
        assert_eq!(client.eval("1").await.unwrap(), Value::Int(1));

        handle.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let err = client.eval("1").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_init_directive() {
        let broker = Broker::new(BrokerConfig::default().allow_new_namespaces(false));
        let directives = vec![
            Directive::parse("init", "n=greeting = 'hi'").unwrap(),
            Directive::parse("init", "bad=1 / 0").unwrap(),
        ];
        apply_directives(&broker, &directives).await.unwrap();
        assert_eq!(broker.registry().local_names(), vec!["bad", "n"]);
        let ns = broker.resolve_local("n").unwrap();
        assert_eq!(ns.get("greeting"), Some(Value::from("hi")));
    }

    #[tokio::test]
    async fn test_relaying_connection_keeps_its_slot() {
        async fn settle(handle: &BrokerServerHandle, expected: usize) {
            for _ in 0..50 {
                if handle.active_connections() == expected {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            assert_eq!(handle.active_connections(), expected);
        }

        let hub = BrokerServer::start(Broker::new(BrokerConfig::default()), "127.0.0.1:0")
            .await
            .unwrap();
        let owner = Broker::new(BrokerConfig::default());
        let spec = HostSpec::parse_plain(&format!("127.0.0.1:{}", hub.port)).unwrap();
        export_to(&owner, "n", &spec).await.unwrap();
        settle(&hub, 1).await;

        let client = Client::connect(&format!("127.0.0.1:{}", hub.port))
            .await
            .unwrap();
        assert_eq!(client.eval_in("n", "2 + 2").await.unwrap(), Value::Int(4));
        settle(&hub, 2).await;
        drop(client);
        settle(&hub, 1).await;

        // the owner goes away; the next forward drops the peer and its socket
        owner.request_shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let client = Client::connect(&format!("127.0.0.1:{}", hub.port))
            .await
            .unwrap();
        assert!(client.eval_in("n", "1").await.is_err());
        drop(client);
        settle(&hub, 0).await;
    }
}
