//! Per-connection protocol state machine.
//!
//! ```text
//! Idle ──(password set)──▶ Authenticating ──ok──▶ Serving ──RegisterNamespace──▶ Forwarding
//!   └──────────(no password)────────────────────▶ Serving ──EOF / die / shutdown──▶ Closed
//! ```
//!
//! In `Serving` the handler reads one message at a time and answers it
//! before reading the next. A connection that exported a namespace leaves
//! general dispatch for good: its channel now belongs to the registry's
//! [`RemotePeer`] and only carries forwarded traffic.

use crate::broker::Broker;
use crate::connection::{resolve_outgoing, Connection};
use crate::protocol::frame::{self, Outgoing, FORMAT_JSON};
use crate::protocol::{ExecRequest, ExecResult, Message, CAP_ALL, CAP_COMPRESSION, CAP_DATA_INFO};
use crate::registry::{ConnectionId, Lookup, Namespace, RemotePeer};
use crate::value::Value;
use crate::{BrokerError, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Authenticating,
    Serving,
    /// The channel was handed to the registry after an export.
    Forwarding,
    Closed,
}

/// Per-connection behaviour switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionOptions {
    /// Shut the whole server down when this connection ends.
    pub kill_server_on_close: bool,
}

enum Incoming {
    Message(Message),
    Malformed(String),
}

enum Flow {
    Continue,
    Forwarding,
    Close,
}

/// Serves one connection against a [`Broker`].
pub struct ConnectionHandler {
    broker: Arc<Broker>,
    conn: Arc<Mutex<Connection>>,
    id: ConnectionId,
    peer: String,
    state: HandlerState,
    options: ConnectionOptions,
}

impl ConnectionHandler {
    pub fn new(broker: Arc<Broker>, conn: Connection) -> Self {
        let peer = conn.peer().to_string();
        Self {
            id: broker.next_connection_id(),
            broker,
            conn: Arc::new(Mutex::new(conn)),
            peer,
            state: HandlerState::Idle,
            options: ConnectionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Start in `Serving`, for channels this server opened itself.
    pub fn skip_auth(mut self) -> Self {
        self.state = HandlerState::Serving;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Serve until the connection ends or is handed over; returns the final
    /// state (`Forwarding` or `Closed`).
    pub async fn run(mut self) -> HandlerState {
        if let Err(e) = self.serve().await {
            debug!("connection {} from {} ended: {}", self.id, self.peer, e);
        }

        if self.state == HandlerState::Forwarding {
            return self.state;
        }
        self.state = HandlerState::Closed;
        self.broker.connection_lost(self.id).await;
        if self.options.kill_server_on_close {
            info!("connection {} closed, shutting down", self.peer);
            self.broker.request_shutdown();
        }
        self.state
    }

    async fn serve(&mut self) -> Result<()> {
        let mut shutdown = self.broker.shutdown_signal();
        if self.state == HandlerState::Idle {
            self.state = if self.broker.config().password.is_some() {
                HandlerState::Authenticating
            } else {
                HandlerState::Serving
            };
        }

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let incoming = {
                let mut conn = self.conn.lock().await;
                tokio::select! {
                    result = read_message(&mut conn) => match result? {
                        Some(incoming) => incoming,
                        None => return Ok(()),
                    },
                    _ = shutdown.changed() => return Ok(()),
                }
            };

            let flow = match (self.state, incoming) {
                (HandlerState::Authenticating, incoming) => self.authenticate(incoming).await?,
                (_, Incoming::Malformed(error)) => {
                    warn!("malformed message from {}: {}", self.peer, error);
                    self.send(&Message::Rejected { error }).await?;
                    Flow::Continue
                }
                (_, Incoming::Message(msg)) => {
                    debug!(
                        "{} <- {}",
                        self.peer,
                        self.broker.config().preview(&msg.to_string())
                    );
                    self.dispatch(msg).await?
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Forwarding => {
                    self.state = HandlerState::Forwarding;
                    return Ok(());
                }
                Flow::Close => return Ok(()),
            }
        }
    }

    async fn authenticate(&mut self, incoming: Incoming) -> Result<Flow> {
        let accepted = match (&incoming, &self.broker.config().password) {
            (Incoming::Message(Message::Auth { password }), Some(expected)) => {
                expected.verify(password)
            }
            (Incoming::Message(Message::Auth { .. }), None) => true,
            _ => false,
        };
        if accepted {
            self.state = HandlerState::Serving;
            self.send(&Message::AuthStatus {
                ok: true,
                error: None,
            })
            .await?;
            return Ok(Flow::Continue);
        }

        let error = match incoming {
            Incoming::Message(Message::Auth { .. }) => "authentication failed",
            _ => "authentication required",
        };
        warn!("{} from {}", error, self.peer);
        self.send(&Message::AuthStatus {
            ok: false,
            error: Some(error.to_string()),
        })
        .await?;
        Ok(Flow::Close)
    }

    async fn dispatch(&mut self, msg: Message) -> Result<Flow> {
        match msg {
            // a repeated handshake is harmless
            Message::Auth { .. } => {
                self.send(&Message::AuthStatus {
                    ok: true,
                    error: None,
                })
                .await?;
                Ok(Flow::Continue)
            }
            Message::Exec(request) => {
                self.handle_exec(request).await?;
                Ok(Flow::Continue)
            }
            Message::RegisterNamespace { namespace } => self.handle_register(&namespace).await,
            Message::RequestNamespace { namespace } => {
                let reply = if matches!(self.broker.registry().lookup(&namespace), Lookup::Absent) {
                    Message::namespace_failed(format!("unknown namespace \"{}\"", namespace))
                } else {
                    self.broker
                        .registry()
                        .add_subscriber(&namespace, self.id, self.peer.clone());
                    info!("{} imported namespace \"{}\"", self.peer, namespace);
                    Message::namespace_ok()
                };
                self.send(&reply).await?;
                Ok(Flow::Continue)
            }
            Message::DropNamespace { namespace } => {
                let reply = match self.broker.drop_namespace(&namespace).await {
                    Ok(()) => Message::namespace_ok(),
                    Err(e) => Message::namespace_failed(namespace_message(e)),
                };
                self.send(&reply).await?;
                Ok(Flow::Continue)
            }
            Message::AdminCommand { command, args } => self.handle_admin(&command, &args).await,
            other => {
                self.send(&Message::Rejected {
                    error: format!("unexpected message {}", other.kind()),
                })
                .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_exec(&mut self, request: ExecRequest) -> Result<()> {
        let registry = self.broker.registry();
        let namespace = match registry.lookup(&request.namespace) {
            Lookup::Remote(peer) => return self.forward_exec(peer, request).await,
            Lookup::Local(ns) => ns,
            Lookup::Absent => match self.broker.resolve_local(&request.namespace) {
                Ok(ns) => ns,
                Err(e) => {
                    return self
                        .send(&Message::namespace_failed(namespace_message(e)))
                        .await
                }
            },
        };
        self.exec_local(namespace, request).await
    }

    async fn exec_local(&mut self, namespace: Arc<Namespace>, request: ExecRequest) -> Result<()> {
        self.broker.registry().note_user(self.id, namespace.name());
        if request.is_async {
            let handle = self.broker.submit_async(namespace, request, Some(self.id));
            return self.send(&Message::AsyncHandle(handle)).await;
        }
        let caps = request.recv_caps;
        let result = self.broker.execute(namespace, request, Some(self.id)).await;
        self.send_result(result, caps).await
    }

    /// Send an exec result, replacing a value without wire form by its
    /// placeholder.
    async fn send_result(&mut self, mut result: ExecResult, recv_caps: u32) -> Result<()> {
        if !result.value.is_transportable() {
            debug!("substituting unserializable value {}", result.value);
            result.value = Value::unserializable(&result.value);
        }
        let msg = Message::ExecResult(result);
        let encoded = match frame::encode(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                let Message::ExecResult(mut result) = msg else {
                    return Err(e);
                };
                debug!("substituting unserializable value {}: {}", result.value, e);
                result.value = Value::unserializable(&result.value);
                frame::encode(&Message::ExecResult(result))?
            }
        };
        debug!(
            "{} -> {}",
            self.peer,
            self.broker
                .config()
                .preview(&String::from_utf8_lossy(&encoded))
        );
        self.conn
            .lock()
            .await
            .send_encoded("ExecResult", encoded, recv_caps)
            .await
    }

    async fn forward_exec(&mut self, peer: Arc<RemotePeer>, request: ExecRequest) -> Result<()> {
        let name = request.namespace.clone();
        let client_caps = request.recv_caps;
        let forwarded = request.with_recv_caps(client_caps | CAP_ALL);
        debug!("forwarding exec in \"{}\" to {}", name, peer.label());

        match peer.call(&Message::Exec(forwarded)).await {
            Ok(reply) => self.relay(reply, client_caps).await,
            Err(e) => {
                debug!("forward of \"{}\" failed: {}", name, e);
                self.broker.peer_lost(&peer);
                let result = ExecResult::connection_lost(format!("namespace \"{}\"", name));
                self.send(&Message::ExecResult(result)).await
            }
        }
    }

    /// Pass an owner's reply through, re-encoding it only if the client
    /// cannot read the form it arrived in.
    async fn relay(&mut self, reply: Outgoing, client_caps: u32) -> Result<()> {
        let verbatim = match &reply {
            Outgoing::Plain(_) => true,
            Outgoing::Hinted {
                hint: Message::DataSizeHint { format, .. },
                ..
            } => {
                client_caps & CAP_DATA_INFO != 0
                    && (format == FORMAT_JSON || client_caps & CAP_COMPRESSION != 0)
            }
            Outgoing::Hinted { .. } => false,
        };
        let mut conn = self.conn.lock().await;
        if verbatim {
            return conn.send_outgoing(reply).await;
        }
        let msg = resolve_outgoing(reply)?;
        let encoded = frame::encode(&msg)?;
        conn.send_encoded(msg.kind(), encoded, client_caps).await
    }

    async fn handle_register(&mut self, name: &str) -> Result<Flow> {
        // Hold the channel until the status is out so forwarded traffic
        // cannot overtake it.
        let mut conn = self.conn.lock().await;
        let peer = Arc::new(RemotePeer::new(Arc::clone(&self.conn), self.peer.clone()));
        match self.broker.registry().register_remote(name, peer) {
            Ok(()) => {
                conn.send(&Message::namespace_ok()).await?;
                info!("{} exported namespace \"{}\"", self.peer, name);
                Ok(Flow::Forwarding)
            }
            Err(e) => {
                warn!("export of \"{}\" by {} refused: {}", name, self.peer, e);
                conn.send(&Message::namespace_failed(namespace_message(e)))
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_admin(&mut self, command: &str, args: &[String]) -> Result<Flow> {
        let target = args.first().map(String::as_str);
        if let Some(name) = target {
            if let Lookup::Remote(peer) = self.broker.registry().lookup(name) {
                let msg = Message::AdminCommand {
                    command: command.to_string(),
                    args: args.to_vec(),
                };
                let reply = match peer.call(&msg).await.and_then(resolve_outgoing) {
                    Ok(reply) => reply,
                    Err(e) => {
                        debug!("forward of {} to {} failed: {}", command, peer.label(), e);
                        self.broker.peer_lost(&peer);
                        Message::AdminStatus {
                            status: -1,
                            message: format!("connection lost to namespace \"{}\"", name),
                        }
                    }
                };
                self.send(&reply).await?;
                return Ok(Flow::Continue);
            }
        }

        let (status, message, flow) = match (command, target) {
            ("die", _) => (0, "shutting down".to_string(), Flow::Close),
            ("unlock", Some(name)) => {
                let (status, message) = self.broker.unlock_namespace(name);
                (status, message, Flow::Continue)
            }
            ("unlock", None) => (-1, "unlock needs a namespace".to_string(), Flow::Continue),
            (other, _) => (-1, format!("unknown command \"{}\"", other), Flow::Continue),
        };
        self.send(&Message::AdminStatus { status, message }).await?;
        if matches!(flow, Flow::Close) {
            info!("die requested by {}", self.peer);
            self.broker.request_shutdown();
        }
        Ok(flow)
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        debug!(
            "{} -> {}",
            self.peer,
            self.broker.config().preview(&msg.to_string())
        );
        self.conn.lock().await.send(msg).await
    }
}

/// Next message, with a size-hinted payload already resolved.
async fn read_message(conn: &mut Connection) -> Result<Option<Incoming>> {
    let Some(bytes) = conn.recv_frame().await? else {
        return Ok(None);
    };
    match frame::decode(&bytes) {
        Ok(hint @ Message::DataSizeHint { .. }) => {
            let payload = conn.recv_hinted_payload(&hint).await?;
            Ok(Some(
                match resolve_outgoing(Outgoing::Hinted { hint, payload }) {
                    Ok(msg) => Incoming::Message(msg),
                    Err(e) => Incoming::Malformed(e.to_string()),
                },
            ))
        }
        Ok(msg) => Ok(Some(Incoming::Message(msg))),
        Err(e) => Ok(Some(Incoming::Malformed(e.to_string()))),
    }
}

fn namespace_message(err: BrokerError) -> String {
    match err {
        BrokerError::Namespace { message } => message,
        other => other.to_string(),
    }
}
