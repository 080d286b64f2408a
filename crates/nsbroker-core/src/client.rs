//! Client façade over one broker connection.
//!
//! Every call sends one request and waits for its reply. The connection sits
//! behind a tokio `Mutex`, so a shared `Client` serializes concurrent callers;
//! use one client per task for real parallelism.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::hostspec::HostSpec;
use crate::protocol::{AsyncHandle, ExecRequest, ExecResult, Message, CAP_ALL};
use crate::value::Value;
use crate::{BrokerError, Result};
use tokio::sync::Mutex;
use tracing::debug;

/// Reply to an Exec: a value, or a handle when the request was async.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Value(Value),
    Pending(AsyncHandle),
}

/// State of an async result read with a timeout.
#[derive(Debug, Clone, PartialEq)]
pub enum RvState {
    Ready(Value),
    Busy,
}

/// Connection to a broker with typed calls.
#[derive(Debug)]
pub struct Client {
    conn: Mutex<Connection>,
    peer: String,
    default_namespace: String,
}

impl Client {
    /// Connect to a host spec, authenticating if it carries a password.
    ///
    /// A `/namespace` suffix becomes the default namespace.
    pub async fn connect(spec: &str) -> Result<Self> {
        Self::connect_spec(&HostSpec::parse(spec)?).await
    }

    pub async fn connect_spec(spec: &HostSpec) -> Result<Self> {
        let mut client = Self::from_connection(spec.open().await?);
        if let Some(ns) = &spec.namespace {
            client.default_namespace = ns.clone();
        }
        if let Some(password) = &spec.password {
            client.authenticate(password).await?;
        }
        debug!("connected to {}", spec);
        Ok(client)
    }

    /// Wrap an already open connection; no handshake is sent.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            peer: conn.peer().to_string(),
            conn: Mutex::new(conn),
            default_namespace: ServerConfig::DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Give up the façade and return the channel, e.g. to serve it after
    /// an export.
    pub fn into_connection(self) -> Connection {
        self.conn.into_inner()
    }

    pub async fn authenticate(&self, password: &str) -> Result<()> {
        let reply = self
            .request(&Message::Auth {
                password: password.to_string(),
            })
            .await?;
        match reply {
            Message::AuthStatus { ok: true, .. } => Ok(()),
            Message::AuthStatus { error, .. } => Err(BrokerError::Authentication {
                message: error.unwrap_or_else(|| "rejected".to_string()),
            }),
            other => Err(unexpected("AuthStatus", &other)),
        }
    }

    /// Send one message and wait for the (size-hint resolved) reply.
    pub async fn request(&self, msg: &Message) -> Result<Message> {
        let lost = || BrokerError::ConnectionLost {
            peer: self.peer.clone(),
        };
        let mut conn = self.conn.lock().await;
        conn.send(msg).await.map_err(|e| match e {
            BrokerError::Io { .. } => lost(),
            other => other,
        })?;
        match conn.recv_resolved().await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(BrokerError::Io { .. }) => Err(lost()),
            Err(e) => Err(e),
        }
    }

    /// Run a full Exec request.
    pub async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome> {
        let request = request.with_recv_caps(CAP_ALL);
        match self.request(&Message::Exec(request)).await? {
            Message::ExecResult(result) => unpack(result).map(ExecOutcome::Value),
            Message::AsyncHandle(handle) => Ok(ExecOutcome::Pending(handle)),
            other => Err(status_error("ExecResult", other)),
        }
    }

    async fn execute_value(&self, request: ExecRequest) -> Result<Value> {
        match self.execute(request).await? {
            ExecOutcome::Value(value) => Ok(value),
            ExecOutcome::Pending(handle) => Err(BrokerError::protocol(format!(
                "expected a value, got {}",
                handle
            ))),
        }
    }

    async fn execute_async(&self, request: ExecRequest) -> Result<AsyncHandle> {
        match self.execute(request.asynchronous(true)).await? {
            ExecOutcome::Pending(handle) => Ok(handle),
            ExecOutcome::Value(value) => Err(BrokerError::protocol(format!(
                "expected an async handle, got {}",
                value
            ))),
        }
    }

    pub async fn exec_in(&self, namespace: &str, code: &str) -> Result<()> {
        self.execute_value(ExecRequest::new(namespace).with_code(code))
            .await
            .map(|_| ())
    }

    pub async fn eval_in(&self, namespace: &str, expr: &str) -> Result<Value> {
        self.execute_value(ExecRequest::new(namespace).with_expr(expr))
            .await
    }

    /// Run `code`, then evaluate `expr` in the same locked call.
    pub async fn exec_eval_in(&self, namespace: &str, code: &str, expr: &str) -> Result<Value> {
        self.execute_value(ExecRequest::new(namespace).with_code(code).with_expr(expr))
            .await
    }

    pub async fn exec_async_in(&self, namespace: &str, code: &str) -> Result<AsyncHandle> {
        self.execute_async(ExecRequest::new(namespace).with_code(code))
            .await
    }

    pub async fn eval_async_in(&self, namespace: &str, expr: &str) -> Result<AsyncHandle> {
        self.execute_async(ExecRequest::new(namespace).with_expr(expr))
            .await
    }

    pub async fn exec(&self, code: &str) -> Result<()> {
        self.exec_in(&self.default_namespace, code).await
    }

    pub async fn eval(&self, expr: &str) -> Result<Value> {
        self.eval_in(&self.default_namespace, expr).await
    }

    /// Wait for an async result and take it.
    ///
    /// Failures of the async code come back as `RemoteExec`/`RemoteEval`;
    /// a second read of the same handle fails with a not-found error.
    pub async fn read_rv(&self, handle: &AsyncHandle) -> Result<Value> {
        match self.read_rv_timeout(handle, -1.0).await? {
            RvState::Ready(value) => Ok(value),
            RvState::Busy => Err(BrokerError::protocol(format!(
                "blocking read of {} returned busy",
                handle
            ))),
        }
    }

    /// Read an async result, waiting at most `timeout` seconds.
    ///
    /// `0` never waits, a negative timeout waits until the result is ready.
    pub async fn read_rv_timeout(&self, handle: &AsyncHandle, timeout: f64) -> Result<RvState> {
        let timeout = if timeout.is_nan() {
            0.0
        } else if timeout < 0.0 || timeout.is_infinite() {
            -1.0
        } else {
            timeout
        };
        let expr = format!(
            "broker.read_rv({}, {:?})",
            Value::from(handle.result_id.as_str()).repr(),
            timeout
        );
        let request = ExecRequest::new(&handle.namespace)
            .with_expr(expr)
            .lock(false);
        match self.execute_value(request).await? {
            Value::Busy => Ok(RvState::Busy),
            value => Ok(RvState::Ready(value)),
        }
    }

    /// Ids of the finished async results waiting in `namespace`.
    pub async fn poll_rvs(&self, namespace: &str) -> Result<Vec<AsyncHandle>> {
        let request = ExecRequest::new(namespace)
            .with_expr("broker.poll_rvs()")
            .lock(false);
        let ids = string_list(self.execute_value(request).await?)?;
        Ok(ids
            .into_iter()
            .map(|id| AsyncHandle::new(namespace, id))
            .collect())
    }

    /// Offer `namespace` to the server; on success this connection carries
    /// the server's forwarded requests from now on.
    pub async fn export_ns(&self, namespace: &str) -> Result<()> {
        self.namespace_request(Message::RegisterNamespace {
            namespace: namespace.to_string(),
        })
        .await
    }

    pub async fn import_ns(&self, namespace: &str) -> Result<()> {
        self.namespace_request(Message::RequestNamespace {
            namespace: namespace.to_string(),
        })
        .await
    }

    pub async fn drop_ns(&self, namespace: &str) -> Result<()> {
        self.namespace_request(Message::DropNamespace {
            namespace: namespace.to_string(),
        })
        .await
    }

    async fn namespace_request(&self, msg: Message) -> Result<()> {
        match self.request(&msg).await? {
            Message::NamespaceStatus { ok: true, .. } => Ok(()),
            other => Err(status_error("NamespaceStatus", other)),
        }
    }

    /// Send an administrative command; returns the status pair.
    pub async fn admin(&self, command: &str, args: &[&str]) -> Result<(i32, String)> {
        let msg = Message::AdminCommand {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        match self.request(&msg).await? {
            Message::AdminStatus { status, message } => Ok((status, message)),
            other => Err(status_error("AdminStatus", other)),
        }
    }

    /// Force-release a namespace lock; returns the server's message.
    pub async fn unlock_ns(&self, namespace: &str) -> Result<String> {
        match self.admin("unlock", &[namespace]).await? {
            (status, message) if status >= 0 => Ok(message),
            (_, message) => Err(BrokerError::namespace(message)),
        }
    }

    /// Ask the server (or, for a remote `namespace`, its owner) to shut down.
    pub async fn kill_server(&self, namespace: Option<&str>) -> Result<()> {
        let args: Vec<&str> = namespace.into_iter().collect();
        match self.admin("die", &args).await? {
            (0, _) => Ok(()),
            (_, message) => Err(BrokerError::Other(message)),
        }
    }

    pub async fn ls_local(&self) -> Result<Vec<String>> {
        string_list(self.service_call("broker.local_nss()").await?)
    }

    pub async fn ls_remote(&self) -> Result<Vec<String>> {
        string_list(self.service_call("broker.remote_nss()").await?)
    }

    /// `"local"`, `"remote"` or `None` for an unknown name.
    pub async fn ns_type(&self, namespace: &str) -> Result<Option<String>> {
        let expr = format!("broker.ns_type({})", Value::from(namespace).repr());
        match self.service_call(&expr).await? {
            Value::Null => Ok(None),
            Value::Str(kind) => Ok(Some(kind)),
            other => Err(BrokerError::protocol(format!(
                "unexpected ns_type reply {}",
                other.repr()
            ))),
        }
    }

    async fn service_call(&self, expr: &str) -> Result<Value> {
        let request = ExecRequest::new(&self.default_namespace)
            .with_expr(expr)
            .lock(false);
        self.execute_value(request).await
    }
}

/// Turn a reply into a value, raising the namespace-side failure if any.
fn unpack(result: ExecResult) -> Result<Value> {
    if let Some(peer) = result.connection_lost {
        return Err(BrokerError::ConnectionLost { peer });
    }
    if let Some(e) = result.code_exception {
        return Err(BrokerError::RemoteExec(e));
    }
    if let Some(e) = result.expr_exception {
        return Err(BrokerError::RemoteEval(e));
    }
    Ok(result.value)
}

fn status_error(expected: &str, reply: Message) -> BrokerError {
    match reply {
        Message::NamespaceStatus { error, .. } => {
            BrokerError::namespace(error.unwrap_or_else(|| "refused".to_string()))
        }
        Message::AuthStatus { error, .. } => BrokerError::Authentication {
            message: error.unwrap_or_else(|| "required".to_string()),
        },
        Message::Rejected { error } => BrokerError::protocol(error),
        other => unexpected(expected, &other),
    }
}

fn unexpected(expected: &str, reply: &Message) -> BrokerError {
    BrokerError::protocol(format!("expected {}, got {}", expected, reply.kind()))
}

fn string_list(value: Value) -> Result<Vec<String>> {
    let Value::List(items) = value else {
        return Err(BrokerError::protocol(format!(
            "expected a list, got {}",
            value.type_name()
        )));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Str(s) => Ok(s),
            other => Err(BrokerError::protocol(format!(
                "expected a string, got {}",
                other.type_name()
            ))),
        })
        .collect()
}
