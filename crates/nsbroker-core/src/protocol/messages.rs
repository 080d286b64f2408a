//! Message records exchanged over a broker connection.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Receiver understands a [`Message::DataSizeHint`] before large replies.
pub const CAP_DATA_INFO: u32 = 0x1;
/// Receiver can inflate zlib-compressed payloads announced by a hint.
pub const CAP_COMPRESSION: u32 = 0x2;
/// Everything this implementation understands.
pub const CAP_ALL: u32 = CAP_DATA_INFO | CAP_COMPRESSION;

fn default_lock() -> bool {
    true
}

/// Request to run code and/or evaluate an expression in a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default = "default_lock")]
    pub lock: bool,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default)]
    pub recv_caps: u32,
}

impl ExecRequest {
    /// A synchronous, locked request with nothing to run yet.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            code: None,
            expr: None,
            lock: true,
            is_async: false,
            recv_caps: 0,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_expr(mut self, expr: impl Into<String>) -> Self {
        self.expr = Some(expr.into());
        self
    }

    pub fn lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn asynchronous(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn with_recv_caps(mut self, caps: u32) -> Self {
        self.recv_caps = caps;
        self
    }

    /// Code to run, if any non-empty code was sent.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref().filter(|c| !c.trim().is_empty())
    }

    /// Expression to evaluate, if any non-empty expression was sent.
    pub fn expr(&self) -> Option<&str> {
        self.expr.as_deref().filter(|e| !e.trim().is_empty())
    }

    pub fn supports_data_info(&self) -> bool {
        self.recv_caps & CAP_DATA_INFO != 0
    }

    pub fn supports_compression(&self) -> bool {
        self.recv_caps & CAP_COMPRESSION != 0
    }
}

/// Outcome of one execution.
///
/// At most one of `code_exception`, `expr_exception` and a meaningful
/// `value` is set: a code failure skips the expression, and an expression
/// failure leaves `value` null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr_exception: Option<String>,
    #[serde(default)]
    pub value: Value,
    /// Set by a forwarding broker when the namespace owner went away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_lost: Option<String>,
}

impl ExecResult {
    pub fn ok(value: Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    /// Result reporting the same failure for code and expression.
    ///
    /// Used when the execution could not be attempted at all.
    pub fn unreachable(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code_exception: Some(message.clone()),
            expr_exception: Some(message),
            value: Value::Null,
            connection_lost: None,
        }
    }

    /// Result for a forwarded call whose owner `peer` dropped the link.
    ///
    /// The exceptions are filled in too, so peers that ignore the marker
    /// still see a failure.
    pub fn connection_lost(peer: impl Into<String>) -> Self {
        let peer = peer.into();
        Self {
            connection_lost: Some(peer.clone()),
            ..Self::unreachable(format!("connection lost to {}", peer))
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code_exception.is_none() && self.expr_exception.is_none()
    }
}

/// Reference to a result being computed asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AsyncHandle {
    pub namespace: String,
    pub result_id: String,
}

impl AsyncHandle {
    pub fn new(namespace: impl Into<String>, result_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            result_id: result_id.into(),
        }
    }
}

impl fmt::Display for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsyncHandle({}/{})", self.namespace, self.result_id)
    }
}

/// Every record that can appear on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// First message on a password-protected connection.
    Auth { password: String },
    AuthStatus {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Exec(ExecRequest),
    ExecResult(ExecResult),
    AsyncHandle(AsyncHandle),
    /// Export: the sender owns `namespace` and wants its traffic.
    RegisterNamespace { namespace: String },
    /// Import: the sender wants to run work submitted for `namespace`.
    RequestNamespace { namespace: String },
    DropNamespace { namespace: String },
    NamespaceStatus {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Announces that the next frame is a raw payload of `length` bytes.
    DataSizeHint {
        data_kind: String,
        length: u64,
        format: String,
    },
    AdminCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    AdminStatus { status: i32, message: String },
    /// Reply to a frame that could not be understood.
    Rejected { error: String },
}

impl Message {
    pub fn namespace_ok() -> Self {
        Message::NamespaceStatus {
            ok: true,
            error: None,
        }
    }

    pub fn namespace_failed(error: impl Into<String>) -> Self {
        Message::NamespaceStatus {
            ok: false,
            error: Some(error.into()),
        }
    }

    /// Short name of the message type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "Auth",
            Message::AuthStatus { .. } => "AuthStatus",
            Message::Exec(_) => "Exec",
            Message::ExecResult(_) => "ExecResult",
            Message::AsyncHandle(_) => "AsyncHandle",
            Message::RegisterNamespace { .. } => "RegisterNamespace",
            Message::RequestNamespace { .. } => "RequestNamespace",
            Message::DropNamespace { .. } => "DropNamespace",
            Message::NamespaceStatus { .. } => "NamespaceStatus",
            Message::DataSizeHint { .. } => "DataSizeHint",
            Message::AdminCommand { .. } => "AdminCommand",
            Message::AdminStatus { .. } => "AdminStatus",
            Message::Rejected { .. } => "Rejected",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // never log secrets
            Message::Auth { .. } => write!(f, "Auth(***)"),
            Message::Exec(req) => write!(
                f,
                "Exec(namespace={:?}, code={:?}, expr={:?}, lock={}, async={})",
                req.namespace,
                req.code.as_deref().unwrap_or(""),
                req.expr.as_deref().unwrap_or(""),
                req.lock,
                req.is_async
            ),
            Message::ExecResult(rv) => write!(
                f,
                "ExecResult(code_exception={:?}, expr_exception={:?}, value={})",
                rv.code_exception.as_deref().unwrap_or(""),
                rv.expr_exception.as_deref().unwrap_or(""),
                rv.value.repr()
            ),
            other => match serde_json::to_string(other) {
                Ok(json) => write!(f, "{}", json),
                Err(_) => write!(f, "{}", other.kind()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_request_defaults_on_decode() {
        let msg: Message =
            serde_json::from_str(r#"{"exec":{"namespace":"n","expr":"1+1"}}"#).unwrap();
        match msg {
            Message::Exec(req) => {
                assert!(req.lock);
                assert!(!req.is_async);
                assert_eq!(req.recv_caps, 0);
                assert_eq!(req.expr(), Some("1+1"));
                assert_eq!(req.code(), None);
            }
            other => panic!("Expected Exec, got: {:?}", other),
        }
    }

    #[test]
    fn test_async_field_name_on_wire() {
        let req = ExecRequest::new("n").with_code("x = 1").asynchronous(true);
        let json = serde_json::to_string(&Message::Exec(req)).unwrap();
        assert!(json.contains("\"async\":true"));
        assert!(!json.contains("\"expr\""));
    }

    #[test]
    fn test_blank_code_counts_as_absent() {
        let req = ExecRequest::new("n").with_code("   ").with_expr("");
        assert_eq!(req.code(), None);
        assert_eq!(req.expr(), None);
    }

    #[test]
    fn test_auth_display_hides_password() {
        let msg = Message::Auth {
            password: "secret".into(),
        };
        assert!(!msg.to_string().contains("secret"));
    }

    #[test]
    fn test_unreachable_result_sets_both_fields() {
        let rv = ExecResult::unreachable("connection lost");
        assert!(!rv.is_ok());
        assert_eq!(rv.code_exception.as_deref(), Some("connection lost"));
        assert_eq!(rv.expr_exception.as_deref(), Some("connection lost"));
        assert_eq!(rv.connection_lost, None);
    }

    #[test]
    fn test_connection_lost_marker_on_wire() {
        let rv = ExecResult::connection_lost("namespace \"n\"");
        assert!(!rv.is_ok());
        let json = serde_json::to_value(&rv).unwrap();
        assert_eq!(json["connection_lost"], "namespace \"n\"");
        assert_eq!(json["code_exception"], "connection lost to namespace \"n\"");

        let plain = serde_json::to_value(ExecResult::ok(Value::Int(1))).unwrap();
        assert!(plain.get("connection_lost").is_none());
    }
}
