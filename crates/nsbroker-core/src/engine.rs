//! Execution engine.
//!
//! Applies the lock discipline around one evaluator call and turns every
//! failure into a field of the returned [`ExecResult`]. Nothing here returns
//! an error to the caller.
//!
//! Every namespace also exposes the reserved service object `broker` to the
//! code running in it; [`Scope::call_service`] implements its methods.

use crate::evaluator::Evaluator;
use crate::protocol::{ExecRequest, ExecResult};
use crate::registry::{ConnectionId, DisconnectHook, Namespace, Registry};
use crate::results::{ReadOutcome, ReadTimeout};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Name of the service object bound in every namespace.
pub const SERVICE_NAME: &str = "broker";

/// A failed service call, surfaced to scripts as `<kind>Error`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceError {
    pub kind: &'static str,
    pub message: String,
}

impl ServiceError {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn arity(method: &str, expected: &str, given: usize) -> Self {
        Self::new(
            "Type",
            format!(
                "{}.{}() takes {} ({} given)",
                SERVICE_NAME, method, expected, given
            ),
        )
    }
}

/// What an evaluator sees of a namespace during one execution.
pub struct Scope<'a> {
    namespace: &'a Namespace,
    registry: &'a Registry,
    connection: Option<ConnectionId>,
    reply: Option<ExecResult>,
}

impl<'a> Scope<'a> {
    pub fn new(
        namespace: &'a Namespace,
        registry: &'a Registry,
        connection: Option<ConnectionId>,
    ) -> Self {
        Self {
            namespace,
            registry,
            connection,
            reply: None,
        }
    }

    pub fn namespace_name(&self) -> &str {
        self.namespace.name()
    }

    /// Binding `name`; the reserved service name always resolves to the
    /// service object.
    pub fn get(&self, name: &str) -> Option<Value> {
        if name == SERVICE_NAME {
            return Some(self.service_object());
        }
        self.namespace.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<(), ServiceError> {
        reserved_check(name)?;
        self.namespace.set(name, value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Option<Value>, ServiceError> {
        reserved_check(name)?;
        Ok(self.namespace.remove(name))
    }

    /// A stored result that replaces this execution's own reply.
    pub fn take_reply(&mut self) -> Option<ExecResult> {
        self.reply.take()
    }

    fn service_object(&self) -> Value {
        Value::Native(format!(
            "<{} service of namespace \"{}\">",
            SERVICE_NAME,
            self.namespace.name()
        ))
    }

    /// Invoke `broker.<method>(args...)`.
    pub fn call_service(&mut self, method: &str, args: Vec<Value>) -> Result<Value, ServiceError> {
        match method {
            "read_rv" => self.read_rv(args),
            "poll_rvs" => {
                expect_args(method, &args, 0, 0)?;
                Ok(Value::List(
                    self.namespace
                        .results()
                        .poll()
                        .into_iter()
                        .map(|h| Value::Str(h.result_id))
                        .collect(),
                ))
            }
            "ns_type" => {
                expect_args(method, &args, 1, 1)?;
                let name = str_arg(method, &args[0])?;
                Ok(self
                    .registry
                    .ns_type(name)
                    .map(Value::from)
                    .unwrap_or(Value::Null))
            }
            "local_nss" => {
                expect_args(method, &args, 0, 0)?;
                Ok(Value::from(self.registry.local_names()))
            }
            "remote_nss" => {
                expect_args(method, &args, 0, 0)?;
                Ok(Value::from(self.registry.remote_names()))
            }
            "name" => {
                expect_args(method, &args, 0, 0)?;
                Ok(Value::from(self.namespace.name()))
            }
            "exec_on_disconnect" => {
                expect_args(method, &args, 1, 2)?;
                let code = str_arg(method, &args[0])?.to_string();
                let any = args.get(1).map(Value::is_truthy).unwrap_or(false);
                // outside a connection the hook fires on every disconnect
                let connection = if any { None } else { self.connection };
                self.namespace
                    .add_disconnect_hook(DisconnectHook { connection, code });
                Ok(Value::Null)
            }
            "exec_on_drop" => {
                expect_args(method, &args, 1, 1)?;
                let code = str_arg(method, &args[0])?;
                self.namespace.add_drop_hook(code);
                Ok(Value::Null)
            }
            other => Err(ServiceError::new(
                "Attribute",
                format!("'{}' service has no method '{}'", SERVICE_NAME, other),
            )),
        }
    }

    fn read_rv(&mut self, args: Vec<Value>) -> Result<Value, ServiceError> {
        expect_args("read_rv", &args, 1, 2)?;
        let id = str_arg("read_rv", &args[0])?;
        let timeout = match args.get(1) {
            None | Some(Value::Null) => ReadTimeout::NonBlocking,
            Some(v) => ReadTimeout::from_secs(v.as_f64().ok_or_else(|| {
                ServiceError::new(
                    "Type",
                    format!("read_rv() timeout must be a number, not '{}'", v.type_name()),
                )
            })?),
        };
        match self.namespace.results().read(id, timeout) {
            ReadOutcome::Ready(result) => {
                let value = result.value.clone();
                self.reply = Some(result);
                Ok(value)
            }
            ReadOutcome::Busy => Ok(Value::Busy),
            ReadOutcome::NotFound => Err(ServiceError::new(
                "Key",
                format!(
                    "result id \"{}\" not found in namespace \"{}\"",
                    id,
                    self.namespace.name()
                ),
            )),
        }
    }
}

fn reserved_check(name: &str) -> Result<(), ServiceError> {
    if name == SERVICE_NAME {
        return Err(ServiceError::new(
            "Name",
            format!("'{}' is reserved", SERVICE_NAME),
        ));
    }
    Ok(())
}

fn expect_args(method: &str, args: &[Value], min: usize, max: usize) -> Result<(), ServiceError> {
    if args.len() < min || args.len() > max {
        let expected = match (min, max) {
            (0, 0) => "no arguments".to_string(),
            (a, b) if a == b => format!("{} argument(s)", a),
            (a, b) => format!("{} to {} arguments", a, b),
        };
        return Err(ServiceError::arity(method, &expected, args.len()));
    }
    Ok(())
}

fn str_arg<'v>(method: &str, value: &'v Value) -> Result<&'v str, ServiceError> {
    value.as_str().ok_or_else(|| {
        ServiceError::new(
            "Type",
            format!(
                "{}.{}() expects a string, not '{}'",
                SERVICE_NAME,
                method,
                value.type_name()
            ),
        )
    })
}

/// Runs requests against local namespaces through an [`Evaluator`].
#[derive(Clone)]
pub struct ExecutionEngine {
    evaluator: Arc<dyn Evaluator>,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine").finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self { evaluator }
    }

    pub fn execute(
        &self,
        registry: &Registry,
        namespace: &Namespace,
        request: &ExecRequest,
        connection: Option<ConnectionId>,
    ) -> ExecResult {
        self.run(
            registry,
            namespace,
            request.code(),
            request.expr(),
            request.lock,
            connection,
        )
    }

    /// Run `code`, then evaluate `expr` unless the code failed.
    ///
    /// With `lock`, the namespace lock is held for the whole call. Blocks the
    /// calling thread.
    pub fn run(
        &self,
        registry: &Registry,
        namespace: &Namespace,
        code: Option<&str>,
        expr: Option<&str>,
        lock: bool,
        connection: Option<ConnectionId>,
    ) -> ExecResult {
        let _guard = lock.then(|| namespace.lock().acquire());
        let mut scope = Scope::new(namespace, registry, connection);
        let mut result = ExecResult::default();

        if let Some(code) = code {
            if let Err(e) = self.evaluator.run(&mut scope, code) {
                debug!("code failed in \"{}\": {}", namespace.name(), e);
                result.code_exception = Some(e);
            }
        }
        if result.code_exception.is_none() {
            if let Some(expr) = expr {
                match self.evaluator.eval(&mut scope, expr) {
                    Ok(value) => result.value = value,
                    Err(e) => {
                        debug!("expression failed in \"{}\": {}", namespace.name(), e);
                        result.expr_exception = Some(e);
                    }
                }
            }
        }

        scope.take_reply().unwrap_or(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::ScriptEvaluator;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(ScriptEvaluator))
    }

    #[test]
    fn test_code_then_expression() {
        let registry = Registry::new();
        let ns = Namespace::new("n");
        let rv = engine().run(&registry, &ns, Some("x = 40"), Some("x + 2"), true, None);
        assert_eq!(rv, ExecResult::ok(Value::Int(42)));
    }

    #[test]
    fn test_code_failure_skips_expression() {
        let registry = Registry::new();
        let ns = Namespace::new("n");
        let rv = engine().run(
            &registry,
            &ns,
            Some("a = 1\nb = missing"),
            Some("a"),
            true,
            None,
        );
        assert_eq!(
            rv.code_exception.as_deref(),
            Some("NameError: name 'missing' is not defined (line 2)")
        );
        assert!(rv.expr_exception.is_none());
        assert_eq!(rv.value, Value::Null);
        // partial effects stay
        assert_eq!(ns.get("a"), Some(Value::Int(1)));
    }

    #[test]
    fn test_expression_failure() {
        let registry = Registry::new();
        let ns = Namespace::new("n");
        let rv = engine().run(&registry, &ns, Some("x = 1"), Some("x / 0"), true, None);
        assert!(rv.code_exception.is_none());
        assert!(rv
            .expr_exception
            .as_deref()
            .is_some_and(|e| e.starts_with("ZeroDivisionError")));
        assert_eq!(ns.get("x"), Some(Value::Int(1)));
    }

    #[test]
    fn test_lock_released_after_failure() {
        let registry = Registry::new();
        let ns = Namespace::new("n");
        engine().run(&registry, &ns, Some("fail('boom')"), None, true, None);
        assert!(!ns.lock().is_locked());
    }

    #[test]
    fn test_read_rv_replaces_reply() {
        let registry = Registry::new();
        let ns = Namespace::new("n");
        let handle = ns.results().begin();
        let stored = ExecResult {
            code_exception: None,
            expr_exception: Some("ValueError: bad (line 1)".into()),
            value: Value::Null,
            connection_lost: None,
        };
        ns.results().complete(&handle, stored.clone());

        let expr = format!("broker.read_rv(\"{}\")", handle.result_id);
        let rv = engine().run(&registry, &ns, None, Some(&expr), false, None);
        assert_eq!(rv, stored);

        let again = engine().run(&registry, &ns, None, Some(&expr), false, None);
        assert!(again
            .expr_exception
            .as_deref()
            .is_some_and(|e| e.contains("not found in namespace \"n\"")));
    }

    #[test]
    fn test_read_rv_busy() {
        let registry = Registry::new();
        let ns = Namespace::new("n");
        let handle = ns.results().begin();
        let expr = format!("broker.read_rv('{}', 0)", handle.result_id);
        let rv = engine().run(&registry, &ns, None, Some(&expr), false, None);
        assert_eq!(rv, ExecResult::ok(Value::Busy));
    }

    #[test]
    fn test_service_listing() {
        let registry = Registry::new();
        let ns = registry.get_or_create("a", true).unwrap();
        registry.get_or_create("b", true).unwrap();
        let rv = engine().run(
            &registry,
            &ns,
            None,
            Some("[broker.name(), broker.local_nss(), broker.ns_type('zz')]"),
            true,
            None,
        );
        assert_eq!(
            rv.value,
            Value::List(vec![
                Value::from("a"),
                Value::from(vec!["a", "b"]),
                Value::Null
            ])
        );
    }

    #[test]
    fn test_hooks_are_registered() {
        let registry = Registry::new();
        let ns = Namespace::new("n");
        engine().run(
            &registry,
            &ns,
            Some("broker.exec_on_disconnect('gone = 1')\nbroker.exec_on_drop('x = 0')"),
            None,
            true,
            Some(5),
        );
        assert_eq!(ns.take_disconnect_hooks(4), Vec::<String>::new());
        assert_eq!(ns.take_disconnect_hooks(5), vec!["gone = 1".to_string()]);
        assert_eq!(ns.drop_hooks(), vec!["x = 0".to_string()]);
    }

    #[test]
    fn test_service_name_is_reserved() {
        let registry = Registry::new();
        let ns = Namespace::new("n");
        let rv = engine().run(&registry, &ns, Some("broker = 1"), None, true, None);
        assert!(rv
            .code_exception
            .as_deref()
            .is_some_and(|e| e.starts_with("NameError")));

        let rv = engine().run(&registry, &ns, None, Some("broker"), true, None);
        assert!(matches!(rv.value, Value::Native(_)));
    }
}
