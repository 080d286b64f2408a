//! Tree-walking interpreter for the built-in script language.

use super::parser::{parse_expression, parse_program, BinOp, Expr, Stmt, StmtKind, Target};
use super::{Evaluator, ScriptError};
use crate::config::ProtocolConfig;
use crate::engine::{Scope, ServiceError, SERVICE_NAME};
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

const BUILTINS: &[&str] = &["len", "str", "int", "float", "type", "sleep", "fail"];

/// Largest list `*` may build, in elements.
const MAX_REPEAT_ITEMS: usize = 1 << 24;

/// The default [`Evaluator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEvaluator;

impl Evaluator for ScriptEvaluator {
    fn run(&self, scope: &mut Scope<'_>, code: &str) -> Result<(), String> {
        let program = parse_program(code).map_err(|e| e.to_string())?;
        let mut interp = Interpreter { scope };
        for stmt in &program {
            interp.exec(stmt).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn eval(&self, scope: &mut Scope<'_>, expr: &str) -> Result<Value, String> {
        let expr = parse_expression(expr).map_err(|e| e.to_string())?;
        Interpreter { scope }
            .eval(&expr, 1)
            .map_err(|e| e.to_string())
    }
}

type Eval<T> = Result<T, ScriptError>;

struct Interpreter<'s, 'a> {
    scope: &'s mut Scope<'a>,
}

fn service_err(e: ServiceError, line: usize) -> ScriptError {
    ScriptError::new(e.kind, e.message, line)
}

impl Interpreter<'_, '_> {
    fn exec(&mut self, stmt: &Stmt) -> Eval<()> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, line)?;
            }
            StmtKind::Assign { target, op, value } => {
                let value = self.eval(value, line)?;
                match target {
                    Target::Name(name) => {
                        let value = match op {
                            Some(op) => {
                                let current = self.lookup(name, line)?;
                                binary(*op, current, value, line)?
                            }
                            None => value,
                        };
                        self.scope.set(name, value).map_err(|e| service_err(e, line))?;
                    }
                    Target::Index(name, index) => {
                        let index = self.eval(index, line)?;
                        let mut container = self.lookup(name, line)?;
                        let value = match op {
                            Some(op) => {
                                let current = index_value(&container, &index, line)?;
                                binary(*op, current, value, line)?
                            }
                            None => value,
                        };
                        store_item(&mut container, index, value, line)?;
                        self.scope
                            .set(name, container)
                            .map_err(|e| service_err(e, line))?;
                    }
                }
            }
            StmtKind::Del(target) => match target {
                Target::Name(name) => {
                    if self
                        .scope
                        .remove(name)
                        .map_err(|e| service_err(e, line))?
                        .is_none()
                    {
                        return Err(name_error(name, line));
                    }
                }
                Target::Index(name, index) => {
                    let index = self.eval(index, line)?;
                    let mut container = self.lookup(name, line)?;
                    delete_item(&mut container, &index, line)?;
                    self.scope
                        .set(name, container)
                        .map_err(|e| service_err(e, line))?;
                }
            },
        }
        Ok(())
    }

    fn lookup(&self, name: &str, line: usize) -> Eval<Value> {
        if let Some(value) = self.scope.get(name) {
            return Ok(value);
        }
        if BUILTINS.contains(&name) {
            return Ok(Value::Native(format!("<builtin {}>", name)));
        }
        Err(name_error(name, line))
    }

    fn eval(&mut self, expr: &Expr, line: usize) -> Eval<Value> {
        match expr {
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Name(name) => self.lookup(name, line),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, line)?);
                }
                Ok(Value::List(values))
            }
            Expr::Map(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let key = match self.eval(k, line)? {
                        Value::Str(s) => s,
                        other => {
                            return Err(ScriptError::new(
                                "Type",
                                format!("map keys must be str, not '{}'", other.type_name()),
                                line,
                            ))
                        }
                    };
                    let value = self.eval(v, line)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            Expr::Neg(inner) => match self.eval(inner, line)? {
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| overflow(line)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(ScriptError::new(
                    "Type",
                    format!("bad operand type for unary -: '{}'", other.type_name()),
                    line,
                )),
            },
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner, line)?.is_truthy())),
            Expr::And(left, right) => {
                let left = self.eval(left, line)?;
                if !left.is_truthy() {
                    return Ok(left);
                }
                self.eval(right, line)
            }
            Expr::Or(left, right) => {
                let left = self.eval(left, line)?;
                if left.is_truthy() {
                    return Ok(left);
                }
                self.eval(right, line)
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, line)?;
                let right = self.eval(right, line)?;
                binary(*op, left, right, line)
            }
            Expr::Index(base, index) => {
                let base = self.eval(base, line)?;
                let index = self.eval(index, line)?;
                index_value(&base, &index, line)
            }
            Expr::Attr(obj, attr) => {
                if is_service(obj) {
                    return Ok(Value::Native(format!("<method {}.{}>", SERVICE_NAME, attr)));
                }
                let obj = self.eval(obj, line)?;
                Err(no_attribute(&obj, attr, line))
            }
            Expr::Call(callee, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, line)?);
                }
                match callee.as_ref() {
                    Expr::Attr(obj, method) if is_service(obj) => self
                        .scope
                        .call_service(method, values)
                        .map_err(|e| service_err(e, line)),
                    Expr::Name(name)
                        if BUILTINS.contains(&name.as_str()) && self.scope.get(name).is_none() =>
                    {
                        call_builtin(name, values, line)
                    }
                    other => {
                        let value = self.eval(other, line)?;
                        Err(ScriptError::new(
                            "Type",
                            format!("'{}' object is not callable", value.type_name()),
                            line,
                        ))
                    }
                }
            }
        }
    }
}

fn is_service(expr: &Expr) -> bool {
    matches!(expr, Expr::Name(name) if name == SERVICE_NAME)
}

fn name_error(name: &str, line: usize) -> ScriptError {
    ScriptError::new("Name", format!("name '{}' is not defined", name), line)
}

fn overflow(line: usize) -> ScriptError {
    ScriptError::new("Overflow", "integer overflow", line)
}

fn no_attribute(obj: &Value, attr: &str, line: usize) -> ScriptError {
    ScriptError::new(
        "Attribute",
        format!("'{}' object has no attribute '{}'", obj.type_name(), attr),
        line,
    )
}

fn unsupported(op: BinOp, left: &Value, right: &Value, line: usize) -> ScriptError {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
    };
    ScriptError::new(
        "Type",
        format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            symbol,
            left.type_name(),
            right.type_name()
        ),
        line,
    )
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => {
            let (a, b) = (left.as_f64()?, right.as_f64()?);
            a.partial_cmp(&b)
        }
    }
}

/// Repeat count for a sequence of `len`, refusing results over `limit`.
fn repeat_count(len: usize, times: i64, limit: usize, line: usize) -> Eval<usize> {
    let times = usize::try_from(times).unwrap_or(0);
    match len.checked_mul(times) {
        Some(total) if total <= limit => Ok(times),
        _ => Err(ScriptError::new(
            "Memory",
            format!("repeated sequence would exceed {} items", limit),
            line,
        )),
    }
}

fn repeat<T: Clone>(items: &[T], times: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    out
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn binary(op: BinOp, left: Value, right: Value, line: usize) -> Eval<Value> {
    use crate::value::Value::{Float, Int, List, Str};

    match op {
        BinOp::Eq => return Ok(Value::Bool(values_equal(&left, &right))),
        BinOp::Ne => return Ok(Value::Bool(!values_equal(&left, &right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(&left, &right).ok_or_else(|| unsupported(op, &left, &right, line))?;
            let result = match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    let zero_div = |msg: &str| ScriptError::new("ZeroDivision", msg, line);

    match (op, &left, &right) {
        (BinOp::Add, Int(a), Int(b)) => a.checked_add(*b).map(Int).ok_or_else(|| overflow(line)),
        (BinOp::Sub, Int(a), Int(b)) => a.checked_sub(*b).map(Int).ok_or_else(|| overflow(line)),
        (BinOp::Mul, Int(a), Int(b)) => a.checked_mul(*b).map(Int).ok_or_else(|| overflow(line)),
        (BinOp::FloorDiv, Int(_), Int(0)) | (BinOp::Mod, Int(_), Int(0)) => {
            Err(zero_div("integer division or modulo by zero"))
        }
        (BinOp::FloorDiv, Int(a), Int(b)) => floor_div(*a, *b).map(Int).ok_or_else(|| overflow(line)),
        (BinOp::Mod, Int(a), Int(b)) => floor_mod(*a, *b).map(Int).ok_or_else(|| overflow(line)),
        (BinOp::Add, Str(a), Str(b)) => Ok(Str(format!("{}{}", a, b))),
        (BinOp::Add, List(a), List(b)) => Ok(List(a.iter().chain(b).cloned().collect())),
        (BinOp::Mul, Str(s), Int(n)) | (BinOp::Mul, Int(n), Str(s)) => {
            let times = repeat_count(s.len(), *n, ProtocolConfig::MAX_MESSAGE_SIZE, line)?;
            Ok(Str(s.repeat(times)))
        }
        (BinOp::Mul, List(items), Int(n)) | (BinOp::Mul, Int(n), List(items)) => {
            let times = repeat_count(items.len(), *n, MAX_REPEAT_ITEMS, line)?;
            Ok(List(repeat(items, times)))
        }
        _ => {
            let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
                return Err(unsupported(op, &left, &right, line));
            };
            match op {
                BinOp::Add => Ok(Float(a + b)),
                BinOp::Sub => Ok(Float(a - b)),
                BinOp::Mul => Ok(Float(a * b)),
                BinOp::Div if b == 0.0 => Err(zero_div("division by zero")),
                BinOp::Div => Ok(Float(a / b)),
                BinOp::FloorDiv | BinOp::Mod if b == 0.0 => Err(zero_div("float modulo or division by zero")),
                BinOp::FloorDiv => Ok(Float((a / b).floor())),
                BinOp::Mod => Ok(Float(a - b * (a / b).floor())),
                _ => Err(unsupported(op, &left, &right, line)),
            }
        }
    }
}

fn list_position(len: usize, index: i64) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let pos = if index < 0 { index + len } else { index };
    if (0..len).contains(&pos) {
        usize::try_from(pos).ok()
    } else {
        None
    }
}

fn key_error(key: &Value, line: usize) -> ScriptError {
    ScriptError::new("Key", key.repr(), line)
}

fn index_value(base: &Value, index: &Value, line: usize) -> Eval<Value> {
    match (base, index) {
        (Value::List(items), Value::Int(i)) => list_position(items.len(), *i)
            .map(|pos| items[pos].clone())
            .ok_or_else(|| ScriptError::new("Index", "list index out of range", line)),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            list_position(chars.len(), *i)
                .map(|pos| Value::Str(chars[pos].to_string()))
                .ok_or_else(|| ScriptError::new("Index", "string index out of range", line))
        }
        (Value::Map(map), Value::Str(key)) => {
            map.get(key).cloned().ok_or_else(|| key_error(index, line))
        }
        _ => Err(ScriptError::new(
            "Type",
            format!(
                "'{}' object cannot be indexed by '{}'",
                base.type_name(),
                index.type_name()
            ),
            line,
        )),
    }
}

fn store_item(container: &mut Value, index: Value, value: Value, line: usize) -> Eval<()> {
    match (container, index) {
        (Value::List(items), Value::Int(i)) => {
            let pos = list_position(items.len(), i)
                .ok_or_else(|| ScriptError::new("Index", "list assignment index out of range", line))?;
            items[pos] = value;
            Ok(())
        }
        (Value::Map(map), Value::Str(key)) => {
            map.insert(key, value);
            Ok(())
        }
        (container, index) => Err(ScriptError::new(
            "Type",
            format!(
                "'{}' object does not support item assignment with '{}'",
                container.type_name(),
                index.type_name()
            ),
            line,
        )),
    }
}

fn delete_item(container: &mut Value, index: &Value, line: usize) -> Eval<()> {
    match (container, index) {
        (Value::List(items), Value::Int(i)) => {
            let pos = list_position(items.len(), *i)
                .ok_or_else(|| ScriptError::new("Index", "list index out of range", line))?;
            items.remove(pos);
            Ok(())
        }
        (Value::Map(map), Value::Str(key)) => map
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| key_error(index, line)),
        (container, _) => Err(ScriptError::new(
            "Type",
            format!("'{}' object does not support item deletion", container.type_name()),
            line,
        )),
    }
}

fn call_builtin(name: &str, args: Vec<Value>, line: usize) -> Eval<Value> {
    let type_error = |msg: String| ScriptError::new("Type", msg, line);
    let value_error = |msg: String| ScriptError::new("Value", msg, line);

    if name == "fail" {
        let message = match args.as_slice() {
            [] => "failed".to_string(),
            [msg] => msg.to_string(),
            _ => return Err(type_error(format!("fail() takes at most 1 argument ({} given)", args.len()))),
        };
        return Err(ScriptError::new("Runtime", message, line));
    }

    let [arg] = args.as_slice() else {
        return Err(type_error(format!(
            "{}() takes exactly one argument ({} given)",
            name,
            args.len()
        )));
    };

    match name {
        "len" => {
            let len = match arg {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                other => {
                    return Err(type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            i64::try_from(len).map(Value::Int).map_err(|_| overflow(line))
        }
        "str" => Ok(Value::Str(arg.to_string())),
        "type" => Ok(Value::from(arg.type_name())),
        "int" => match arg {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Float(f) if f.is_finite() && f.abs() < 9.2e18 => Ok(Value::Int(f.trunc() as i64)),
            Value::Float(f) => Err(value_error(format!("cannot convert float {} to integer", f))),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| value_error(format!("invalid literal for int(): {}", arg.repr()))),
            other => Err(type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        },
        "float" => match arg {
            Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| value_error(format!("could not convert string to float: {}", arg.repr()))),
            other => other.as_f64().map(Value::Float).ok_or_else(|| {
                type_error(format!(
                    "float() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))
            }),
        },
        "sleep" => {
            let secs = arg.as_f64().ok_or_else(|| {
                type_error(format!("sleep() argument must be a number, not '{}'", arg.type_name()))
            })?;
            if !(secs >= 0.0) {
                return Err(value_error("sleep length must be non-negative".to_string()));
            }
            let length = Duration::try_from_secs_f64(secs)
                .map_err(|_| value_error("sleep length is too large".to_string()))?;
            std::thread::sleep(length);
            Ok(Value::Null)
        }
        other => Err(name_error(other, line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Namespace, Registry};

    fn run(ns: &Namespace, code: &str) -> Result<(), String> {
        let registry = Registry::new();
        let mut scope = Scope::new(ns, &registry, None);
        ScriptEvaluator.run(&mut scope, code)
    }

    fn eval(ns: &Namespace, expr: &str) -> Result<Value, String> {
        let registry = Registry::new();
        let mut scope = Scope::new(ns, &registry, None);
        ScriptEvaluator.eval(&mut scope, expr)
    }

    #[test]
    fn test_counter_increment() {
        let ns = Namespace::new("n");
        run(&ns, "counter = 0").unwrap();
        for _ in 0..3 {
            run(&ns, "counter = counter + 1").unwrap();
        }
        run(&ns, "counter += 10; counter -= 1").unwrap();
        assert_eq!(eval(&ns, "counter").unwrap(), Value::Int(12));
    }

    #[test]
    fn test_arithmetic() {
        let ns = Namespace::new("n");
        assert_eq!(eval(&ns, "1+1").unwrap(), Value::Int(2));
        assert_eq!(eval(&ns, "7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval(&ns, "-7 // 2").unwrap(), Value::Int(-4));
        assert_eq!(eval(&ns, "-7 % 3").unwrap(), Value::Int(2));
        assert_eq!(eval(&ns, "2 * 3.0").unwrap(), Value::Float(6.0));
        assert_eq!(eval(&ns, "'ab' * 2 + 'c'").unwrap(), Value::from("ababc"));
        assert_eq!(eval(&ns, "[1] + [2] * 2").unwrap(), Value::from(vec![1i64, 2, 2]));
    }

    #[test]
    fn test_logic_and_comparison() {
        let ns = Namespace::new("n");
        assert_eq!(eval(&ns, "1 < 2 and not 3 == 3.0").unwrap(), Value::Bool(false));
        assert_eq!(eval(&ns, "null or 'x'").unwrap(), Value::from("x"));
        assert_eq!(eval(&ns, "'a' < 'b'").unwrap(), Value::Bool(true));
        assert!(eval(&ns, "'a' < 1").unwrap_err().starts_with("TypeError"));
    }

    #[test]
    fn test_collections() {
        let ns = Namespace::new("n");
        run(&ns, "m = {'k': [1, 2, 3]}\nl = m['k']\nl[-1] = 30\nm['j'] = len(l)\ndel l[0]").unwrap();
        assert_eq!(eval(&ns, "l").unwrap(), Value::from(vec![2i64, 30]));
        assert_eq!(eval(&ns, "m['j']").unwrap(), Value::Int(3));
        assert_eq!(eval(&ns, "'hey'[1]").unwrap(), Value::from("e"));
        assert!(eval(&ns, "m['zz']").unwrap_err().starts_with("KeyError"));
        assert!(eval(&ns, "l[5]").unwrap_err().starts_with("IndexError"));
    }

    #[test]
    fn test_builtins() {
        let ns = Namespace::new("n");
        assert_eq!(eval(&ns, "int('42') + int(2.9)").unwrap(), Value::Int(44));
        assert_eq!(eval(&ns, "float('1.5')").unwrap(), Value::Float(1.5));
        assert_eq!(eval(&ns, "str(2.0)").unwrap(), Value::from("2.0"));
        assert_eq!(eval(&ns, "type([])").unwrap(), Value::from("list"));
        assert_eq!(eval(&ns, "sleep(0)").unwrap(), Value::Null);
        assert_eq!(
            run(&ns, "x = 1\nfail('boom')").unwrap_err(),
            "RuntimeError: boom (line 2)"
        );
        assert!(matches!(eval(&ns, "len").unwrap(), Value::Native(_)));
    }

    #[test]
    fn test_resource_limits_are_script_errors() {
        let ns = Namespace::new("n");
        assert_eq!(
            eval(&ns, "sleep(1e30)").unwrap_err(),
            "ValueError: sleep length is too large (line 1)"
        );
        assert!(eval(&ns, "sleep(float('inf'))").unwrap_err().starts_with("ValueError"));
        assert!(eval(&ns, "sleep(-1)").unwrap_err().starts_with("ValueError"));
        assert!(eval(&ns, "'ab' * 9223372036854775807").unwrap_err().starts_with("MemoryError"));
        assert!(eval(&ns, "[1, 2] * 4611686018427387904").unwrap_err().starts_with("MemoryError"));
        assert!(eval(&ns, "[0] * 100000000").unwrap_err().starts_with("MemoryError"));
        assert_eq!(eval(&ns, "len([0] * 1000)").unwrap(), Value::Int(1000));
        assert_eq!(eval(&ns, "'x' * -3").unwrap(), Value::from(""));
    }

    #[test]
    fn test_deep_nesting_fails_without_crashing() {
        let ns = Namespace::new("n");
        let deep = format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000));
        let err = eval(&ns, &deep).unwrap_err();
        assert!(err.starts_with("SyntaxError: expression nested too deeply"));
        assert!(run(&ns, &format!("x = {}", deep)).is_err());
        assert_eq!(eval(&ns, "1").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_errors_carry_lines() {
        let ns = Namespace::new("n");
        assert_eq!(
            run(&ns, "a = 1\n\nb = a / 0").unwrap_err(),
            "ZeroDivisionError: division by zero (line 3)"
        );
        assert_eq!(
            eval(&ns, "undefined_name").unwrap_err(),
            "NameError: name 'undefined_name' is not defined (line 1)"
        );
        assert!(run(&ns, "del nothing").unwrap_err().starts_with("NameError"));
        assert!(eval(&ns, "x = ").unwrap_err().starts_with("SyntaxError"));
    }

    #[test]
    fn test_service_calls() {
        let ns = Namespace::new("svc");
        assert_eq!(eval(&ns, "broker.name()").unwrap(), Value::from("svc"));
        assert!(eval(&ns, "broker.nope()")
            .unwrap_err()
            .starts_with("AttributeError"));
        assert!(matches!(eval(&ns, "broker.name").unwrap(), Value::Native(_)));
    }

    #[test]
    fn test_bindings_shadow_builtins() {
        let ns = Namespace::new("n");
        run(&ns, "len = 3").unwrap();
        assert_eq!(eval(&ns, "len").unwrap(), Value::Int(3));
        assert!(eval(&ns, "len([1])")
            .unwrap_err()
            .contains("is not callable"));
    }
}
