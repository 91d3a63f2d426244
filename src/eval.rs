//! Runtime values, the render scope, host callables and the evaluator seam.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;
use crate::expr::{self, BinOp, Expr, Stmt, UnaryOp};
use crate::Query;

/// A dynamically typed template value. Parameters are returned to the
/// caller as `Value`s, in placeholder order.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Zero values are falsy: null, false, 0, "", empty list and map.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Raw rendering: strings verbatim, lists comma-joined, maps as JSON.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => f.write_str(s),
            Value::List(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Value::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(i: $t) -> Self {
                Value::Int(i as i64)
            }
        })*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32, usize);

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

type PlainFn = dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync;
type QueryRefFn = dyn Fn(&[Value], &mut Query) -> Result<Value, EvalError> + Send + Sync;
type QueryOwnedFn = dyn Fn(&[Value], Query) -> Result<Query, EvalError> + Send + Sync;

/// A host callable visible to templates.
///
/// Plain functions are usable in expressions. The two query forms receive
/// the rendered output of a function block (`@ f(args) { ... }`), either to
/// edit in place or to replace.
#[derive(Clone)]
pub enum Function {
    Plain(Arc<PlainFn>),
    QueryRef(Arc<QueryRefFn>),
    QueryOwned(Arc<QueryOwnedFn>),
}

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        Function::Plain(Arc::new(f))
    }

    /// A block function that edits the rendered query in place. Returning a
    /// string replaces the SQL text and keeps the params.
    pub fn with_query<F>(f: F) -> Self
    where
        F: Fn(&[Value], &mut Query) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        Function::QueryRef(Arc::new(f))
    }

    /// A block function that takes the rendered query and returns a new one.
    pub fn with_owned_query<F>(f: F) -> Self
    where
        F: Fn(&[Value], Query) -> Result<Query, EvalError> + Send + Sync + 'static,
    {
        Function::QueryOwned(Arc::new(f))
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        match self {
            Function::Plain(f) => f(args),
            _ => Err(EvalError::call(
                name,
                "expects a query and can only be used as a function block",
            )),
        }
    }

    /// Apply this function to a function block's rendered output.
    pub fn call_block(&self, name: &str, args: &[Value], query: Query) -> Result<Query, EvalError> {
        match self {
            Function::QueryRef(f) => {
                let mut query = query;
                if let Value::String(sql) = f(args, &mut query)? {
                    query.sql = sql;
                }
                Ok(query)
            }
            Function::QueryOwned(f) => f(args, query),
            Function::Plain(_) => Err(EvalError::call(name, "does not accept a query")),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Plain(_) => f.write_str("Function::Plain"),
            Function::QueryRef(_) => f.write_str("Function::QueryRef"),
            Function::QueryOwned(_) => f.write_str("Function::QueryOwned"),
        }
    }
}

/// Variables and callables visible to one render call.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    vars: HashMap<String, Value>,
    funcs: HashMap<String, Function>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variable binding.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_function(mut self, name: impl Into<String>, function: Function) -> Self {
        self.set_function(name, function);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Bind `name`, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(name.into(), value.into())
    }

    /// Bind `name` only if unbound. Returns whether the value was stored.
    pub fn set_if_absent(&mut self, name: &str, value: Value) -> bool {
        if self.vars.contains_key(name) {
            return false;
        }
        self.vars.insert(name.to_string(), value);
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.funcs.get(name)
    }

    pub fn set_function(&mut self, name: impl Into<String>, function: Function) {
        self.funcs.insert(name.into(), function);
    }

    pub fn set_function_if_absent(&mut self, name: &str, function: Function) -> bool {
        if self.funcs.contains_key(name) {
            return false;
        }
        self.funcs.insert(name.to_string(), function);
        true
    }

    /// Copy every binding of `other` into this scope, overwriting.
    pub fn extend(&mut self, other: &Scope) {
        for (name, value) in &other.vars {
            self.vars.insert(name.clone(), value.clone());
        }
        for (name, function) in &other.funcs {
            self.funcs.insert(name.clone(), function.clone());
        }
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The expression-language seam. The engine never inspects expression text
/// itself; it hands conditions, placeholders, loop clauses and code blocks
/// to an `Evaluator`.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &str, scope: &Scope) -> Result<Value, EvalError>;

    /// Run a code block's statements, mutating `scope`.
    fn execute(&self, code: &str, scope: &mut Scope) -> Result<(), EvalError>;

    /// Resolve a function block callee (`name(args...)`) to the callable's
    /// name and its evaluated arguments.
    fn resolve_call(&self, expr: &str, scope: &Scope) -> Result<(String, Vec<Value>), EvalError>;

    fn truthy(&self, value: &Value) -> bool {
        value.is_truthy()
    }
}

/// The built-in Go-flavoured expression language.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExprEvaluator;

impl Evaluator for ExprEvaluator {
    fn evaluate(&self, expr: &str, scope: &Scope) -> Result<Value, EvalError> {
        let parsed = expr::parse_expr(expr)?;
        eval_expr(&parsed, scope)
    }

    fn execute(&self, code: &str, scope: &mut Scope) -> Result<(), EvalError> {
        for stmt in expr::parse_program(code)? {
            exec_stmt(&stmt, scope)?;
        }
        Ok(())
    }

    fn resolve_call(&self, expr: &str, scope: &Scope) -> Result<(String, Vec<Value>), EvalError> {
        match expr::parse_expr(expr)? {
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| eval_expr(arg, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((name, args))
            }
            Expr::Var(name) => Ok((name, Vec::new())),
            _ => Err(EvalError::Syntax {
                expr: expr.to_string(),
                message: "expected a function call".into(),
            }),
        }
    }
}

fn exec_stmt(stmt: &Stmt, scope: &mut Scope) -> Result<(), EvalError> {
    match stmt {
        Stmt::Declare(name, value) => {
            let value = eval_expr(value, scope)?;
            scope.set(name.as_str(), value);
        }
        Stmt::Assign(name, value) => {
            if !scope.contains(name) {
                return Err(EvalError::Undefined(name.clone()));
            }
            let value = eval_expr(value, scope)?;
            scope.set(name.as_str(), value);
        }
        Stmt::AddAssign(name, rhs) | Stmt::SubAssign(name, rhs) => {
            let current = lookup(name, scope)?;
            let rhs = eval_expr(rhs, scope)?;
            let op = if matches!(stmt, Stmt::AddAssign(..)) {
                BinOp::Add
            } else {
                BinOp::Sub
            };
            let value = binary(op, current, rhs)?;
            scope.set(name.as_str(), value);
        }
        Stmt::Incr(name) | Stmt::Decr(name) => {
            let current = lookup(name, scope)?;
            let op = if matches!(stmt, Stmt::Incr(_)) {
                BinOp::Add
            } else {
                BinOp::Sub
            };
            let value = binary(op, current, Value::Int(1))?;
            scope.set(name.as_str(), value);
        }
        Stmt::Expr(expr) => {
            eval_expr(expr, scope)?;
        }
    }
    Ok(())
}

fn lookup(name: &str, scope: &Scope) -> Result<Value, EvalError> {
    scope
        .get(name)
        .cloned()
        .ok_or_else(|| EvalError::Undefined(name.to_string()))
}

pub(crate) fn eval_expr(expr: &Expr, scope: &Scope) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => lookup(name, scope),
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|item| eval_expr(item, scope))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Attribute(obj, attr) => match eval_expr(obj, scope)? {
            Value::Map(mut m) => Ok(m.remove(attr).unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(EvalError::Type(format!(
                "cannot get field {attr} of {}",
                other.type_name()
            ))),
        },
        Expr::Index(obj, idx) => {
            let val = eval_expr(obj, scope)?;
            let idx = eval_expr(idx, scope)?;
            match (val, idx) {
                (Value::Map(mut m), Value::String(key)) => Ok(m.remove(&key).unwrap_or(Value::Null)),
                (Value::List(mut items), Value::Int(i)) => {
                    let len = items.len();
                    usize::try_from(i)
                        .ok()
                        .filter(|i| *i < len)
                        .map(|i| items.swap_remove(i))
                        .ok_or_else(|| {
                            EvalError::Type(format!("index {i} out of range for length {len}"))
                        })
                }
                (val, idx) => Err(EvalError::Type(format!(
                    "cannot index {} with {}",
                    val.type_name(),
                    idx.type_name()
                ))),
            }
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval_expr(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            match scope.function(name) {
                Some(function) => function.call(name, &args),
                None => builtin(name, &args),
            }
        }
        Expr::Unary(op, operand) => {
            let v = eval_expr(operand, scope)?;
            match (op, v) {
                (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
                (UnaryOp::Neg, Value::Int(i)) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| EvalError::Type("integer overflow".into())),
                (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                (UnaryOp::Neg, v) => Err(EvalError::Type(format!("cannot negate {}", v.type_name()))),
            }
        }
        Expr::BinOp(lhs, BinOp::And, rhs) => {
            if !eval_expr(lhs, scope)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_expr(rhs, scope)?.is_truthy()))
        }
        Expr::BinOp(lhs, BinOp::Or, rhs) => {
            if eval_expr(lhs, scope)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_expr(rhs, scope)?.is_truthy()))
        }
        Expr::BinOp(lhs, op, rhs) => {
            let l = eval_expr(lhs, scope)?;
            let r = eval_expr(rhs, scope)?;
            binary(*op, l, r)
        }
    }
}

fn builtin(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "len" => {
            let [arg] = args else {
                return Err(EvalError::call("len", format!("expects 1 argument, got {}", args.len())));
            };
            let len = match arg {
                Value::String(s) => s.chars().count(),
                Value::List(l) => l.len(),
                Value::Map(m) => m.len(),
                Value::Null => 0,
                other => {
                    return Err(EvalError::call(
                        "len",
                        format!("unsupported type {}", other.type_name()),
                    ))
                }
            };
            Ok(Value::from(len))
        }
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, EvalError> {
    let overflow = || EvalError::Type("integer overflow".into());
    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(&l, &r).ok_or_else(|| {
                EvalError::Type(format!(
                    "cannot compare {} with {}",
                    l.type_name(),
                    r.type_name()
                ))
            })?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            (l, r) => float_op(op, &l, &r, |a, b| a + b),
        },
        BinOp::Sub => match (l, r) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            (l, r) => float_op(op, &l, &r, |a, b| a - b),
        },
        BinOp::Mul => match (l, r) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            (l, r) => float_op(op, &l, &r, |a, b| a * b),
        },
        BinOp::Div => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => a.checked_div(b).map(Value::Int).ok_or_else(overflow),
            (l, r) => float_op(op, &l, &r, |a, b| a / b),
        },
        BinOp::Rem => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => a.checked_rem(b).map(Value::Int).ok_or_else(overflow),
            (l, r) => Err(EvalError::Type(format!(
                "operator % not defined on {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
        BinOp::And => Ok(Value::Bool(l.is_truthy() && r.is_truthy())),
        BinOp::Or => Ok(Value::Bool(l.is_truthy() || r.is_truthy())),
    }
}

fn float_op(op: BinOp, l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, EvalError> {
    match (l.as_float(), r.as_float()) {
        (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
        _ => Err(EvalError::Type(format!(
            "operator {op:?} not defined on {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Option<std::cmp::Ordering> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => l.as_float()?.partial_cmp(&r.as_float()?),
    }
}
