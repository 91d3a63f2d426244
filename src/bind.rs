//! Turning render arguments into a [`Scope`].
//!
//! Arguments come in three shapes: a ready-made scope, a string-keyed map
//! (usually produced by serializing a serde type), or a host record that
//! describes its own fields and methods through [`Record`].
//!
//! Records are flattened: every field is bound under its own name and under
//! a lower-first alias (`UserName` -> `userName`), embedded records are
//! walked in declaration order, and the first binding of a name wins.
//! Methods bind under their own name only.
//! Unexported fields and pointer-receiver methods are only visible when the
//! record is passed by reference (see [`Args::pointer`]).

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::trace;

use crate::error::{BindError, EvalError};
use crate::eval::{Function, Scope, Value};
use crate::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    Value,
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub embedded: bool,
    pub exported: bool,
}

impl FieldDef {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            embedded: false,
            exported: true,
        }
    }

    pub fn private(name: &'static str) -> Self {
        Self {
            exported: false,
            ..Self::new(name)
        }
    }

    pub fn embedded(name: &'static str) -> Self {
        Self {
            embedded: true,
            ..Self::new(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub name: &'static str,
    pub receiver: Receiver,
    /// The method receives the function block's query.
    pub takes_query: bool,
}

impl MethodDef {
    pub fn value(name: &'static str) -> Self {
        Self {
            name,
            receiver: Receiver::Value,
            takes_query: false,
        }
    }

    pub fn pointer(name: &'static str) -> Self {
        Self {
            receiver: Receiver::Pointer,
            ..Self::value(name)
        }
    }

    pub fn with_query(mut self) -> Self {
        self.takes_query = true;
        self
    }
}

/// Static description of a record type, cached per [`TypeId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordShape {
    pub type_name: &'static str,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
}

/// Arguments passed to a record method.
pub struct MethodCall<'a> {
    pub args: &'a [Value],
    pub query: Option<&'a mut Query>,
}

/// A host value whose fields and methods are exposed to templates.
///
/// `shape` must describe the same fields and methods for every value of a
/// type; it is computed once per type and cached.
pub trait Record: Send + 'static {
    fn shape(&self) -> RecordShape;

    fn field(&self, name: &str) -> Option<Value>;

    fn embedded(&self, _name: &str) -> Option<&dyn Record> {
        None
    }

    fn embedded_mut(&mut self, _name: &str) -> Option<&mut dyn Record> {
        None
    }

    fn call(&self, method: &str, _call: MethodCall<'_>) -> Result<Value, EvalError> {
        Err(EvalError::UnknownFunction(method.to_string()))
    }

    fn call_mut(&mut self, method: &str, call: MethodCall<'_>) -> Result<Value, EvalError> {
        self.call(method, call)
    }

    fn record_type(&self) -> TypeId {
        TypeId::of::<Self>()
    }
}

/// Process-wide cache of record shapes. Entries are never invalidated.
#[derive(Debug, Default)]
pub struct TypeCache {
    shapes: RwLock<HashMap<TypeId, Arc<RecordShape>>>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shape_of(&self, record: &dyn Record) -> Arc<RecordShape> {
        let key = record.record_type();
        if let Some(shape) = self.shapes.read().get(&key) {
            return Arc::clone(shape);
        }

        let mut shapes = self.shapes.write();
        // Another thread may have built it between the two locks.
        if let Some(shape) = shapes.get(&key) {
            return Arc::clone(shape);
        }
        let shape = Arc::new(record.shape());
        trace!(type_name = shape.type_name, "cached record shape");
        shapes.insert(key, Arc::clone(&shape));
        shape
    }

    pub fn len(&self) -> usize {
        self.shapes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type SharedRecord = Arc<Mutex<dyn Record>>;

/// Render arguments.
#[derive(Clone, Default)]
pub enum Args {
    #[default]
    None,
    Map(BTreeMap<String, Value>),
    Scope(Scope),
    Record {
        record: SharedRecord,
        addressable: bool,
    },
}

impl Args {
    /// Serialize any serde value into a map of arguments.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, BindError> {
        let json = serde_json::to_value(value).map_err(|e| BindError::Serialize(e.to_string()))?;
        match Value::from(json) {
            Value::Map(map) => Ok(Args::Map(map)),
            Value::Null => Ok(Args::None),
            other => Err(BindError::NotAMap(other.type_name())),
        }
    }

    /// Pass a record by value: exported fields and value-receiver methods.
    pub fn record<R: Record>(record: R) -> Self {
        Args::Record {
            record: Arc::new(Mutex::new(record)),
            addressable: false,
        }
    }

    /// Pass a record by reference: every field and method is bound.
    pub fn pointer<R: Record>(record: R) -> Self {
        Self::shared(Arc::new(Mutex::new(record)))
    }

    /// Like [`Args::pointer`], keeping a handle so the caller can observe
    /// mutations made by pointer-receiver methods.
    pub fn shared<R: Record>(record: Arc<Mutex<R>>) -> Self {
        Args::Record {
            record,
            addressable: true,
        }
    }
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Args::None => f.write_str("Args::None"),
            Args::Map(map) => f.debug_tuple("Args::Map").field(map).finish(),
            Args::Scope(scope) => f.debug_tuple("Args::Scope").field(scope).finish(),
            Args::Record { addressable, .. } => f
                .debug_struct("Args::Record")
                .field("addressable", addressable)
                .finish_non_exhaustive(),
        }
    }
}

impl From<Scope> for Args {
    fn from(scope: Scope) -> Self {
        Args::Scope(scope)
    }
}

impl From<BTreeMap<String, Value>> for Args {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Args::Map(map)
    }
}

impl From<HashMap<String, Value>> for Args {
    fn from(map: HashMap<String, Value>) -> Self {
        Args::Map(map.into_iter().collect())
    }
}

impl From<()> for Args {
    fn from(_: ()) -> Self {
        Args::None
    }
}

/// Bind `args` into `scope`. Map and scope entries overwrite; record
/// fields and methods only fill names that are still free.
pub fn bind(args: &Args, scope: &mut Scope, cache: &TypeCache) -> Result<(), BindError> {
    match args {
        Args::None => {}
        Args::Map(map) => {
            for (name, value) in map {
                scope.set(name.as_str(), value.clone());
            }
        }
        Args::Scope(other) => scope.extend(other),
        Args::Record {
            record,
            addressable,
        } => {
            let binder = RecordBinder {
                root: record,
                addressable: *addressable,
                cache,
            };
            let guard = record.lock();
            let mut path = Vec::new();
            binder.bind_methods(&*guard, &mut path, scope);
            let mut fields = Vec::new();
            binder.flatten(&*guard, &mut fields);
            for (name, value) in fields {
                scope.set_if_absent(&name, value);
            }
        }
    }
    Ok(())
}

/// `UserName` -> `userName`.
pub fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

struct RecordBinder<'a> {
    root: &'a SharedRecord,
    addressable: bool,
    cache: &'a TypeCache,
}

impl RecordBinder<'_> {
    /// Collect `(name, value)` pairs in declaration order, each field under
    /// its own name and its lower-first alias. Duplicates are left for the
    /// caller's first-wins insert.
    fn flatten(&self, record: &dyn Record, out: &mut Vec<(String, Value)>) {
        let shape = self.cache.shape_of(record);
        for field in &shape.fields {
            if !field.exported && !self.addressable {
                continue;
            }
            let value = if field.embedded {
                let Some(inner) = record.embedded(field.name) else {
                    continue;
                };
                // Promoted fields first, then the embedded record itself.
                let mut nested = Vec::new();
                self.flatten(inner, &mut nested);
                let mut map = BTreeMap::new();
                for (name, value) in &nested {
                    map.entry(name.clone()).or_insert_with(|| value.clone());
                }
                out.extend(nested);
                Value::Map(map)
            } else {
                match record.field(field.name) {
                    Some(value) => value,
                    None => continue,
                }
            };
            let alias = lower_first(field.name);
            if alias != field.name {
                out.push((alias, value.clone()));
            }
            out.push((field.name.to_string(), value));
        }
    }

    /// Bind the record's own methods, then those promoted from embedded
    /// records, so an outer method shadows a promoted one of the same name.
    fn bind_methods(&self, record: &dyn Record, path: &mut Vec<&'static str>, scope: &mut Scope) {
        let shape = self.cache.shape_of(record);
        for method in &shape.methods {
            if method.receiver == Receiver::Pointer && !self.addressable {
                continue;
            }
            let function = method_function(Arc::clone(self.root), path.clone(), method);
            scope.set_function_if_absent(method.name, function);
        }

        for field in shape.fields.iter().filter(|f| f.embedded) {
            if !field.exported && !self.addressable {
                continue;
            }
            if let Some(inner) = record.embedded(field.name) {
                path.push(field.name);
                self.bind_methods(inner, path, scope);
                path.pop();
            }
        }
    }
}

fn descend<'r>(mut record: &'r dyn Record, path: &[&str]) -> Result<&'r dyn Record, EvalError> {
    for segment in path {
        record = record
            .embedded(segment)
            .ok_or_else(|| EvalError::Type(format!("embedded record {segment} is absent")))?;
    }
    Ok(record)
}

fn descend_mut<'r>(
    mut record: &'r mut dyn Record,
    path: &[&str],
) -> Result<&'r mut dyn Record, EvalError> {
    for segment in path {
        record = record
            .embedded_mut(segment)
            .ok_or_else(|| EvalError::Type(format!("embedded record {segment} is absent")))?;
    }
    Ok(record)
}

fn method_function(root: SharedRecord, path: Vec<&'static str>, method: &MethodDef) -> Function {
    let name = method.name;
    match (method.receiver, method.takes_query) {
        (Receiver::Value, false) => Function::new(move |args| {
            let guard = root.lock();
            descend(&*guard, &path)?.call(name, MethodCall { args, query: None })
        }),
        (Receiver::Value, true) => Function::with_query(move |args, query| {
            let guard = root.lock();
            descend(&*guard, &path)?.call(
                name,
                MethodCall {
                    args,
                    query: Some(query),
                },
            )
        }),
        (Receiver::Pointer, false) => Function::new(move |args| {
            let mut guard = root.lock();
            descend_mut(&mut *guard, &path)?.call_mut(name, MethodCall { args, query: None })
        }),
        (Receiver::Pointer, true) => Function::with_query(move |args, query| {
            let mut guard = root.lock();
            descend_mut(&mut *guard, &path)?.call_mut(
                name,
                MethodCall {
                    args,
                    query: Some(query),
                },
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{Evaluator, ExprEvaluator};
    use pretty_assertions::assert_eq;

    struct Base {
        id: i64,
        secret: String,
    }

    impl Record for Base {
        fn shape(&self) -> RecordShape {
            RecordShape {
                type_name: "Base",
                fields: vec![FieldDef::new("ID"), FieldDef::private("secret")],
                methods: vec![MethodDef::value("Describe")],
            }
        }

        fn field(&self, name: &str) -> Option<Value> {
            match name {
                "ID" => Some(self.id.into()),
                "secret" => Some(self.secret.clone().into()),
                _ => None,
            }
        }

        fn call(&self, method: &str, _call: MethodCall<'_>) -> Result<Value, EvalError> {
            match method {
                "Describe" => Ok(format!("base {}", self.id).into()),
                _ => Err(EvalError::UnknownFunction(method.into())),
            }
        }
    }

    struct User {
        base: Base,
        name: String,
        hits: i64,
    }

    impl Record for User {
        fn shape(&self) -> RecordShape {
            RecordShape {
                type_name: "User",
                fields: vec![
                    FieldDef::embedded("Base"),
                    FieldDef::new("Name"),
                    FieldDef::new("ID"),
                ],
                methods: vec![MethodDef::value("Greet"), MethodDef::pointer("Hit")],
            }
        }

        fn field(&self, name: &str) -> Option<Value> {
            match name {
                "Name" => Some(self.name.clone().into()),
                // Shadowed by the embedded Base.ID, which comes first.
                "ID" => Some(Value::Int(-1)),
                _ => None,
            }
        }

        fn embedded(&self, name: &str) -> Option<&dyn Record> {
            (name == "Base").then_some(&self.base as &dyn Record)
        }

        fn embedded_mut(&mut self, name: &str) -> Option<&mut dyn Record> {
            (name == "Base").then_some(&mut self.base as &mut dyn Record)
        }

        fn call(&self, method: &str, call: MethodCall<'_>) -> Result<Value, EvalError> {
            match method {
                "Greet" => {
                    let who = call.args.first().cloned().unwrap_or_default();
                    Ok(format!("hi {who}, I am {}", self.name).into())
                }
                _ => Err(EvalError::UnknownFunction(method.into())),
            }
        }

        fn call_mut(&mut self, method: &str, call: MethodCall<'_>) -> Result<Value, EvalError> {
            match method {
                "Hit" => {
                    self.hits += 1;
                    Ok(self.hits.into())
                }
                _ => self.call(method, call),
            }
        }
    }

    fn user() -> User {
        User {
            base: Base {
                id: 7,
                secret: "s3".into(),
            },
            name: "ann".into(),
            hits: 0,
        }
    }

    fn bound(args: Args) -> Scope {
        let mut scope = Scope::new();
        bind(&args, &mut scope, &TypeCache::new()).unwrap();
        scope
    }

    #[test]
    fn lower_first_alias() {
        assert_eq!(lower_first("UserName"), "userName");
        assert_eq!(lower_first("id"), "id");
        assert_eq!(lower_first(""), "");
    }

    #[test]
    fn serialized_structs_become_maps() {
        #[derive(Serialize)]
        struct Filter {
            id: i64,
            ids: Vec<i64>,
        }
        let scope = bound(Args::serialize(&Filter { id: 1, ids: vec![2, 3] }).unwrap());
        assert_eq!(scope.get("id"), Some(&Value::Int(1)));
        assert_eq!(scope.get("ids"), Some(&Value::from(vec![2, 3])));

        assert_eq!(Args::serialize(&5).unwrap_err(), BindError::NotAMap("int"));
    }

    #[test]
    fn embedded_fields_are_flattened_first_wins() {
        let scope = bound(Args::record(user()));
        assert_eq!(scope.get("ID"), Some(&Value::Int(7)));
        assert_eq!(scope.get("iD"), Some(&Value::Int(7)));
        assert_eq!(scope.get("name"), Some(&Value::from("ann")));
        assert_eq!(scope.get("Name"), Some(&Value::from("ann")));
        assert!(matches!(scope.get("Base"), Some(Value::Map(m)) if m.contains_key("ID")));
        // Private fields need a pointer.
        assert_eq!(scope.get("secret"), None);
    }

    #[test]
    fn methods_bind_by_receiver() {
        let scope = bound(Args::record(user()));
        let greet = ExprEvaluator.evaluate("Greet(\"bob\")", &scope).unwrap();
        assert_eq!(greet, Value::from("hi bob, I am ann"));
        assert!(scope.function("greet").is_none());
        assert_eq!(
            ExprEvaluator.evaluate("Describe()", &scope).unwrap(),
            Value::from("base 7")
        );
        assert!(scope.function("Hit").is_none());
    }

    #[test]
    fn pointer_exposes_private_fields_and_mutating_methods() {
        let handle = Arc::new(Mutex::new(user()));
        let scope = bound(Args::shared(Arc::clone(&handle)));
        assert_eq!(scope.get("secret"), Some(&Value::from("s3")));

        ExprEvaluator.execute("Hit(); Hit()", &mut scope.clone()).unwrap();
        assert_eq!(handle.lock().hits, 2);
    }

    #[test]
    fn shapes_are_cached_per_type() {
        let cache = TypeCache::new();
        let mut scope = Scope::new();
        bind(&Args::record(user()), &mut scope, &cache).unwrap();
        bind(&Args::record(user()), &mut scope, &cache).unwrap();
        assert_eq!(cache.len(), 2);
    }
}
