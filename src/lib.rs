//! mdsql: SQL templates kept in markdown, rendered to parameterized SQL.
//!
//! Templates live in fenced ```` ```sql ```` blocks under `# namespace` and
//! `## name` headings. Inside them a small `@` directive language picks
//! values, branches, loops and composes fragments; rendering produces SQL
//! text with placeholders and the ordered parameter list to bind.
//!
//! ~~~text
//! # user
//!
//! ## find
//! ```sql
//! select * from user
//! where 1 = 1
//!   and id in (@ids)
//!   and name = @name?
//! @if limit > 0 {
//! limit @=limit
//! }
//! ```
//! ~~~
//!
//! Directives:
//! - `@name`, `@ expr @`: one placeholder per value, one per element for lists.
//! - `@=name`, `@= expr @`: raw text, not parameterized. The caller is
//!   responsible for its safety.
//! - A trailing `?` makes a placeholder conditional: when the value is
//!   missing or falsy the whole output line is dropped, params included.
//! - `@? expr @` keeps its line only when `expr` is truthy.
//! - `@if cond { } else if cond { } else { }`
//! - `@for i := 0; i < n; i++ { }` and `@for k, v := range xs { }`
//! - `@{ code }` runs statements against the scope and outputs nothing.
//! - `@define name { }` marks an overridable fragment; `@use ns.name { @cover
//!   name { } }` renders another template with fragments replaced. Covers
//!   may target nested defines with dotted names (`outer.inner`).
//! - `@ f(args) { body }` hands the rendered body to a host callable.
//! - `@@` is a literal `@`.
//!
//! Expressions go through an [`Evaluator`]; [`ExprEvaluator`] is the
//! built-in Go-flavoured one. Arguments are bound from serde values, maps,
//! [`Scope`]s or host [`Record`]s (see [`bind`]).
//!
//! Logging goes through `tracing`; install a subscriber to see it.

pub mod ast;
pub mod bind;
pub mod document;
pub mod error;
pub mod eval;
pub mod expr;
pub mod lexer;
pub mod parser;
pub mod registry;
mod render;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use bind::{Args, FieldDef, MethodCall, MethodDef, Receiver, Record, RecordShape, TypeCache};
pub use error::{
    BindError, DocumentError, EvalError, LexError, LoadError, ParseError, RenderError,
    ResolutionError, SyntaxError, TemplateRenderError,
};
pub use eval::{Evaluator, ExprEvaluator, Function, Scope, Value};
pub use registry::{CompiledTemplate, Registry};

/// A rendered query: SQL text and its positional params.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Query {
    pub sql: String,
    pub params: Vec<Value>,
}

/// How parameter markers are written into the SQL text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderStyle {
    /// `?` (MySQL, SQLite)
    #[default]
    Question,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
    /// `:1`, `:2`, ... (Oracle)
    Colon,
}

impl PlaceholderStyle {
    /// Write the marker for the 1-based parameter `position`.
    pub fn write_marker(self, out: &mut String, position: usize) {
        match self {
            PlaceholderStyle::Question => out.push('?'),
            PlaceholderStyle::Dollar => {
                out.push('$');
                out.push_str(&position.to_string());
            }
            PlaceholderStyle::Colon => {
                out.push(':');
                out.push_str(&position.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub placeholder: PlaceholderStyle,
    /// Trim whitespace around each template's SQL before compiling.
    pub trim_templates: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            placeholder: PlaceholderStyle::Question,
            trim_templates: true,
        }
    }
}

/// Holds compiled templates and host callables; renders by path.
///
/// An `Engine` is immutable while rendering, so `render` can be called from
/// many threads at once through a shared reference.
pub struct Engine {
    config: Config,
    registry: Registry,
    functions: HashMap<String, Function>,
    evaluator: Arc<dyn Evaluator>,
    types: Arc<TypeCache>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            registry: Registry::new(),
            functions: HashMap::new(),
            evaluator: Arc::new(ExprEvaluator),
            types: Arc::new(TypeCache::new()),
        }
    }

    /// Replace the expression evaluator.
    pub fn with_evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    /// Share a record shape cache with other engines.
    pub fn with_type_cache(mut self, types: Arc<TypeCache>) -> Self {
        self.types = types;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Extract, compile and register every template in a markdown document.
    ///
    /// Nothing is registered unless every template compiles; the error names
    /// the first template that failed.
    pub fn load(&mut self, document: &str) -> Result<(), LoadError> {
        let sources = document::extract(document)?;
        let compiled = sources
            .iter()
            .map(|source| {
                self.compile(&source.namespace, &source.name, &source.description, &source.content)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(templates = compiled.len(), "loaded document");
        for template in compiled {
            self.register(template);
        }
        Ok(())
    }

    /// Compile and register one template from its SQL source.
    pub fn add_template(&mut self, namespace: &str, name: &str, source: &str) -> Result<(), LoadError> {
        let template = self.compile(namespace, name, "", source)?;
        self.register(template);
        Ok(())
    }

    fn compile(
        &self,
        namespace: &str,
        name: &str,
        description: &str,
        source: &str,
    ) -> Result<CompiledTemplate, LoadError> {
        let source = if self.config.trim_templates {
            source.trim()
        } else {
            source
        };
        let root = parser::parse_template(source).map_err(|source| LoadError::Template {
            key: format!("{namespace}.{name}"),
            source,
        })?;
        Ok(CompiledTemplate::new(namespace, name, description, root))
    }

    fn register(&mut self, template: CompiledTemplate) {
        let key = template.key().to_string();
        if self.registry.register(template).is_some() {
            debug!(template = key.as_str(), "replaced template");
        } else {
            debug!(template = key.as_str(), "registered template");
        }
    }

    /// Make a host callable visible to every render. Map and scope
    /// arguments can shadow it; record methods cannot.
    pub fn register_callable(&mut self, name: impl Into<String>, function: Function) {
        self.functions.insert(name.into(), function);
    }

    /// Render `namespace.name` or `namespace.name.define[.nested]`.
    pub fn render(&self, path: &str, args: impl Into<Args>) -> Result<Query, TemplateRenderError> {
        let mut scope = Scope::new();
        for (name, function) in &self.functions {
            scope.set_function(name.as_str(), function.clone());
        }
        bind::bind(&args.into(), &mut scope, &self.types)
            .map_err(|err| RenderError::from(err).in_template(path))?;

        render::render_path(
            &self.registry,
            self.evaluator.as_ref(),
            self.config.placeholder,
            scope,
            path,
        )
    }

    /// Registered template keys, sorted.
    pub fn templates(&self) -> Vec<&str> {
        self.registry.keys()
    }

    pub fn template(&self, key: &str) -> Option<&CompiledTemplate> {
        self.registry.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = "\
# user

## find
Find users.

```sql
select * from user
where id = @id and id in (@ids)
```
";

    #[test]
    fn load_and_render() {
        let mut engine = Engine::new();
        engine.load(DOC).unwrap();
        assert_eq!(engine.templates(), vec!["user.find"]);
        assert_eq!(engine.template("user.find").unwrap().description, "Find users.");

        let q = engine
            .render("user.find", Scope::new().with("id", 1).with("ids", vec![1, 2, 3]))
            .unwrap();
        assert_eq!(q.sql, "select * from user\nwhere id = ? and id in (?, ?, ?)");
        assert_eq!(q.params, vec![Value::Int(1), Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn placeholder_styles() {
        let mut out = String::new();
        PlaceholderStyle::Question.write_marker(&mut out, 1);
        PlaceholderStyle::Dollar.write_marker(&mut out, 2);
        PlaceholderStyle::Colon.write_marker(&mut out, 3);
        assert_eq!(out, "?$2:3");

        PlaceholderStyle::Dollar.write_marker(&mut out, 12);
        assert_eq!(out, "?$2:3$12");
    }

    #[test]
    fn engine_keeps_its_config() {
        let config = Config {
            placeholder: PlaceholderStyle::Colon,
            trim_templates: false,
        };
        let mut engine = Engine::with_config(config.clone());
        assert_eq!(engine.config(), &config);
        assert_eq!(Engine::new().config(), &Config::default());

        engine.add_template("t", "q", "\nselect @a\n").unwrap();
        let q = engine.render("t.q", Scope::new().with("a", 1)).unwrap();
        assert_eq!(q.sql, "\nselect :1\n");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"placeholder": "dollar"}"#).unwrap();
        assert_eq!(
            config,
            Config {
                placeholder: PlaceholderStyle::Dollar,
                trim_templates: true,
            }
        );
    }

    #[test]
    fn failed_load_registers_nothing() {
        let mut engine = Engine::new();
        let doc = "# a\n## ok\n```sql\nselect 1\n```\n## bad\n```sql\nselect @ x\n```\n";
        let err = engine.load(doc).unwrap_err();
        assert!(matches!(err, LoadError::Template { ref key, .. } if key == "a.bad"));
        assert!(engine.templates().is_empty());
    }

    #[test]
    fn query_serializes() {
        let q = Query {
            sql: "select ?".into(),
            params: vec![Value::Int(1), Value::from("a")],
        };
        assert_eq!(
            serde_json::to_string(&q).unwrap(),
            r#"{"sql":"select ?","params":[1,"a"]}"#
        );
    }
}
