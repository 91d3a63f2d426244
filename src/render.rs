//! Tree-walking renderer: executes a template's nodes against a scope and
//! accumulates SQL text plus positional params.
//!
//! All state lives in a per-call [`Renderer`]; templates in the registry
//! are only borrowed, so concurrent renders on one engine never interact.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::ast::{DefineNode, ForKind, Node, UseNode};
use crate::error::{EvalError, RenderError, ResolutionError, TemplateRenderError};
use crate::eval::{Evaluator, Scope, Value};
use crate::registry::{find_define, Registry, TemplatePath};
use crate::{PlaceholderStyle, Query};

/// Output buffer with line-level rollback for conditional placeholders.
#[derive(Debug)]
struct Sink {
    text: String,
    params: Vec<Value>,
    // Param count when the current line started.
    line_mark: usize,
    // Dropping output until the end of the current line.
    skipping: bool,
    style: PlaceholderStyle,
    // Params emitted before this sink, for numbered placeholders.
    offset: usize,
}

impl Sink {
    fn new(style: PlaceholderStyle, offset: usize) -> Self {
        Self {
            text: String::new(),
            params: Vec::new(),
            line_mark: 0,
            skipping: false,
            style,
            offset,
        }
    }

    fn write(&mut self, text: &str) {
        self.text.push_str(text);
        if text.contains('\n') {
            self.line_mark = self.params.len();
        }
    }

    fn push_text(&mut self, text: &str) {
        let mut text = text;
        if self.skipping {
            match text.find('\n') {
                Some(idx) => {
                    text = &text[idx + 1..];
                    self.skipping = false;
                    self.line_mark = self.params.len();
                }
                None => return,
            }
        }
        self.write(text);
    }

    fn push_raw(&mut self, text: &str) {
        if !self.skipping {
            self.write(text);
        }
    }

    fn push_marker(&mut self, value: Value) {
        let position = self.offset + self.params.len() + 1;
        self.style.write_marker(&mut self.text, position);
        self.params.push(value);
    }

    /// A list expands to one placeholder per element.
    fn push_value(&mut self, value: Value) {
        if self.skipping {
            return;
        }
        match value {
            Value::List(items) => {
                for (idx, item) in items.into_iter().enumerate() {
                    if idx > 0 {
                        self.text.push_str(", ");
                    }
                    self.push_marker(item);
                }
            }
            value => self.push_marker(value),
        }
    }

    /// Remove the current line's text and params.
    fn truncate_line(&mut self) {
        let cut = self.text.rfind('\n').map_or(0, |idx| idx + 1);
        self.text.truncate(cut);
        self.params.truncate(self.line_mark);
    }

    /// Remove the current line and drop output through its newline.
    fn skip_line(&mut self) {
        self.truncate_line();
        self.skipping = true;
    }

    fn next_position(&self) -> usize {
        self.offset + self.params.len()
    }

    /// Append a function block's result. On an elided line the whole block
    /// belongs to that line and is dropped.
    fn append_query(&mut self, query: Query) {
        if self.skipping {
            return;
        }
        self.text.push_str(&query.sql);
        self.params.extend(query.params);
        if query.sql.contains('\n') {
            self.line_mark = self.params.len();
        }
    }

    fn finish(self) -> Query {
        Query {
            sql: self.text,
            params: self.params,
        }
    }
}

/// Overrides supplied by one `@use`, plus where they were written so cover
/// bodies run in the scope of the use site.
struct CoverScope<'e> {
    overrides: HashMap<&'e str, &'e [Node]>,
    define_path: Vec<&'e str>,
    template: &'e str,
}

pub(crate) struct Renderer<'e> {
    registry: &'e Registry,
    evaluator: &'e dyn Evaluator,
    scope: Scope,
    sink: Sink,
    covers: Vec<CoverScope<'e>>,
    // Names of the defines enclosing the current node, outermost first.
    define_path: Vec<&'e str>,
    // Template whose nodes are executing. Not restored on error, so the
    // failing template is still named when the error reaches the top.
    template: &'e str,
}

/// Render `path` (`namespace.name[.define...]`) against `scope`.
pub(crate) fn render_path<'e>(
    registry: &'e Registry,
    evaluator: &'e dyn Evaluator,
    style: PlaceholderStyle,
    scope: Scope,
    path: &'e str,
) -> Result<Query, TemplateRenderError> {
    let resolve = |e: ResolutionError| RenderError::from(e).in_template(path);
    let target = TemplatePath::parse(path).map_err(resolve)?;
    let template = registry.lookup(&target.key()).map_err(resolve)?;
    let nodes = match target.define {
        Some(define) => {
            &find_define(&template.root, define)
                .ok_or_else(|| {
                    resolve(ResolutionError::DefineNotFound {
                        template: template.key().to_string(),
                        define: define.to_string(),
                    })
                })?
                .body
        }
        None => &template.root,
    };

    trace!(template = template.key(), path, "rendering");
    let mut renderer = Renderer {
        registry,
        evaluator,
        scope,
        sink: Sink::new(style, 0),
        covers: Vec::new(),
        define_path: target.define_segments(),
        template: template.key(),
    };
    if let Err(err) = renderer.execute(nodes) {
        return Err(err.in_template(renderer.template));
    }

    let query = renderer.sink.finish();
    trace!(template = template.key(), params = query.params.len(), "rendered");
    Ok(query)
}

impl<'e> Renderer<'e> {
    fn execute(&mut self, nodes: &'e [Node]) -> Result<(), RenderError> {
        for node in nodes {
            self.execute_node(node)?;
        }
        Ok(())
    }

    fn execute_node(&mut self, node: &'e Node) -> Result<(), RenderError> {
        match node {
            Node::Text(text) => self.sink.push_text(text),
            Node::Var {
                name,
                conditional,
                line,
            } => {
                if self.sink.skipping {
                    return Ok(());
                }
                let value = self.scope.get(name).cloned();
                self.emit(value, *conditional, false, name, *line)?;
            }
            Node::Raw {
                name,
                conditional,
                line,
            } => {
                if self.sink.skipping {
                    return Ok(());
                }
                let value = self.scope.get(name).cloned();
                self.emit(value, *conditional, true, name, *line)?;
            }
            Node::VarExpr {
                expr,
                conditional,
                line,
            } => {
                if self.sink.skipping {
                    return Ok(());
                }
                let value = self.evaluate_placeholder(expr, *conditional, *line)?;
                self.emit(value, *conditional, false, expr, *line)?;
            }
            Node::RawExpr {
                expr,
                conditional,
                line,
            } => {
                if self.sink.skipping {
                    return Ok(());
                }
                let value = self.evaluate_placeholder(expr, *conditional, *line)?;
                self.emit(value, *conditional, true, expr, *line)?;
            }
            Node::ConditionalLine {
                condition,
                nodes,
                line,
            } => {
                // Only text survives a skip, and the guard's text carries the
                // newline that ends it.
                if self.sink.skipping {
                    return self.execute(nodes);
                }
                let keep = match self.evaluator.evaluate(condition, &self.scope) {
                    Ok(value) => self.evaluator.truthy(&value),
                    Err(EvalError::Undefined(_)) => false,
                    Err(source) => return Err(eval_error(condition, *line, source)),
                };
                if keep {
                    self.execute(nodes)?;
                } else {
                    debug!(line, condition = condition.as_str(), "line guard false, dropping line");
                    self.sink.truncate_line();
                }
            }
            Node::If { cases, else_body } => {
                for case in cases {
                    if self.condition(&case.condition, case.line)? {
                        return self.execute(&case.body);
                    }
                }
                if let Some(body) = else_body {
                    self.execute(body)?;
                }
            }
            Node::For {
                kind: ForKind::Counted,
                header,
                body,
                line,
            } => self.counted_loop(header, body, *line)?,
            Node::For {
                kind: ForKind::Range,
                header,
                body,
                line,
            } => self.range_loop(header, body, *line)?,
            Node::Code { code, line } => self
                .evaluator
                .execute(code, &mut self.scope)
                .map_err(|source| eval_error(code, *line, source))?,
            Node::Use(use_node) => self.use_template(use_node)?,
            Node::Define(define) => self.define(define)?,
            Node::Cover(cover) => {
                trace!(cover = cover.name.as_str(), "cover outside use ignored");
            }
            Node::FuncBlock { callee, body, line } => self.func_block(callee, body, *line)?,
        }
        Ok(())
    }

    fn evaluate_placeholder(
        &self,
        expr: &str,
        conditional: bool,
        line: usize,
    ) -> Result<Option<Value>, RenderError> {
        match self.evaluator.evaluate(expr, &self.scope) {
            Ok(value) => Ok(Some(value)),
            Err(EvalError::Undefined(_)) if conditional => Ok(None),
            Err(source) => Err(eval_error(expr, line, source)),
        }
    }

    /// Output a placeholder value, or roll back the line when a
    /// conditional placeholder is missing or falsy.
    fn emit(
        &mut self,
        value: Option<Value>,
        conditional: bool,
        raw: bool,
        name: &str,
        line: usize,
    ) -> Result<(), RenderError> {
        let value = match value {
            Some(value) if !conditional || self.evaluator.truthy(&value) => value,
            _ if conditional => {
                debug!(line, placeholder = name, "conditional placeholder empty, dropping line");
                self.sink.skip_line();
                return Ok(());
            }
            _ => {
                return Err(RenderError::MissingVariable {
                    name: name.to_string(),
                    line,
                })
            }
        };

        if raw {
            self.sink.push_raw(&value.to_string());
        } else {
            self.sink.push_value(value);
        }
        Ok(())
    }

    fn condition(&self, expr: &str, line: usize) -> Result<bool, RenderError> {
        let value = self
            .evaluator
            .evaluate(expr, &self.scope)
            .map_err(|source| eval_error(expr, line, source))?;
        Ok(self.evaluator.truthy(&value))
    }

    fn counted_loop(&mut self, header: &str, body: &'e [Node], line: usize) -> Result<(), RenderError> {
        let invalid = |reason: &str| RenderError::InvalidLoop {
            header: header.to_string(),
            line,
            reason: reason.to_string(),
        };

        let clauses: Vec<&str> = header.split(';').map(str::trim).collect();
        let [init, cond, post] = clauses[..] else {
            return Err(invalid("expected `init; condition; post`"));
        };
        let (var, start) = split_assignment(init).ok_or_else(|| invalid("expected `name := value` initializer"))?;
        let step = PostStep::parse(post).ok_or_else(|| invalid("expected `name++`, `name--`, `name += n` or `name -= n`"))?;

        let start = self
            .evaluator
            .evaluate(start, &self.scope)
            .map_err(|source| eval_error(start, line, source))?;
        let saved = self.scope.set(var, start);

        let result = (|| -> Result<(), RenderError> {
            while self.condition(cond, line)? {
                self.execute(body)?;
                self.apply_step(&step, line).map_err(|reason| invalid(&reason))?;
            }
            Ok(())
        })();

        self.restore(var, saved);
        result
    }

    fn apply_step(&mut self, step: &PostStep<'_>, line: usize) -> Result<(), String> {
        let delta = match step.delta {
            Delta::One => 1,
            Delta::Expr(expr) => match self.evaluator.evaluate(expr, &self.scope) {
                Ok(Value::Int(n)) => n,
                Ok(other) => return Err(format!("step must be an integer, got {}", other.type_name())),
                Err(err) => return Err(format!("line {line}: {err}")),
            },
        };
        let current = match self.scope.get(step.var) {
            Some(Value::Int(n)) => *n,
            Some(other) => return Err(format!("{} is {}, not an integer", step.var, other.type_name())),
            None => return Err(format!("{} is not defined", step.var)),
        };
        let next = if step.negative {
            current.checked_sub(delta)
        } else {
            current.checked_add(delta)
        }
        .ok_or_else(|| "integer overflow".to_string())?;
        self.scope.set(step.var, next);
        Ok(())
    }

    fn range_loop(&mut self, header: &str, body: &'e [Node], line: usize) -> Result<(), RenderError> {
        let invalid = |reason: &str| RenderError::InvalidLoop {
            header: header.to_string(),
            line,
            reason: reason.to_string(),
        };

        let (names, source) = split_assignment_raw(header)
            .ok_or_else(|| invalid("expected `key, value := range collection`"))?;
        let source = source
            .strip_prefix("range")
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .ok_or_else(|| invalid("expected `range` after `:=`"))?
            .trim();
        let names: Vec<&str> = names.split(',').map(str::trim).collect();
        let (key_var, value_var) = match names[..] {
            [key] if is_ident(key) => (Some(key), None),
            [key, value] if is_ident(key) && is_ident(value) => (Some(key), Some(value)),
            _ => return Err(invalid("expected one or two loop variables")),
        };
        let key_var = key_var.filter(|k| *k != "_");
        let value_var = value_var.filter(|v| *v != "_");

        let collection = self
            .evaluator
            .evaluate(source, &self.scope)
            .map_err(|source_err| eval_error(source, line, source_err))?;
        let items: Vec<(Value, Value)> = match collection {
            Value::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| (Value::from(idx), item))
                .collect(),
            Value::Map(map) => map.into_iter().map(|(k, v)| (Value::String(k), v)).collect(),
            other => {
                return Err(RenderError::UnsupportedRange {
                    type_name: other.type_name(),
                    line,
                })
            }
        };

        let saved_key = key_var.map(|k| (k, self.scope.get(k).cloned()));
        let saved_value = value_var.map(|v| (v, self.scope.get(v).cloned()));

        let result = (|| -> Result<(), RenderError> {
            for (key, value) in items {
                if let Some(k) = key_var {
                    self.scope.set(k, key);
                }
                if let Some(v) = value_var {
                    self.scope.set(v, value);
                }
                self.execute(body)?;
            }
            Ok(())
        })();

        for (name, saved) in saved_key.into_iter().chain(saved_value) {
            self.restore(name, saved);
        }
        result
    }

    fn restore(&mut self, name: &str, saved: Option<Value>) {
        match saved {
            Some(value) => {
                self.scope.set(name, value);
            }
            None => {
                self.scope.remove(name);
            }
        }
    }

    fn use_template(&mut self, node: &'e UseNode) -> Result<(), RenderError> {
        let target = TemplatePath::parse(&node.path)?;
        let template = match self.registry.lookup(&target.key()) {
            Ok(template) => template,
            Err(_) if node.optional => {
                debug!(path = node.path.as_str(), "optional use target missing");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let nodes = match target.define {
            None => &template.root,
            Some(define) => match find_define(&template.root, define) {
                Some(found) => &found.body,
                None if node.optional => {
                    debug!(path = node.path.as_str(), "optional use target missing");
                    return Ok(());
                }
                None => {
                    return Err(ResolutionError::DefineNotFound {
                        template: template.key().to_string(),
                        define: define.to_string(),
                    }
                    .into())
                }
            },
        };

        let overrides = node
            .covers
            .iter()
            .map(|cover| (cover.name.as_str(), cover.body.as_slice()))
            .collect();
        let outer_path = std::mem::replace(&mut self.define_path, target.define_segments());
        let outer_template = std::mem::replace(&mut self.template, template.key());
        self.covers.push(CoverScope {
            overrides,
            define_path: outer_path,
            template: outer_template,
        });

        self.execute(nodes)?;

        if let Some(scope) = self.covers.pop() {
            self.define_path = scope.define_path;
            self.template = scope.template;
        }
        Ok(())
    }

    /// The innermost active cover for the current define path, trying the
    /// longest dotted suffix first (`outer.inner` before `inner`).
    fn find_override(&self) -> Option<&'e [Node]> {
        let scope = self.covers.last()?;
        (0..self.define_path.len()).find_map(|start| {
            let key = self.define_path[start..].join(".");
            scope.overrides.get(key.as_str()).copied()
        })
    }

    fn define(&mut self, define: &'e DefineNode) -> Result<(), RenderError> {
        self.define_path.push(&define.name);

        match self.find_override() {
            None => self.execute(&define.body)?,
            Some(body) => {
                trace!(define = define.name.as_str(), "define covered");
                // Cover bodies run where they were written: under the
                // enclosing use's covers, path and template.
                let Some(scope) = self.covers.pop() else {
                    return Ok(());
                };
                let inner_path = std::mem::replace(&mut self.define_path, scope.define_path.clone());
                let inner_template = std::mem::replace(&mut self.template, scope.template);
                self.execute(body)?;
                self.define_path = inner_path;
                self.template = inner_template;
                self.covers.push(scope);
            }
        }

        self.define_path.pop();
        Ok(())
    }

    fn func_block(&mut self, callee: &str, body: &'e [Node], line: usize) -> Result<(), RenderError> {
        if self.sink.skipping {
            return Ok(());
        }
        let inner = Sink::new(self.sink.style, self.sink.next_position());
        let outer = std::mem::replace(&mut self.sink, inner);
        let result = self.execute(body);
        let inner = std::mem::replace(&mut self.sink, outer);
        result?;
        let rendered = inner.finish();

        let (name, args) = match self.evaluator.resolve_call(callee, &self.scope) {
            Ok(call) => call,
            Err(err) => {
                warn!(line, callee, error = %err, "function block call failed, keeping body");
                self.sink.append_query(rendered);
                return Ok(());
            }
        };
        let Some(function) = self.scope.function(&name).cloned() else {
            warn!(line, callee, "function block target is not a registered callable, keeping body");
            self.sink.append_query(rendered);
            return Ok(());
        };

        match function.call_block(&name, &args, rendered.clone()) {
            Ok(query) => self.sink.append_query(query),
            Err(err) => {
                warn!(line, callee, error = %err, "function block call failed, keeping body");
                self.sink.append_query(rendered);
            }
        }
        Ok(())
    }
}

fn eval_error(expr: &str, line: usize, source: EvalError) -> RenderError {
    RenderError::Eval {
        expr: expr.to_string(),
        line,
        source,
    }
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// `lhs := rhs` or `lhs = rhs`, both sides trimmed.
fn split_assignment_raw(s: &str) -> Option<(&str, &str)> {
    let (lhs, rhs) = s.split_once(":=").or_else(|| s.split_once('='))?;
    Some((lhs.trim(), rhs.trim()))
}

fn split_assignment(s: &str) -> Option<(&str, &str)> {
    let (var, value) = split_assignment_raw(s)?;
    (is_ident(var) && !value.is_empty()).then_some((var, value))
}

enum Delta<'a> {
    One,
    Expr(&'a str),
}

struct PostStep<'a> {
    var: &'a str,
    negative: bool,
    delta: Delta<'a>,
}

impl<'a> PostStep<'a> {
    fn parse(post: &'a str) -> Option<Self> {
        let (var, negative, delta) = if let Some(var) = post.strip_suffix("++") {
            (var, false, Delta::One)
        } else if let Some(var) = post.strip_suffix("--") {
            (var, true, Delta::One)
        } else if let Some((var, expr)) = post.split_once("+=") {
            (var, false, Delta::Expr(expr.trim()))
        } else if let Some((var, expr)) = post.split_once("-=") {
            (var, true, Delta::Expr(expr.trim()))
        } else {
            return None;
        };
        let var = var.trim();
        is_ident(var).then_some(Self {
            var,
            negative,
            delta,
        })
    }
}
