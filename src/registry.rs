use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{DefineNode, Node, Template};
use crate::error::ResolutionError;

/// A parsed template, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    pub namespace: String,
    pub name: String,
    pub description: String,
    pub root: Template,
    key: String,
}

impl CompiledTemplate {
    pub fn new(namespace: &str, name: &str, description: &str, root: Template) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            root,
            key: format!("{namespace}.{name}"),
        }
    }

    /// `namespace.name`
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A render or `@use` path: `namespace.name[.define[.nested...]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplatePath<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub define: Option<&'a str>,
}

impl<'a> TemplatePath<'a> {
    pub fn parse(path: &'a str) -> Result<Self, ResolutionError> {
        let invalid = || ResolutionError::InvalidPath(path.to_string());
        if path.split('.').any(str::is_empty) {
            return Err(invalid());
        }

        let mut parts = path.splitn(3, '.');
        let namespace = parts.next().ok_or_else(invalid)?;
        let name = parts.next().ok_or_else(invalid)?;
        Ok(Self {
            namespace,
            name,
            define: parts.next(),
        })
    }

    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Segments of the define part, outermost first.
    pub fn define_segments(&self) -> Vec<&'a str> {
        self.define.map(|d| d.split('.').collect()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    templates: HashMap<String, Arc<CompiledTemplate>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template. A later registration under the same key wins.
    pub fn register(&mut self, template: CompiledTemplate) -> Option<Arc<CompiledTemplate>> {
        self.templates
            .insert(template.key().to_string(), Arc::new(template))
    }

    pub fn get(&self, key: &str) -> Option<&CompiledTemplate> {
        self.templates.get(key).map(Arc::as_ref)
    }

    pub fn lookup(&self, key: &str) -> Result<&CompiledTemplate, ResolutionError> {
        self.get(key)
            .ok_or_else(|| ResolutionError::TemplateNotFound(key.to_string()))
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Find a define by dotted path. Each segment is searched depth-first
/// through defines, conditionals, loops and function blocks, and the
/// next segment is searched inside the match.
pub fn find_define<'t>(nodes: &'t [Node], path: &str) -> Option<&'t DefineNode> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut found = search(nodes, first)?;
    for segment in segments {
        found = search(&found.body, segment)?;
    }
    Some(found)
}

fn search<'t>(nodes: &'t [Node], name: &str) -> Option<&'t DefineNode> {
    for node in nodes {
        let found = match node {
            Node::Define(define) if define.name == name => return Some(define),
            Node::Define(define) => search(&define.body, name),
            Node::If { cases, else_body } => cases
                .iter()
                .find_map(|case| search(&case.body, name))
                .or_else(|| else_body.as_deref().and_then(|body| search(body, name))),
            Node::For { body, .. } | Node::FuncBlock { body, .. } => search(body, name),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    None
}
