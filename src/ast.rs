//! Template node tree. Expressions and loop headers stay as source strings;
//! the pluggable evaluator interprets them at render time.

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    /// `@name` / `@name?`
    Var {
        name: String,
        conditional: bool,
        line: usize,
    },
    /// `@ expr @` / `@ expr @?`
    VarExpr {
        expr: String,
        conditional: bool,
        line: usize,
    },
    /// `@=name` / `@=name@` / `@=name?`
    Raw {
        name: String,
        conditional: bool,
        line: usize,
    },
    /// `@= expr @`
    RawExpr {
        expr: String,
        conditional: bool,
        line: usize,
    },
    /// `@? cond @` guarding the rest of its line.
    ConditionalLine {
        condition: String,
        nodes: Vec<Node>,
        line: usize,
    },
    If {
        cases: Vec<Branch>, // if and every else-if, in order
        else_body: Option<Vec<Node>>,
    },
    For {
        kind: ForKind,
        header: String,
        body: Vec<Node>,
        line: usize,
    },
    /// `@{ code }`
    Code { code: String, line: usize },
    Use(UseNode),
    Define(DefineNode),
    /// Outside a `@use` body a cover is inert.
    Cover(CoverNode),
    /// `@ callee(args) { body }`
    FuncBlock {
        callee: String,
        body: Vec<Node>,
        line: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: String,
    pub body: Vec<Node>,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForKind {
    /// `init; cond; post`
    Counted,
    /// `k, v := range coll` / `k := range coll` (index or key only)
    Range,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UseNode {
    pub path: String,
    /// `@use?` renders nothing when the target is missing.
    pub optional: bool,
    pub covers: Vec<CoverNode>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefineNode {
    pub name: String,
    pub body: Vec<Node>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverNode {
    /// Define name, possibly dotted (`outer.inner`).
    pub name: String,
    pub body: Vec<Node>,
    pub line: usize,
}

pub type Template = Vec<Node>;
