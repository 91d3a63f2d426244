//! Error types for every stage: lexing, parsing, loading, binding, rendering.
//!
//! Lex and parse errors carry a three-line snippet of the template source
//! centered on the failing line so callers can point at the exact spot.

use std::fmt;

use thiserror::Error;

/// Render a three-line context window around `line` (1-based).
///
/// The failing line is prefixed with `>>> `, its neighbours with four spaces.
pub fn snippet(source: &str, line: usize) -> String {
    let lines: Vec<&str> = source.split('\n').collect();
    if line == 0 || line > lines.len() {
        return String::new();
    }

    let start = line.saturating_sub(2);
    let end = (line + 1).min(lines.len());

    let mut out = String::new();
    for (idx, text) in lines[start..end].iter().enumerate() {
        if start + idx == line - 1 {
            out.push_str(">>> ");
        } else {
            out.push_str("    ");
        }
        out.push_str(text);
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexErrorKind {
    /// `@ expr` or `@= expr` with no closing `@`.
    UnterminatedExpression,
    /// `@{` code block without its matching `}`.
    UnterminatedBlock,
    /// A keyword whose argument runs to end of input without a `{`.
    MissingBrace { keyword: String },
}

impl fmt::Display for LexErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexErrorKind::UnterminatedExpression => {
                write!(f, "unclosed expression, expected '@' to close it")
            }
            LexErrorKind::UnterminatedBlock => {
                write!(f, "unclosed brace, expected '}}' to close the code block")
            }
            LexErrorKind::MissingBrace { keyword } => {
                write!(f, "expected '{{' after @{keyword} but reached end of input")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}, column {column}: {kind}\n{snippet}")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub line: usize,
    pub column: usize,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// A delimiter the grammar requires was not found.
    Expected {
        expected: &'static str,
        construct: &'static str,
    },
    /// A token that cannot start or continue a node at this position.
    Unexpected { found: String },
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorKind::Expected {
                expected,
                construct,
            } => write!(f, "expected '{expected}' {construct}"),
            ParseErrorKind::Unexpected { found } => write!(f, "unexpected {found}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}, column {column}: {kind}\n{snippet}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: usize,
    pub column: usize,
    pub snippet: String,
}

/// Failure to turn template source into a node tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl SyntaxError {
    pub fn line(&self) -> usize {
        match self {
            SyntaxError::Lex(e) => e.line,
            SyntaxError::Parse(e) => e.line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentErrorKind {
    MissingNamespace,
    MissingName,
}

/// Malformed template document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct DocumentError {
    pub line: usize,
    pub kind: DocumentErrorKind,
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DocumentErrorKind::MissingNamespace => write!(
                f,
                "line {}: SQL block found without namespace (missing # heading)",
                self.line
            ),
            DocumentErrorKind::MissingName => write!(
                f,
                "line {}: SQL block found without name (missing ## heading)",
                self.line
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("template {key}: {source}")]
    Template { key: String, source: SyntaxError },
}

/// A render path or `@use` target that does not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("invalid path: {0}, expected format: namespace.name[.define]")]
    InvalidPath(String),
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("define not found: {define} in template {template}")]
    DefineNotFound { template: String, define: String },
}

/// Failure reported by an expression evaluator or a host callable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("undefined variable: {0}")]
    Undefined(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("syntax error in `{expr}`: {message}")]
    Syntax { expr: String, message: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("call to {name} failed: {message}")]
    Call { name: String, message: String },
}

impl EvalError {
    pub fn call(name: impl Into<String>, message: impl Into<String>) -> Self {
        EvalError::Call {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("arguments must serialize to a map, got {0}")]
    NotAMap(&'static str),
    #[error("failed to serialize arguments: {0}")]
    Serialize(String),
}

/// Everything that can abort a render call. No partial query is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("line {line}: variable not found: {name}")]
    MissingVariable { name: String, line: usize },
    #[error("line {line}: error evaluating `{expr}`: {source}")]
    Eval {
        expr: String,
        line: usize,
        source: EvalError,
    },
    #[error("line {line}: cannot range over {type_name}")]
    UnsupportedRange { type_name: &'static str, line: usize },
    #[error("line {line}: invalid for expression `{header}`: {reason}")]
    InvalidLoop {
        header: String,
        line: usize,
        reason: String,
    },
    #[error(transparent)]
    Bind(#[from] BindError),
}

impl RenderError {
    /// Prefix the error with the template it happened in.
    pub fn in_template(self, key: &str) -> TemplateRenderError {
        TemplateRenderError {
            template: key.to_string(),
            source: self,
        }
    }
}

/// A [`RenderError`] tagged with the template key being rendered.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("template {template}: {source}")]
pub struct TemplateRenderError {
    pub template: String,
    pub source: RenderError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn snippet_marks_the_failing_line() {
        let src = "one\ntwo\nthree\nfour";
        assert_eq!(snippet(src, 2), "    one\n>>> two\n    three\n");
    }

    #[test]
    fn snippet_clamps_at_edges() {
        let src = "one\ntwo";
        assert_eq!(snippet(src, 1), ">>> one\n    two\n");
        assert_eq!(snippet(src, 2), "    one\n>>> two\n");
        assert_eq!(snippet(src, 9), "");
    }

    #[test]
    fn load_error_names_the_template() {
        let err = LoadError::Template {
            key: "user.find".into(),
            source: SyntaxError::Lex(LexError {
                kind: LexErrorKind::UnterminatedExpression,
                line: 3,
                column: 7,
                snippet: String::new(),
            }),
        };
        assert!(err.to_string().starts_with("template user.find: line 3, column 7"));
    }

    #[test]
    fn syntax_error_line_from_either_stage() {
        let lex = crate::parser::parse_template("select 1\nwhere a = @ b").unwrap_err();
        assert!(matches!(lex, SyntaxError::Lex(_)));
        assert_eq!(lex.line(), 2);

        let parse = crate::parser::parse_template("a\nb\nc }").unwrap_err();
        assert!(matches!(parse, SyntaxError::Parse(_)));
        assert_eq!(parse.line(), 3);
    }
}
