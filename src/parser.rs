use crate::ast::*;
use crate::error::{snippet, ParseError, ParseErrorKind, SyntaxError};
use crate::lexer::{tokenize, Token, TokenKind};
use std::collections::VecDeque;

/// Tokenize and parse template source into its node tree.
pub fn parse_template(source: &str) -> Result<Template, SyntaxError> {
    let mut parser = Parser::new(source)?;
    Ok(parser.parse()?)
}

pub struct Parser<'a> {
    source: &'a str,
    buffer: VecDeque<Token>,
    // Position just past the last consumed token, for errors at end of input.
    last: (usize, usize),
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Result<Self, crate::error::LexError> {
        Ok(Self {
            source,
            buffer: tokenize(source)?.into(),
            last: (1, 1),
        })
    }

    fn peek(&self, n: usize) -> Option<&Token> {
        self.buffer.get(n)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek(0).map(|t| t.kind)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.buffer.pop_front()?;
        self.last = (token.line, token.column + token.text.chars().count());
        Some(token)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        match self.consume() {
            Some(token) => Ok(token),
            None => Err(self.error(ParseErrorKind::Unexpected {
                found: "end of input".into(),
            })),
        }
    }

    fn error(&self, kind: ParseErrorKind) -> ParseError {
        let (line, column) = match self.peek(0) {
            Some(t) => (t.line, t.column),
            None => self.last,
        };
        ParseError {
            kind,
            line,
            column,
            snippet: snippet(self.source, line),
        }
    }

    fn expect(
        &mut self,
        kind: TokenKind,
        expected: &'static str,
        construct: &'static str,
    ) -> Result<Token, ParseError> {
        match self.peek_kind() {
            Some(k) if k == kind => self.next(),
            _ => Err(self.error(ParseErrorKind::Expected {
                expected,
                construct,
            })),
        }
    }

    pub fn parse(&mut self) -> Result<Template, ParseError> {
        let nodes = self.parse_nodes()?;
        if let Some(token) = self.peek(0) {
            let found = token.kind.describe().to_string();
            return Err(self.error(ParseErrorKind::Unexpected { found }));
        }
        Ok(nodes)
    }

    /// Parse a node sequence up to a block terminator (`}`, else, else-if)
    /// or end of input. The terminator is left for the caller.
    fn parse_nodes(&mut self) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();
        loop {
            match self.peek_kind() {
                None | Some(TokenKind::RBrace | TokenKind::Else | TokenKind::ElseIf) => break,
                Some(_) => {
                    let node = self.parse_node()?;
                    push_node(&mut nodes, node);
                }
            }
        }
        Ok(nodes)
    }

    fn parse_node(&mut self) -> Result<Node, ParseError> {
        let kind = match self.peek_kind() {
            Some(kind) => kind,
            None => {
                return Err(self.error(ParseErrorKind::Unexpected {
                    found: "end of input".into(),
                }))
            }
        };

        match kind {
            TokenKind::Text
            | TokenKind::Var
            | TokenKind::VarExpr
            | TokenKind::Raw
            | TokenKind::RawExpr => {
                let token = self.next()?;
                Ok(simple_node(token))
            }
            TokenKind::Code => {
                let token = self.next()?;
                Ok(Node::Code {
                    code: token.text,
                    line: token.line,
                })
            }
            TokenKind::LineGuard => self.parse_line_guard(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Use => self.parse_use(),
            TokenKind::Define => self.parse_define(),
            TokenKind::Cover => Ok(Node::Cover(self.parse_cover()?)),
            TokenKind::FuncBlock => self.parse_func_block(),
            TokenKind::LBrace | TokenKind::RBrace | TokenKind::Else | TokenKind::ElseIf => {
                Err(self.error(ParseErrorKind::Unexpected {
                    found: kind.describe().into(),
                }))
            }
        }
    }

    /// `@? cond @` takes every simple node up to and including the next
    /// newline. Text after that newline stays in the stream.
    fn parse_line_guard(&mut self) -> Result<Node, ParseError> {
        let guard = self.next()?;
        let mut nodes = Vec::new();

        while let Some(token) = self.buffer.front_mut() {
            match token.kind {
                TokenKind::Text => {
                    if let Some(idx) = token.text.find('\n') {
                        let rest = token.text.split_off(idx + 1);
                        let head = std::mem::replace(&mut token.text, rest);
                        if token.text.is_empty() {
                            self.consume();
                        }
                        push_node(&mut nodes, Node::Text(head));
                        break;
                    }
                    let token = self.next()?;
                    push_node(&mut nodes, simple_node(token));
                }
                TokenKind::Var | TokenKind::VarExpr | TokenKind::Raw | TokenKind::RawExpr => {
                    let token = self.next()?;
                    nodes.push(simple_node(token));
                }
                _ => break,
            }
        }

        Ok(Node::ConditionalLine {
            condition: guard.text,
            nodes,
            line: guard.line,
        })
    }

    fn parse_if(&mut self) -> Result<Node, ParseError> {
        let head = self.next()?;
        self.expect(TokenKind::LBrace, "{", "after if condition")?;

        let body = self.parse_nodes()?;
        let mut cases = vec![Branch {
            condition: head.text,
            body,
            line: head.line,
        }];
        let mut else_body = None;

        loop {
            match self.peek_kind() {
                Some(TokenKind::ElseIf) => {
                    let clause = self.next()?;
                    self.expect(TokenKind::LBrace, "{", "after else if condition")?;
                    let body = self.parse_nodes()?;
                    cases.push(Branch {
                        condition: clause.text,
                        body,
                        line: clause.line,
                    });
                }
                Some(TokenKind::Else) => {
                    self.consume();
                    self.expect(TokenKind::LBrace, "{", "after else")?;
                    else_body = Some(self.parse_nodes()?);
                    break;
                }
                _ => break,
            }
        }

        self.expect(TokenKind::RBrace, "}", "to close if statement")?;
        Ok(Node::If { cases, else_body })
    }

    fn parse_for(&mut self) -> Result<Node, ParseError> {
        let head = self.next()?;
        self.expect(TokenKind::LBrace, "{", "after for header")?;
        let body = self.parse_nodes()?;
        self.expect(TokenKind::RBrace, "}", "to close for statement")?;

        let kind = if head
            .text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .any(|word| word == "range")
        {
            ForKind::Range
        } else {
            ForKind::Counted
        };

        Ok(Node::For {
            kind,
            header: head.text,
            body,
            line: head.line,
        })
    }

    fn parse_use(&mut self) -> Result<Node, ParseError> {
        let head = self.next()?;
        self.expect(TokenKind::LBrace, "{", "after use path")?;

        let mut covers = Vec::new();
        loop {
            match self.peek(0) {
                Some(t) if t.kind == TokenKind::Text && t.text.trim().is_empty() => {
                    self.consume();
                }
                Some(t) if t.kind == TokenKind::Cover => covers.push(self.parse_cover()?),
                _ => break,
            }
        }

        self.expect(TokenKind::RBrace, "}", "to close use statement")?;
        Ok(Node::Use(UseNode {
            path: head.text,
            optional: head.conditional,
            covers,
            line: head.line,
        }))
    }

    fn parse_define(&mut self) -> Result<Node, ParseError> {
        let head = self.next()?;
        self.expect(TokenKind::LBrace, "{", "after define name")?;
        let body = self.parse_nodes()?;
        self.expect(TokenKind::RBrace, "}", "to close define statement")?;
        Ok(Node::Define(DefineNode {
            name: head.text,
            body,
            line: head.line,
        }))
    }

    fn parse_cover(&mut self) -> Result<CoverNode, ParseError> {
        let head = self.next()?;
        self.expect(TokenKind::LBrace, "{", "after cover name")?;
        let body = self.parse_nodes()?;
        self.expect(TokenKind::RBrace, "}", "to close cover statement")?;
        Ok(CoverNode {
            name: head.text,
            body,
            line: head.line,
        })
    }

    fn parse_func_block(&mut self) -> Result<Node, ParseError> {
        let head = self.next()?;
        self.expect(TokenKind::LBrace, "{", "after function call")?;
        let body = self.parse_nodes()?;
        self.expect(TokenKind::RBrace, "}", "to close function block")?;
        Ok(Node::FuncBlock {
            callee: head.text,
            body,
            line: head.line,
        })
    }
}

fn simple_node(token: Token) -> Node {
    let Token {
        kind,
        text,
        conditional,
        line,
        ..
    } = token;
    match kind {
        TokenKind::Var => Node::Var {
            name: text,
            conditional,
            line,
        },
        TokenKind::VarExpr => Node::VarExpr {
            expr: text,
            conditional,
            line,
        },
        TokenKind::Raw => Node::Raw {
            name: text,
            conditional,
            line,
        },
        TokenKind::RawExpr => Node::RawExpr {
            expr: text,
            conditional,
            line,
        },
        _ => Node::Text(text),
    }
}

/// Adjacent text (e.g. around an `@@` escape) is merged into one node.
fn push_node(nodes: &mut Vec<Node>, node: Node) {
    if let (Some(Node::Text(prev)), Node::Text(next)) = (nodes.last_mut(), &node) {
        prev.push_str(next);
        return;
    }
    nodes.push(node);
}
