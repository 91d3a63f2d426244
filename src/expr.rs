//! The default expression language: Go-flavoured operators over [`Value`]s.
//!
//! ```text
//! a > 0 && name != ""       ids[0]      user.address.city
//! len(ids) + 1              !done       -(x % 3)
//! ```
//!
//! Code blocks (`@{ ... }`) are statement lists separated by `;` or newlines:
//! `x := e`, `x = e`, `x += e`, `x -= e`, `x++`, `x--` and bare calls.

use crate::error::EvalError;
use crate::eval::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Nil,

    // Operators
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    AndAnd,
    OrOr,
    Bang,

    // Statements
    Assign,
    Declare,
    PlusAssign,
    MinusAssign,
    Incr,
    Decr,
    Separator,

    // Punctuation
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

struct Tokenizer<'a> {
    input: &'a str,
    cursor: usize,
    // Newlines separate statements in code blocks and are blanks elsewhere.
    statements: bool,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str, statements: bool) -> Self {
        Self {
            input,
            cursor: 0,
            statements,
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        self.cursor += n;
    }

    fn syntax(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            expr: self.input.to_string(),
            message: message.into(),
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, EvalError> {
        loop {
            let Some(c) = self.remaining().chars().next() else {
                return Ok(None);
            };
            if c == '\n' && self.statements {
                self.advance(1);
                return Ok(Some(Token::Separator));
            }
            if c.is_whitespace() {
                self.advance(c.len_utf8());
                continue;
            }
            break;
        }

        let rem = self.remaining();
        const SYMBOLS: &[(&str, Token)] = &[
            (":=", Token::Declare),
            ("==", Token::EqEq),
            ("!=", Token::NotEq),
            ("<=", Token::Le),
            (">=", Token::Ge),
            ("&&", Token::AndAnd),
            ("||", Token::OrOr),
            ("++", Token::Incr),
            ("--", Token::Decr),
            ("+=", Token::PlusAssign),
            ("-=", Token::MinusAssign),
            ("<", Token::Lt),
            (">", Token::Gt),
            ("+", Token::Plus),
            ("-", Token::Minus),
            ("*", Token::Star),
            ("/", Token::Slash),
            ("%", Token::Percent),
            ("!", Token::Bang),
            ("=", Token::Assign),
            (";", Token::Separator),
            (".", Token::Dot),
            (",", Token::Comma),
            ("(", Token::LParen),
            (")", Token::RParen),
            ("[", Token::LBracket),
            ("]", Token::RBracket),
        ];
        for (symbol, token) in SYMBOLS {
            if rem.starts_with(symbol) {
                self.advance(symbol.len());
                return Ok(Some(token.clone()));
            }
        }

        let c = rem.chars().next().unwrap_or_default();
        if c == '"' || c == '\'' || c == '`' {
            return self.read_string(c).map(Some);
        }
        if c.is_ascii_digit() {
            return self.read_number().map(Some);
        }
        if c.is_alphabetic() || c == '_' {
            let len = rem
                .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                .unwrap_or(rem.len());
            let word = &rem[..len];
            self.advance(len);
            return Ok(Some(match word {
                "true" => Token::True,
                "false" => Token::False,
                "nil" => Token::Nil,
                _ => Token::Ident(word.to_string()),
            }));
        }

        Err(self.syntax(format!("unexpected character '{c}'")))
    }

    fn read_string(&mut self, quote: char) -> Result<Token, EvalError> {
        self.advance(1);
        let mut out = String::new();
        let mut chars = self.remaining().char_indices();
        while let Some((idx, c)) = chars.next() {
            if c == quote {
                self.advance(idx + 1);
                return Ok(Token::Str(out));
            }
            // Backtick strings are raw.
            if c == '\\' && quote != '`' {
                match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, other)) => out.push(other),
                    None => break,
                }
                continue;
            }
            out.push(c);
        }
        Err(self.syntax("unterminated string literal"))
    }

    fn read_number(&mut self) -> Result<Token, EvalError> {
        let rem = self.remaining();
        let mut len = rem
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rem.len());
        let is_float = rem[len..].starts_with('.')
            && rem[len + 1..].starts_with(|c: char| c.is_ascii_digit());
        if is_float {
            len += 1;
            len += rem[len..]
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rem.len() - len);
        }
        let text = &rem[..len];
        self.advance(len);
        if is_float {
            text.parse()
                .map(Token::Float)
                .map_err(|_| self.syntax(format!("invalid number {text}")))
        } else {
            text.parse()
                .map(Token::Int)
                .map_err(|_| self.syntax(format!("integer {text} out of range")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Attribute(Box<Expr>, String), // foo.bar
    Index(Box<Expr>, Box<Expr>),  // foo[0], foo["bar"]
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    BinOp(Box<Expr>, BinOp, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Declare(String, Expr),
    Assign(String, Expr),
    AddAssign(String, Expr),
    SubAssign(String, Expr),
    Incr(String),
    Decr(String),
    Expr(Expr),
}

/// Parse a single expression. Trailing input is an error.
pub fn parse_expr(source: &str) -> Result<Expr, EvalError> {
    let mut parser = Parser::new(source, false)?;
    let expr = parser.parse_expr()?;
    match parser.peek(0) {
        None => Ok(expr),
        Some(t) => Err(parser.syntax(format!("unexpected {t:?} after expression"))),
    }
}

/// Parse a code block into statements.
pub fn parse_program(source: &str) -> Result<Vec<Stmt>, EvalError> {
    let mut parser = Parser::new(source, true)?;
    let mut stmts = Vec::new();
    loop {
        while parser.peek(0) == Some(&Token::Separator) {
            parser.consume();
        }
        if parser.peek(0).is_none() {
            break;
        }
        stmts.push(parser.parse_stmt()?);
        match parser.peek(0) {
            None | Some(Token::Separator) => {}
            Some(t) => return Err(parser.syntax(format!("unexpected {t:?} after statement"))),
        }
    }
    Ok(stmts)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, statements: bool) -> Result<Self, EvalError> {
        let mut lexer = Tokenizer::new(source, statements);
        let mut tokens = Vec::new();
        while let Some(token) = lexer.next_token()? {
            tokens.push(token);
        }
        Ok(Self {
            source,
            tokens,
            pos: 0,
        })
    }

    fn peek(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), EvalError> {
        match self.consume() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(self.syntax(format!("expected {token:?}, got {t:?}"))),
            None => Err(self.syntax(format!("expected {token:?}, got end of input"))),
        }
    }

    fn syntax(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            expr: self.source.to_string(),
            message: message.into(),
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, EvalError> {
        if let Some(Token::Ident(name)) = self.peek(0).cloned() {
            let stmt = match self.peek(1) {
                Some(Token::Declare) => Some(Stmt::Declare as fn(String, Expr) -> Stmt),
                Some(Token::Assign) => Some(Stmt::Assign as fn(String, Expr) -> Stmt),
                Some(Token::PlusAssign) => Some(Stmt::AddAssign as fn(String, Expr) -> Stmt),
                Some(Token::MinusAssign) => Some(Stmt::SubAssign as fn(String, Expr) -> Stmt),
                Some(Token::Incr) => {
                    self.pos += 2;
                    return Ok(Stmt::Incr(name));
                }
                Some(Token::Decr) => {
                    self.pos += 2;
                    return Ok(Stmt::Decr(name));
                }
                _ => None,
            };
            if let Some(build) = stmt {
                self.pos += 2;
                let value = self.parse_expr()?;
                return Ok(build(name, value));
            }
        }
        Ok(Stmt::Expr(self.parse_expr()?))
    }

    fn parse_expr(&mut self) -> Result<Expr, EvalError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        while let Some(Token::OrOr) = self.peek(0) {
            self.consume();
            let rhs = self.parse_and()?;
            lhs = Expr::BinOp(Box::new(lhs), BinOp::Or, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_cmp()?;
        while let Some(Token::AndAnd) = self.peek(0) {
            self.consume();
            let rhs = self.parse_cmp()?;
            lhs = Expr::BinOp(Box::new(lhs), BinOp::And, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match self.peek(0) {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.consume();
            let rhs = self.parse_add()?;
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek(0) {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.consume();
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek(0) {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.consume();
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        let op = match self.peek(0) {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            _ => return self.parse_primary(),
        };
        self.consume();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_args(&mut self, close: Token) -> Result<Vec<Expr>, EvalError> {
        let mut args = Vec::new();
        if self.peek(0) == Some(&close) {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.consume() {
                Some(Token::Comma) => continue,
                Some(t) if t == close => return Ok(args),
                Some(t) => return Err(self.syntax(format!("expected ',' or {close:?}, got {t:?}"))),
                None => return Err(self.syntax(format!("expected {close:?}, got end of input"))),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        let mut expr = match self.consume() {
            Some(Token::Str(s)) => Expr::Literal(Value::String(s)),
            Some(Token::Int(i)) => Expr::Literal(Value::Int(i)),
            Some(Token::Float(f)) => Expr::Literal(Value::Float(f)),
            Some(Token::True) => Expr::Literal(Value::Bool(true)),
            Some(Token::False) => Expr::Literal(Value::Bool(false)),
            Some(Token::Nil) => Expr::Literal(Value::Null),
            Some(Token::Ident(name)) => {
                if self.peek(0) == Some(&Token::LParen) {
                    self.consume();
                    Expr::Call(name, self.parse_args(Token::RParen)?)
                } else {
                    Expr::Var(name)
                }
            }
            Some(Token::LBracket) => Expr::List(self.parse_args(Token::RBracket)?),
            Some(Token::LParen) => {
                let e = self.parse_expr()?;
                self.expect(Token::RParen)?;
                e
            }
            Some(t) => return Err(self.syntax(format!("expected expression, got {t:?}"))),
            None => return Err(self.syntax("expected expression, got end of input")),
        };

        // Suffixes: .attr, [index]
        loop {
            match self.peek(0) {
                Some(Token::Dot) => {
                    self.consume();
                    match self.consume() {
                        Some(Token::Ident(attr)) => {
                            if self.peek(0) == Some(&Token::LParen) {
                                return Err(self.syntax(format!(
                                    "method call .{attr}() is not supported, call bound methods by name"
                                )));
                            }
                            expr = Expr::Attribute(Box::new(expr), attr);
                        }
                        t => {
                            return Err(
                                self.syntax(format!("expected identifier after dot, got {t:?}"))
                            )
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.consume();
                    let idx = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(idx));
                }
                _ => break,
            }
        }

        Ok(expr)
    }
}
