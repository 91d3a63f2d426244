//! Tokenizer for the `@` directive language embedded in SQL text.
//!
//! Everything that is not an `@` construct or a closing brace is plain SQL
//! text. The recognised forms are:
//!
//! - `@name` / `@name?`: parameterized variable
//! - `@ expr @` / `@ expr @?`: parameterized expression
//! - `@=name`, `@=name@`, `@= expr @` (each optionally `?`): raw output
//! - `@? expr @`: line guard
//! - `@{ code }`: raw code block, brace-depth matched
//! - `@ callee(args) {`: function block opener
//! - `@if`, `@for`, `@use`, `@define`, `@cover`: keyword, argument up to `{`
//! - `}`, `} else {`, `} else if cond {`
//! - `@@`: a literal `@`

use std::collections::VecDeque;

use crate::error::{snippet, LexError, LexErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Text,
    Var,
    VarExpr,
    Raw,
    RawExpr,
    LineGuard,
    Code,
    FuncBlock,

    // Keywords
    If,
    ElseIf,
    Else,
    For,
    Use,
    Define,
    Cover,

    // Delimiters
    LBrace,
    RBrace,
}

impl TokenKind {
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Text => "text",
            TokenKind::Var => "variable",
            TokenKind::VarExpr => "expression",
            TokenKind::Raw => "raw variable",
            TokenKind::RawExpr => "raw expression",
            TokenKind::LineGuard => "line guard",
            TokenKind::Code => "code block",
            TokenKind::FuncBlock => "function block",
            TokenKind::If => "@if",
            TokenKind::ElseIf => "'else if'",
            TokenKind::Else => "'else'",
            TokenKind::For => "@for",
            TokenKind::Use => "@use",
            TokenKind::Define => "@define",
            TokenKind::Cover => "@cover",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
        }
    }
}

/// A lexical unit. `text` holds the payload: the literal SQL for text
/// tokens, the variable name, the expression, or a keyword's argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Set when the placeholder or keyword carried a trailing `?`.
    pub conditional: bool,
    pub line: usize,
    pub column: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            conditional: false,
            line,
            column,
        }
    }

    fn conditional(mut self, conditional: bool) -> Self {
        self.conditional = conditional;
        self
    }
}

/// A saved scan position for speculative lookahead.
#[derive(Clone, Copy)]
struct Mark {
    cursor: usize,
    line: usize,
    column: usize,
}

#[derive(Clone)]
pub struct Tokenizer<'a> {
    input: &'a str,
    cursor: usize,
    line: usize,
    column: usize,
    pending: VecDeque<Token>,
}

/// Tokenize a whole template.
pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let mut tokenizer = Tokenizer::new(input);
    let mut tokens = Vec::new();
    while let Some(token) = tokenizer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            cursor: 0,
            line: 1,
            column: 1,
            pending: VecDeque::new(),
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.cursor..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.cursor += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn advance_str(&mut self, s: &str) {
        for _ in s.chars() {
            self.advance();
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            cursor: self.cursor,
            line: self.line,
            column: self.column,
        }
    }

    fn reset(&mut self, mark: Mark) {
        self.cursor = mark.cursor;
        self.line = mark.line;
        self.column = mark.column;
    }

    fn skip_blanks(&mut self) {
        while self.peek().is_some_and(is_blank) {
            self.advance();
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn error(&self, kind: LexErrorKind, line: usize, column: usize) -> LexError {
        LexError {
            kind,
            line,
            column,
            snippet: snippet(self.input, line),
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>, LexError> {
        if let Some(token) = self.pending.pop_front() {
            return Ok(Some(token));
        }

        match self.peek() {
            None => Ok(None),
            Some('@') => self.scan_at().map(Some),
            Some('}') => self.scan_close_brace().map(Some),
            Some(_) => Ok(Some(self.scan_text())),
        }
    }

    fn scan_text(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        let start = self.cursor;
        while let Some(c) = self.peek() {
            if c == '@' || c == '}' {
                break;
            }
            self.advance();
        }
        Token::new(TokenKind::Text, &self.input[start..self.cursor], line, column)
    }

    fn read_word(&mut self) -> &'a str {
        let start = self.cursor;
        while self.peek().is_some_and(is_ident_char) {
            self.advance();
        }
        &self.input[start..self.cursor]
    }

    fn take_question(&mut self) -> bool {
        if self.peek() == Some('?') {
            self.advance();
            true
        } else {
            false
        }
    }

    fn scan_at(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        self.advance(); // @

        match self.peek() {
            Some('@') => {
                self.advance();
                Ok(Token::new(TokenKind::Text, "@", line, column))
            }
            Some('=') => {
                self.advance();
                self.scan_raw(line, column)
            }
            Some('{') => {
                self.advance();
                let code = self.read_until_matching_brace(line, column)?;
                Ok(Token::new(TokenKind::Code, code.trim(), line, column))
            }
            Some('?') => {
                self.advance();
                self.skip_blanks();
                let expr = self.read_until_at(line, column)?;
                Ok(Token::new(TokenKind::LineGuard, expr.trim(), line, column))
            }
            Some(c) if is_blank(c) => {
                self.skip_blanks();
                self.scan_expression(line, column)
            }
            Some(c) if c.is_alphabetic() || c == '_' => {
                let word = self.read_word();
                let kind = match word {
                    "if" => TokenKind::If,
                    "for" => TokenKind::For,
                    "use" => TokenKind::Use,
                    "define" => TokenKind::Define,
                    "cover" => TokenKind::Cover,
                    _ => {
                        let conditional = self.take_question();
                        return Ok(Token::new(TokenKind::Var, word, line, column)
                            .conditional(conditional));
                    }
                };
                let conditional = self.take_question();
                self.scan_keyword(kind, word, conditional, line, column)
            }
            // A lone `@` (end of input, punctuation, newline) is just text.
            _ => Ok(Token::new(TokenKind::Text, "@", line, column)),
        }
    }

    fn scan_raw(&mut self, line: usize, column: usize) -> Result<Token, LexError> {
        if self.peek().is_some_and(is_blank) {
            self.skip_blanks();
            let expr = self.read_until_at(line, column)?;
            let conditional = self.take_question();
            return Ok(Token::new(TokenKind::RawExpr, expr.trim(), line, column)
                .conditional(conditional));
        }

        let word = self.read_word();
        if word.is_empty() {
            return Ok(Token::new(TokenKind::Text, "@=", line, column));
        }
        // `@=name@` form
        if self.peek() == Some('@') {
            self.advance();
        }
        let conditional = self.take_question();
        Ok(Token::new(TokenKind::Raw, word, line, column).conditional(conditional))
    }

    /// `@ expr @` or, when a top-level `{` comes first, `@ callee(args) {`.
    fn scan_expression(&mut self, line: usize, column: usize) -> Result<Token, LexError> {
        let start = self.cursor;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;

        while let Some(c) = self.peek() {
            if let Some(q) = quote {
                self.advance();
                if c == '\\' {
                    self.advance();
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '@' => {
                    let expr = &self.input[start..self.cursor];
                    self.advance();
                    let conditional = self.take_question();
                    return Ok(Token::new(TokenKind::VarExpr, expr.trim(), line, column)
                        .conditional(conditional));
                }
                '{' if depth == 0 => {
                    let callee = &self.input[start..self.cursor];
                    self.pending
                        .push_back(Token::new(TokenKind::LBrace, "{", self.line, self.column));
                    self.advance();
                    return Ok(Token::new(TokenKind::FuncBlock, callee.trim(), line, column));
                }
                '(' | '[' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                '"' | '\'' | '`' => quote = Some(c),
                _ => {}
            }
            self.advance();
        }

        Err(self.error(LexErrorKind::UnterminatedExpression, line, column))
    }

    fn scan_keyword(
        &mut self,
        kind: TokenKind,
        word: &str,
        conditional: bool,
        line: usize,
        column: usize,
    ) -> Result<Token, LexError> {
        self.skip_blanks();
        let argument = self.read_until_brace(word, line, column)?;
        self.pending
            .push_back(Token::new(TokenKind::LBrace, "{", self.line, self.column));
        self.advance(); // {
        Ok(Token::new(kind, argument.trim(), line, column).conditional(conditional))
    }

    fn scan_close_brace(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        self.advance(); // }

        let saved = self.mark();
        self.skip_whitespace();

        if self.remaining().starts_with("else")
            && !self.remaining()[4..].starts_with(is_ident_char)
        {
            self.advance_str("else");
            self.skip_whitespace();

            if self.remaining().starts_with("if")
                && self.remaining()[2..].starts_with(|c: char| c.is_whitespace() || c == '(')
            {
                self.advance_str("if");
                self.skip_blanks();
                let condition = self.read_until_brace("else if", line, column)?;
                self.pending
                    .push_back(Token::new(TokenKind::LBrace, "{", self.line, self.column));
                self.advance(); // {
                return Ok(Token::new(TokenKind::ElseIf, condition.trim(), line, column));
            }

            if self.peek() == Some('{') {
                self.pending
                    .push_back(Token::new(TokenKind::LBrace, "{", self.line, self.column));
                self.advance();
                return Ok(Token::new(TokenKind::Else, "", line, column));
            }
        }

        // Not an else clause: back out of the lookahead.
        self.reset(saved);
        Ok(Token::new(TokenKind::RBrace, "}", line, column))
    }

    /// Read up to (not including) the next `{` that is outside parentheses,
    /// brackets and string literals.
    fn read_until_brace(
        &mut self,
        keyword: &str,
        line: usize,
        column: usize,
    ) -> Result<&'a str, LexError> {
        let start = self.cursor;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;

        while let Some(c) = self.peek() {
            if let Some(q) = quote {
                if c == '\\' {
                    self.advance();
                } else if c == q {
                    quote = None;
                }
                self.advance();
                continue;
            }
            match c {
                '{' if depth == 0 => return Ok(&self.input[start..self.cursor]),
                '(' | '[' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                '"' | '\'' | '`' => quote = Some(c),
                _ => {}
            }
            self.advance();
        }

        Err(self.error(
            LexErrorKind::MissingBrace {
                keyword: keyword.to_string(),
            },
            line,
            column,
        ))
    }

    /// Read up to the closing `@`, consuming it.
    fn read_until_at(&mut self, line: usize, column: usize) -> Result<&'a str, LexError> {
        let start = self.cursor;
        let mut quote: Option<char> = None;

        while let Some(c) = self.peek() {
            if let Some(q) = quote {
                if c == '\\' {
                    self.advance();
                } else if c == q {
                    quote = None;
                }
                self.advance();
                continue;
            }
            match c {
                '@' => {
                    let expr = &self.input[start..self.cursor];
                    self.advance();
                    return Ok(expr);
                }
                '"' | '\'' | '`' => quote = Some(c),
                _ => {}
            }
            self.advance();
        }

        Err(self.error(LexErrorKind::UnterminatedExpression, line, column))
    }

    /// Read a brace-depth-matched body after `@{`, consuming the final `}`.
    fn read_until_matching_brace(
        &mut self,
        line: usize,
        column: usize,
    ) -> Result<&'a str, LexError> {
        let start = self.cursor;
        let mut depth = 1usize;

        while let Some(c) = self.peek() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let code = &self.input[start..self.cursor];
                        self.advance();
                        return Ok(code);
                    }
                }
                _ => {}
            }
            self.advance();
        }

        Err(self.error(LexErrorKind::UnterminatedBlock, line, column))
    }
}
