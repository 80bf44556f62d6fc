//! # Structured Config Source
//!
//! Parser and canonical formatter for the data subset of CUE used by
//! blueprints, environment overlays and rendered bundles.
//!
//! ## Supported Syntax
//!
//! ```text
//! package blueprint              // optional package clause
//!
//! version: "1.0"
//! project: name: "p"             // chained shorthand labels
//! project: {
//!     deployment: bundle: {
//!         env: "test", modules: {}
//!     }
//!     "quoted-label": [1, 2.5, true, null]
//! }
//! ```
//!
//! Fields may repeat. Repeated structs merge recursively and repeated
//! scalars must be equal, otherwise parsing fails with [`Error::Parse`].
//! Expressions, references, definitions and constraints are not part of
//! the subset.
//!
//! ## Canonical Form
//!
//! [`format`] emits tab-indented source with keys sorted, colon-aligned
//! values within runs of single-line fields, and inline scalar lists. The
//! output depends only on the value, so equal values produce identical bytes.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A concrete CUE data value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    /// Empty struct.
    pub fn empty_struct() -> Self {
        Value::Struct(BTreeMap::new())
    }

    /// Looks up a dot-separated path of struct labels.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .filter(|p| !p.is_empty())
            .try_fold(self, |v, label| match v {
                Value::Struct(fields) => fields.get(label),
                _ => None,
            })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Struct(fields) => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(fields) => {
                Value::Struct(fields.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect())
            }
        }
    }

    fn is_inline(&self) -> bool {
        match self {
            Value::List(items) => items.iter().all(|v| !matches!(v, Value::List(_) | Value::Struct(_))),
            Value::Struct(fields) => fields.is_empty(),
            _ => true,
        }
    }
}

/// Unifies two values. Structs merge recursively; other values must be equal.
pub fn unify(a: Value, b: Value) -> Result<Value> {
    unify_at(a, b, "", 0, 0)
}

fn unify_at(a: Value, b: Value, path: &str, line: usize, column: usize) -> Result<Value> {
    match (a, b) {
        (Value::Struct(mut left), Value::Struct(right)) => {
            for (key, value) in right {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                let merged = match left.remove(&key) {
                    Some(existing) => unify_at(existing, value, &child_path, line, column)?,
                    None => value,
                };
                left.insert(key, merged);
            }
            Ok(Value::Struct(left))
        }
        (left, right) if left == right => Ok(left),
        (left, right) => Err(Error::Parse {
            line,
            column,
            message: format!(
                "conflicting values for {}: {} and {}",
                if path.is_empty() { "<root>" } else { path },
                inline(&left),
                inline(&right)
            ),
        }),
    }
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Parse {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut tokens = Vec::new();

        loop {
            let (line, column) = (self.line, self.column);
            let Some(&c) = self.chars.peek() else {
                tokens.push(Spanned {
                    token: Token::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let token = match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                    continue;
                }
                '\n' => {
                    self.bump();
                    Token::Newline
                }
                '/' => {
                    self.bump();
                    if self.chars.peek() != Some(&'/') {
                        return Err(self.error("unexpected '/'"));
                    }
                    while self.chars.peek().is_some_and(|&c| c != '\n') {
                        self.bump();
                    }
                    continue;
                }
                '{' => {
                    self.bump();
                    Token::LBrace
                }
                '}' => {
                    self.bump();
                    Token::RBrace
                }
                '[' => {
                    self.bump();
                    Token::LBracket
                }
                ']' => {
                    self.bump();
                    Token::RBracket
                }
                ':' => {
                    self.bump();
                    Token::Colon
                }
                ',' => {
                    self.bump();
                    Token::Comma
                }
                '"' => self.string()?,
                c if c == '-' || c.is_ascii_digit() => self.number()?,
                c if is_ident_start(c) => {
                    let mut ident = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if !is_ident_char(c) {
                            break;
                        }
                        ident.push(c);
                        self.bump();
                    }
                    Token::Ident(ident)
                }
                other => return Err(self.error(format!("unexpected character '{}'", other))),
            };

            tokens.push(Spanned { token, line, column });
        }
    }

    fn string(&mut self) -> Result<Token> {
        self.bump();
        let mut out = String::new();

        loop {
            let c = self.bump().ok_or_else(|| self.error("unterminated string"))?;
            match c {
                '"' => return Ok(Token::Str(out)),
                '\n' => return Err(self.error("newline in string")),
                '\\' => {
                    let esc = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'b' => out.push('\u{8}'),
                        'f' => out.push('\u{c}'),
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        '/' => out.push('/'),
                        'u' => {
                            let mut hex = String::with_capacity(4);
                            for _ in 0..4 {
                                hex.push(self.bump().ok_or_else(|| self.error("truncated \\u escape"))?);
                            }
                            let code =
                                u32::from_str_radix(&hex, 16).map_err(|_| self.error("invalid \\u escape"))?;
                            out.push(char::from_u32(code).ok_or_else(|| self.error("invalid code point"))?);
                        }
                        other => return Err(self.error(format!("unknown escape '\\{}'", other))),
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn number(&mut self) -> Result<Token> {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }

        if let Ok(i) = text.parse::<i64>() {
            return Ok(Token::Int(i));
        }
        text.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Token::Float)
            .ok_or_else(|| self.error(format!("invalid number '{}'", text)))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$' || c == '#'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '#'
}

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Spanned {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error_at(tok: &Spanned, message: impl Into<String>) -> Error {
        Error::Parse {
            line: tok.line,
            column: tok.column,
            message: message.into(),
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek().token == Token::Newline {
            self.pos += 1;
        }
    }

    fn file(&mut self) -> Result<Value> {
        self.skip_newlines();

        if self.peek().token == Token::Ident("package".to_string()) {
            self.next();
            let name = self.next();
            if !matches!(name.token, Token::Ident(_)) {
                return Err(Self::error_at(&name, "expected package name"));
            }
        }

        self.fields(&Token::Eof)
    }

    /// Parses fields until `end`, which is consumed.
    fn fields(&mut self, end: &Token) -> Result<Value> {
        let mut result = Value::empty_struct();

        loop {
            while matches!(self.peek().token, Token::Newline | Token::Comma) {
                self.pos += 1;
            }
            if &self.peek().token == end {
                self.next();
                return Ok(result);
            }

            let start = self.peek().clone();
            let (label, value) = self.field()?;
            let mut single = BTreeMap::new();
            single.insert(label, value);
            result = unify_at(result, Value::Struct(single), "", start.line, start.column)?;

            let sep = self.peek().clone();
            match &sep.token {
                Token::Newline | Token::Comma => {}
                t if t == end => {}
                _ => return Err(Self::error_at(&sep, "expected ',' or newline after field")),
            }
        }
    }

    fn label(&mut self) -> Result<String> {
        let tok = self.next();
        match tok.token {
            Token::Ident(name) => Ok(name),
            Token::Str(name) => Ok(name),
            _ => Err(Self::error_at(&tok, "expected field label")),
        }
    }

    fn field(&mut self) -> Result<(String, Value)> {
        let label = self.label()?;
        let colon = self.next();
        if colon.token != Token::Colon {
            return Err(Self::error_at(&colon, format!("expected ':' after label '{}'", label)));
        }

        // Shorthand `a: b: value`
        let is_chain = matches!(self.peek().token, Token::Ident(_) | Token::Str(_))
            && self.tokens.get(self.pos + 1).is_some_and(|t| t.token == Token::Colon);

        let value = if is_chain {
            let (inner_label, inner_value) = self.field()?;
            let mut fields = BTreeMap::new();
            fields.insert(inner_label, inner_value);
            Value::Struct(fields)
        } else {
            self.value()?
        };

        Ok((label, value))
    }

    fn value(&mut self) -> Result<Value> {
        let tok = self.next();
        match tok.token {
            Token::LBrace => self.fields(&Token::RBrace),
            Token::LBracket => self.list(),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Int(i) => Ok(Value::Int(i)),
            Token::Float(f) => Ok(Value::Float(f)),
            Token::Ident(ref id) => match id.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                other => Err(Self::error_at(&tok, format!("unsupported expression '{}'", other))),
            },
            _ => Err(Self::error_at(&tok, "expected value")),
        }
    }

    fn list(&mut self) -> Result<Value> {
        let mut items = Vec::new();

        loop {
            self.skip_newlines();
            if self.peek().token == Token::RBracket {
                self.next();
                return Ok(Value::List(items));
            }

            items.push(self.value()?);
            self.skip_newlines();

            let tok = self.next();
            match tok.token {
                Token::Comma => {}
                Token::RBracket => return Ok(Value::List(items)),
                _ => return Err(Self::error_at(&tok, "expected ',' or ']' in list")),
            }
        }
    }
}

/// Parses CUE source into a struct value.
pub fn parse(src: &str) -> Result<Value> {
    let tokens = Lexer::new(src).tokenize()?;
    Parser { tokens, pos: 0 }.file()
}

// =============================================================================
// Formatter
// =============================================================================

/// Formats a struct value as canonical CUE source.
///
/// Non-struct values are emitted as a single expression.
pub fn format(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Struct(fields) => write_fields(&mut out, fields, 0),
        other => {
            write_value(&mut out, other, 0);
            out.push('\n');
        }
    }
    out
}

fn write_fields(out: &mut String, fields: &BTreeMap<String, Value>, depth: usize) {
    let entries: Vec<(String, &Value)> = fields.iter().map(|(k, v)| (format_label(k), v)).collect();

    let mut i = 0;
    while i < entries.len() {
        if !entries[i].1.is_inline() {
            let (label, value) = &entries[i];
            indent(out, depth);
            let _ = write!(out, "{}: ", label);
            write_value(out, value, depth);
            out.push('\n');
            i += 1;
            continue;
        }

        // Align a run of single-line fields
        let run_end = entries[i..]
            .iter()
            .position(|(_, v)| !v.is_inline())
            .map_or(entries.len(), |p| i + p);
        let width = entries[i..run_end].iter().map(|(l, _)| l.len()).max().unwrap_or(0);

        for (label, value) in &entries[i..run_end] {
            indent(out, depth);
            let _ = write!(out, "{}:{} ", label, " ".repeat(width - label.len()));
            write_value(out, value, depth);
            out.push('\n');
        }
        i = run_end;
    }
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Struct(fields) if fields.is_empty() => out.push_str("{}"),
        Value::Struct(fields) => {
            out.push_str("{\n");
            write_fields(out, fields, depth + 1);
            indent(out, depth);
            out.push('}');
        }
        Value::List(items) if value.is_inline() => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item, depth);
            }
            out.push(']');
        }
        Value::List(items) => {
            out.push_str("[\n");
            for item in items {
                indent(out, depth + 1);
                write_value(out, item, depth + 1);
                out.push_str(",\n");
            }
            indent(out, depth);
            out.push(']');
        }
        scalar => out.push_str(&inline(scalar)),
    }
}

fn inline(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{:.1}", f),
        Value::Float(f) => f.to_string(),
        Value::String(s) => quote(s),
        Value::List(_) | Value::Struct(_) => {
            let mut out = String::new();
            write_value(&mut out, value, 0);
            out
        }
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

const KEYWORDS: &[&str] = &["package", "import", "true", "false", "null", "for", "in", "if", "let"];

fn format_label(label: &str) -> String {
    let mut chars = label.chars();
    let is_ident = chars.next().is_some_and(|c| is_ident_start(c) && c != '#' && c != '$')
        && chars.all(is_ident_char)
        && !KEYWORDS.contains(&label);
    if is_ident { label.to_string() } else { quote(label) }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}
