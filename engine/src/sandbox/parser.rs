//! Statement recognition for plugin code
//!
//! Plugin code is never evaluated as a general program. Every non-blank,
//! non-comment line must be exactly one of three statement shapes:
//!
//! ```text
//! console.<log|warn|error|info>(<args>)
//! [await ]api.<namespace>.<method>(<args>)
//! [let |const |var ]<identifier> = <value>
//! ```
//!
//! optionally followed by `;` and a `//` comment. Values are quoted strings,
//! numbers, `true`/`false`, `null`/`undefined`, flat arrays, flat objects,
//! identifiers and `config.<key>` references. Anything else rejects the whole
//! unit with the offending line number.

use sdk::errors::EngineError;
use serde_json::{Number, Value};

/// Words that cannot be assigned to
const RESERVED: &[&str] = &[
    "api", "config", "console", "let", "const", "var", "await", "true", "false", "null",
    "undefined",
];

/// `console.*` levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "log" => Some(Self::Log),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or(Self::Log)
    }
}

/// A value expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Bare identifier; resolves to a variable or to its own name
    Ident(String),
    /// `config` (None) or `config.<key>`
    Config(Option<String>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

/// A recognized statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Console {
        level: ConsoleLevel,
        args: Vec<Expr>,
    },
    ApiCall {
        namespace: String,
        method: String,
        args: Vec<Expr>,
    },
    Assign {
        name: String,
        value: Expr,
    },
}

/// A statement with its 1-based source line
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub number: usize,
    pub statement: Statement,
}

/// A parsed code unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub lines: Vec<Line>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Parse a whole code unit, failing on the first unrecognized line
pub fn parse(code: &str) -> Result<Program, EngineError> {
    let mut lines = Vec::new();
    for (index, raw) in code.lines().enumerate() {
        let number = index + 1;
        let text = raw.trim();
        if text.is_empty() || text.starts_with("//") {
            continue;
        }
        let statement = parse_statement(text)
            .ok_or_else(|| EngineError::unsupported_statement(number, text))?;
        lines.push(Line { number, statement });
    }
    Ok(Program { lines })
}

/// Parse one trimmed line
pub fn parse_statement(text: &str) -> Option<Statement> {
    let mut cursor = Cursor::new(text);
    let statement = cursor.statement()?;
    cursor.finish()?;
    Some(statement)
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Option<()> {
        self.eat(expected).then_some(())
    }

    fn at_word(&self, word: &str) -> bool {
        let len = word.chars().count();
        let matches = word
            .chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c));
        matches && !self.peek_at(len).is_some_and(is_ident_char)
    }

    /// Consume `keyword` when it is followed by whitespace
    fn keyword(&mut self, keyword: &str) -> bool {
        let len = keyword.chars().count();
        if self.at_word(keyword) && self.peek_at(len).is_some_and(char::is_whitespace) {
            self.pos += len;
            self.skip_ws();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Option<String> {
        let first = self.peek()?;
        if !is_ident_start(first) {
            return None;
        }
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    /// Trailing `;`, then optionally a `//` comment, then end of line
    fn finish(&mut self) -> Option<()> {
        self.skip_ws();
        self.eat(';');
        self.skip_ws();
        match self.peek() {
            None => Some(()),
            Some('/') if self.peek_at(1) == Some('/') => Some(()),
            Some(_) => None,
        }
    }

    fn statement(&mut self) -> Option<Statement> {
        self.skip_ws();

        if self.at_word("console") {
            return self.console();
        }

        let awaited = self.keyword("await");
        if self.at_word("api") {
            return self.api_call();
        }
        if awaited {
            return None;
        }

        self.assignment()
    }

    fn console(&mut self) -> Option<Statement> {
        self.ident()?;
        self.expect('.')?;
        let level = ConsoleLevel::parse(&self.ident()?)?;
        let args = self.call_args()?;
        Some(Statement::Console { level, args })
    }

    fn api_call(&mut self) -> Option<Statement> {
        self.ident()?;
        self.expect('.')?;
        let namespace = self.ident()?;
        self.expect('.')?;
        let method = self.ident()?;
        let args = self.call_args()?;
        Some(Statement::ApiCall {
            namespace,
            method,
            args,
        })
    }

    fn assignment(&mut self) -> Option<Statement> {
        for keyword in ["let", "const", "var"] {
            if self.keyword(keyword) {
                break;
            }
        }

        let name = self.ident()?;
        if RESERVED.contains(&name.as_str()) {
            return None;
        }

        self.skip_ws();
        self.expect('=')?;
        if self.peek() == Some('=') {
            return None;
        }
        self.skip_ws();

        let value = self.value(true)?;
        Some(Statement::Assign { name, value })
    }

    fn call_args(&mut self) -> Option<Vec<Expr>> {
        self.skip_ws();
        self.expect('(')?;
        let mut args = Vec::new();
        self.skip_ws();
        if self.eat(')') {
            return Some(args);
        }
        loop {
            self.skip_ws();
            args.push(self.value(true)?);
            self.skip_ws();
            if self.eat(')') {
                return Some(args);
            }
            self.expect(',')?;
        }
    }

    /// Parse a value; arrays and objects only when `allow_nested`
    fn value(&mut self, allow_nested: bool) -> Option<Expr> {
        match self.peek()? {
            '"' | '\'' => self.string().map(|s| Expr::Literal(Value::String(s))),
            '[' if allow_nested => self.array(),
            '{' if allow_nested => self.object(),
            c if c == '-' || c.is_ascii_digit() => self.number().map(Expr::Literal),
            c if is_ident_start(c) => self.word(),
            _ => None,
        }
    }

    fn word(&mut self) -> Option<Expr> {
        let word = self.ident()?;
        let expr = match word.as_str() {
            "true" => Expr::Literal(Value::Bool(true)),
            "false" => Expr::Literal(Value::Bool(false)),
            "null" | "undefined" => Expr::Literal(Value::Null),
            "config" => {
                if self.eat('.') {
                    Expr::Config(Some(self.ident()?))
                } else {
                    Expr::Config(None)
                }
            }
            _ => Expr::Ident(word),
        };
        // Member access, calls and operators are outside the grammar
        if matches!(self.peek(), Some('.') | Some('(') | Some('[')) {
            return None;
        }
        Some(expr)
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                c if c == quote => return Some(out),
                '\\' => {
                    let escaped = match self.bump()? {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        '\\' => '\\',
                        '"' => '"',
                        '\'' => '\'',
                        'x' => {
                            let hi = self.bump()?.to_digit(16)?;
                            let lo = self.bump()?.to_digit(16)?;
                            char::from_u32(hi * 16 + lo)?
                        }
                        _ => return None,
                    };
                    out.push(escaped);
                }
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        self.eat('-');
        let digits_start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return None;
        }
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.pos += 1;
            }
            let exp_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.pos == exp_start {
                return None;
            }
        }
        if self.peek().is_some_and(is_ident_char) {
            return None;
        }

        let text: String = self.chars[start..self.pos].iter().collect();
        if !is_float {
            if let Ok(n) = text.parse::<i64>() {
                return Some(Value::Number(n.into()));
            }
        }
        let n: f64 = text.parse().ok()?;
        Number::from_f64(n).map(Value::Number)
    }

    fn array(&mut self) -> Option<Expr> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(']') {
                return Some(Expr::Array(items));
            }
            items.push(self.value(false)?);
            self.skip_ws();
            if self.eat(']') {
                return Some(Expr::Array(items));
            }
            self.expect(',')?;
        }
    }

    fn object(&mut self) -> Option<Expr> {
        self.expect('{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.eat('}') {
                return Some(Expr::Object(entries));
            }
            let key = match self.peek()? {
                '"' | '\'' => self.string()?,
                _ => self.ident()?,
            };
            self.skip_ws();
            self.expect(':')?;
            self.skip_ws();
            let value = self.value(false)?;
            entries.push((key, value));
            self.skip_ws();
            if self.eat('}') {
                return Some(Expr::Object(entries));
            }
            self.expect(',')?;
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}
