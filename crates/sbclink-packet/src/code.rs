//! Parsed G/M/T-codes and the line parser that produces them.
//!
//! A [`Code`] is a plain record: the letter and numbers, a flat parameter
//! list, and bookkeeping (source channel, file position, correlation id).
//! Conditional keywords (`if`, `echo`, `set`, ...) are carried as meta codes
//! with their raw text preserved, since the firmware evaluates them itself.

use serde::{Deserialize, Serialize};

use crate::channel::CodeChannel;

/// Keywords that make a line a meta command rather than a lettered code.
const META_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "break", "continue", "abort", "echo", "var", "set", "global",
];

/// A single code parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Int(i32),
    Uint(u32),
    Float(f32),
    Str(String),
    /// An unevaluated `{...}` expression, braces stripped.
    Expression(String),
}

/// A lettered parameter, e.g. `X10.5` or `P"file.g"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeParameter {
    pub letter: char,
    pub value: ParameterValue,
}

impl CodeParameter {
    pub fn new(letter: char, value: ParameterValue) -> Self {
        Self { letter, value }
    }
}

/// A parsed G/M/T-code bound to its source channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub channel: CodeChannel,
    /// `G`, `M` or `T`; `None` for meta commands.
    pub letter: Option<char>,
    pub major: Option<i32>,
    pub minor: Option<i32>,
    pub parameters: Vec<CodeParameter>,
    /// Original text, comments stripped. Encoded verbatim for meta commands.
    pub raw: String,
    /// Byte offset within the source file, when read from one.
    pub file_position: Option<u32>,
    pub line_number: Option<i32>,
    /// True when any parameter is an unevaluated expression.
    pub has_expressions: bool,
    /// True when the code was enqueued by a macro frame.
    pub from_macro: bool,
    /// Correlation id assigned by the channel; 0 until handed down.
    #[serde(default)]
    pub id: u16,
}

impl Code {
    /// Look up a parameter by letter.
    pub fn parameter(&self, letter: char) -> Option<&ParameterValue> {
        self.parameters
            .iter()
            .find(|p| p.letter.eq_ignore_ascii_case(&letter))
            .map(|p| &p.value)
    }

    /// True for meta commands (`if`, `echo`, ...).
    pub fn is_meta(&self) -> bool {
        self.letter.is_none()
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Errors produced by [`parse`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodeParseError {
    #[error("empty code line")]
    Empty,

    #[error("invalid code number in {0:?}")]
    BadNumber(String),

    #[error("unterminated string literal in {0:?}")]
    UnterminatedString(String),

    #[error("unbalanced expression braces in {0:?}")]
    UnbalancedBraces(String),
}

/// Parse one line of G-code for the given channel.
///
/// Strips `;` and parenthesised comments, honours an `N` line number, quoted
/// strings with doubled-quote escaping, and `{...}` expression parameters.
pub fn parse(line: &str, channel: CodeChannel) -> Result<Code, CodeParseError> {
    let stripped = strip_comments(line);
    let text = stripped.trim();
    if text.is_empty() {
        return Err(CodeParseError::Empty);
    }

    let mut code = Code {
        channel,
        letter: None,
        major: None,
        minor: None,
        parameters: Vec::new(),
        raw: text.to_owned(),
        file_position: None,
        line_number: None,
        has_expressions: false,
        from_macro: false,
        id: 0,
    };

    // Meta commands keep their raw text; the firmware interprets them.
    let first_word = text.split_whitespace().next().unwrap_or("");
    if META_KEYWORDS.contains(&first_word) {
        code.has_expressions = true;
        return Ok(code);
    }

    let mut chars = Cursor::new(text);
    chars.skip_whitespace();

    // Optional N line number.
    if let Some(c) = chars.peek() {
        if c.eq_ignore_ascii_case(&'N') {
            let mark = chars.pos;
            chars.next();
            match chars.take_number(text)? {
                Some((n, None)) => {
                    code.line_number = Some(n);
                    chars.skip_whitespace();
                }
                _ => chars.pos = mark,
            }
        }
    }

    // The code word itself: G/M/T plus major(.minor).
    match chars.peek() {
        Some(c) if matches!(c.to_ascii_uppercase(), 'G' | 'M' | 'T') => {
            code.letter = Some(c.to_ascii_uppercase());
            chars.next();
            if let Some((major, minor)) = chars.take_number(text)? {
                code.major = Some(major);
                code.minor = minor;
            } else if code.letter != Some('T') {
                // A bare G or M with no number is not a code word.
                return Err(CodeParseError::BadNumber(text.to_owned()));
            }
        }
        _ => {
            // Not a lettered code and not a known keyword: treat as meta so
            // the firmware can reject it with a proper message.
            code.has_expressions = text.contains('{');
            return Ok(code);
        }
    }

    // Parameters until end of line.
    loop {
        chars.skip_whitespace();
        let letter = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => c.to_ascii_uppercase(),
            Some(_) => return Err(CodeParseError::BadNumber(text.to_owned())),
            None => break,
        };

        chars.skip_whitespace();
        let value = match chars.peek() {
            Some('"') => ParameterValue::Str(chars.take_string(text)?),
            Some('{') => {
                code.has_expressions = true;
                ParameterValue::Expression(chars.take_expression(text)?)
            }
            _ => {
                let token = chars.take_token();
                parse_bare_value(&token)
            }
        };
        code.parameters.push(CodeParameter::new(letter, value));
    }

    Ok(code)
}

fn parse_bare_value(token: &str) -> ParameterValue {
    if token.is_empty() {
        return ParameterValue::Uint(0);
    }
    if let Ok(i) = token.parse::<i32>() {
        return ParameterValue::Int(i);
    }
    if let Ok(u) = token.parse::<u32>() {
        return ParameterValue::Uint(u);
    }
    if let Ok(f) = token.parse::<f32>() {
        return ParameterValue::Float(f);
    }
    ParameterValue::Str(token.to_owned())
}

fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_string = false;
    let mut in_parens = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_parens {
            if c == ')' {
                in_parens = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ';' if !in_string => break,
            '(' if !in_string => in_parens = true,
            _ => out.push(c),
        }
    }
    out
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

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    /// Read `major(.minor)`. Returns `None` when no digits follow.
    fn take_number(&mut self, line: &str) -> Result<Option<(i32, Option<i32>)>, CodeParseError> {
        let negative = self.peek() == Some('-');
        if negative {
            self.next();
        }

        let major = self.take_digits();
        if major.is_empty() {
            if negative {
                return Err(CodeParseError::BadNumber(line.to_owned()));
            }
            return Ok(None);
        }
        let mut major: i32 = major
            .parse()
            .map_err(|_| CodeParseError::BadNumber(line.to_owned()))?;
        if negative {
            major = -major;
        }

        let minor = if self.peek() == Some('.') {
            self.next();
            let digits = self.take_digits();
            if digits.is_empty() {
                return Err(CodeParseError::BadNumber(line.to_owned()));
            }
            Some(
                digits
                    .parse()
                    .map_err(|_| CodeParseError::BadNumber(line.to_owned()))?,
            )
        } else {
            None
        };

        Ok(Some((major, minor)))
    }

    fn take_digits(&mut self) -> String {
        let mut out = String::new();
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            out.push(self.next().unwrap_or_default());
        }
        out
    }

    /// Read a quoted string; `""` escapes a quote.
    fn take_string(&mut self, line: &str) -> Result<String, CodeParseError> {
        self.next(); // opening quote
        let mut out = String::new();
        loop {
            match self.next() {
                Some('"') => {
                    if self.peek() == Some('"') {
                        self.next();
                        out.push('"');
                    } else {
                        return Ok(out);
                    }
                }
                Some(c) => out.push(c),
                None => return Err(CodeParseError::UnterminatedString(line.to_owned())),
            }
        }
    }

    /// Read a `{...}` expression with balanced braces, braces stripped.
    fn take_expression(&mut self, line: &str) -> Result<String, CodeParseError> {
        self.next(); // opening brace
        let mut depth = 1usize;
        let mut out = String::new();
        loop {
            match self.next() {
                Some('{') => {
                    depth += 1;
                    out.push('{');
                }
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                    out.push('}');
                }
                Some(c) => out.push(c),
                None => return Err(CodeParseError::UnbalancedBraces(line.to_owned())),
            }
        }
    }

    fn take_token(&mut self) -> String {
        let mut out = String::new();
        while matches!(self.peek(), Some(c) if !c.is_whitespace()) {
            out.push(self.next().unwrap_or_default());
        }
        out
    }
}
