//! Values returned by `eval`.
//!
//! The peer prints `repr(expr)`; this module parses that text back as a
//! Python literal. Only literal syntax is accepted: anything that would need
//! evaluation (names, calls other than `set()`, operators) is a parse error.

use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// A Python literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// Integer that fits in 64 bits.
    Int(i64),
    /// Float, including `inf` and `nan`.
    Float(f64),
    /// `str`
    Str(String),
    /// `bytes`
    Bytes(Vec<u8>),
    /// `list`
    List(Vec<Value>),
    /// `tuple`
    Tuple(Vec<Value>),
    /// `dict`, in printed order.
    Dict(Vec<(Value, Value)>),
    /// `set`, in printed order.
    Set(Vec<Value>),
}

impl Value {
    /// Parse the `repr` of a Python literal.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut parser = Parser { chars: text.char_indices().peekable(), text };
        let value = parser.value()?;
        parser.skip_ws();
        match parser.chars.peek() {
            None => Ok(value),
            Some(&(pos, _)) => Err(format!("trailing input at offset {pos}: {:?}", &text[pos..])),
        }
    }

    /// The string, if this is a `str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer, if this is an `int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    text: &'a str,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.chars.next_if(|&(_, c)| c.is_whitespace()).is_some() {}
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn offset(&mut self) -> usize {
        self.chars.peek().map_or(self.text.len(), |&(i, _)| i)
    }

    fn expect(&mut self, want: char) -> Result<(), String> {
        match self.chars.next() {
            Some((_, c)) if c == want => Ok(()),
            Some((i, c)) => Err(format!("expected {want:?} at offset {i}, found {c:?}")),
            None => Err(format!("expected {want:?}, found end of input")),
        }
    }

    fn value(&mut self) -> Result<Value, String> {
        self.skip_ws();
        match self.peek() {
            None => Err("unexpected end of input".to_string()),
            Some('[') => {
                self.chars.next();
                Ok(Value::List(self.sequence(']')?.0))
            }
            Some('(') => {
                self.chars.next();
                let (items, trailing_comma) = self.sequence(')')?;
                // `(x)` is just a parenthesised value.
                if items.len() == 1 && !trailing_comma {
                    Ok(items.into_iter().next().unwrap_or(Value::None))
                } else {
                    Ok(Value::Tuple(items))
                }
            }
            Some('{') => {
                self.chars.next();
                self.brace()
            }
            Some('\'' | '"') => Ok(Value::Str(self.string_body()?)),
            Some('b') if self.is_bytes_prefix() => {
                self.chars.next();
                Ok(Value::Bytes(self.bytes_body()?))
            }
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.word(),
            Some(c) => Err(format!("unexpected {c:?} at offset {}", self.offset())),
        }
    }

    fn is_bytes_prefix(&mut self) -> bool {
        let rest = &self.text[self.offset()..];
        rest.starts_with("b'") || rest.starts_with("b\"")
    }

    /// Comma-separated values up to `close`. Also reports a trailing comma.
    fn sequence(&mut self, close: char) -> Result<(Vec<Value>, bool), String> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.chars.next();
                return Ok((items, trailing_comma));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.chars.next() {
                Some((_, ',')) => trailing_comma = true,
                Some((_, c)) if c == close => return Ok((items, false)),
                Some((i, c)) => {
                    return Err(format!("expected ',' or {close:?} at offset {i}, found {c:?}"));
                }
                None => return Err(format!("unterminated sequence, expected {close:?}")),
            }
        }
    }

    /// `{}` is a dict; `{a, b}` a set; `{k: v}` a dict.
    fn brace(&mut self) -> Result<Value, String> {
        self.skip_ws();
        if self.peek() == Some('}') {
            self.chars.next();
            return Ok(Value::Dict(Vec::new()));
        }
        let first = self.value()?;
        self.skip_ws();
        if self.peek() == Some(':') {
            self.chars.next();
            let mut pairs = vec![(first, self.value()?)];
            loop {
                self.skip_ws();
                match self.chars.next() {
                    Some((_, '}')) => return Ok(Value::Dict(pairs)),
                    Some((_, ',')) => {
                        self.skip_ws();
                        if self.peek() == Some('}') {
                            self.chars.next();
                            return Ok(Value::Dict(pairs));
                        }
                        let key = self.value()?;
                        self.skip_ws();
                        self.expect(':')?;
                        pairs.push((key, self.value()?));
                    }
                    Some((i, c)) => {
                        return Err(format!("expected ',' or '}}' at offset {i}, found {c:?}"));
                    }
                    None => return Err("unterminated dict".to_string()),
                }
            }
        }
        let mut items = vec![first];
        match self.chars.next() {
            Some((_, '}')) => return Ok(Value::Set(items)),
            Some((_, ',')) => {}
            Some((i, c)) => return Err(format!("expected ',' or '}}' at offset {i}, found {c:?}")),
            None => return Err("unterminated set".to_string()),
        }
        items.extend(self.sequence('}')?.0);
        Ok(Value::Set(items))
    }

    fn word(&mut self) -> Result<Value, String> {
        let start = self.offset();
        while self.chars.next_if(|&(_, c)| c.is_ascii_alphanumeric() || c == '_').is_some() {}
        let end = self.offset();
        match &self.text[start..end] {
            "None" => Ok(Value::None),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            "inf" => Ok(Value::Float(f64::INFINITY)),
            "nan" => Ok(Value::Float(f64::NAN)),
            "set" => {
                self.expect('(')?;
                self.expect(')')?;
                Ok(Value::Set(Vec::new()))
            }
            other => Err(format!("not a literal: {other:?}")),
        }
    }

    fn number(&mut self) -> Result<Value, String> {
        let start = self.offset();
        let negative = self.chars.next_if(|&(_, c)| c == '-' || c == '+').map(|(_, c)| c == '-');
        if matches!(self.peek(), Some(c) if c.is_ascii_alphabetic()) {
            return match self.word()? {
                Value::Float(f) if negative == Some(true) => Ok(Value::Float(-f)),
                Value::Float(f) => Ok(Value::Float(f)),
                other => Err(format!("not a number: {other}")),
            };
        }
        let mut is_float = false;
        while let Some((_, c)) = self.chars.next_if(|&(_, c)| {
            c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '_') || c == '-' || c == '+'
        }) {
            if matches!(c, '.' | 'e' | 'E') {
                is_float = true;
            }
        }
        let end = self.offset();
        let literal: String = self.text[start..end].chars().filter(|&c| c != '_').collect();
        if is_float {
            literal
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| format!("invalid float {literal:?}: {e}"))
        } else {
            literal
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| format!("invalid integer {literal:?}: {e}"))
        }
    }

    fn quote(&mut self) -> Result<char, String> {
        match self.chars.next() {
            Some((_, q @ ('\'' | '"'))) => Ok(q),
            Some((i, c)) => Err(format!("expected quote at offset {i}, found {c:?}")),
            None => Err("expected quote, found end of input".to_string()),
        }
    }

    fn hex(&mut self, digits: usize) -> Result<u32, String> {
        let mut value = 0u32;
        for _ in 0..digits {
            let (i, c) = self.chars.next().ok_or("truncated escape")?;
            let d = c.to_digit(16).ok_or_else(|| format!("bad hex digit {c:?} at offset {i}"))?;
            value = value * 16 + d;
        }
        Ok(value)
    }

    fn string_body(&mut self) -> Result<String, String> {
        let quote = self.quote()?;
        let mut out = String::new();
        loop {
            let (_, c) = self.chars.next().ok_or("unterminated string")?;
            match c {
                c if c == quote => return Ok(out),
                '\\' => {
                    let (i, e) = self.chars.next().ok_or("unterminated escape")?;
                    let ch = match e {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        '0' => '\0',
                        '\\' | '\'' | '"' => e,
                        'x' => char::from_u32(self.hex(2)?).ok_or("bad \\x escape")?,
                        'u' => char::from_u32(self.hex(4)?).ok_or("bad \\u escape")?,
                        'U' => char::from_u32(self.hex(8)?).ok_or("bad \\U escape")?,
                        other => return Err(format!("unknown escape \\{other} at offset {i}")),
                    };
                    out.push(ch);
                }
                c => out.push(c),
            }
        }
    }

    fn bytes_body(&mut self) -> Result<Vec<u8>, String> {
        let quote = self.quote()?;
        let mut out = Vec::new();
        loop {
            let (i, c) = self.chars.next().ok_or("unterminated bytes")?;
            match c {
                c if c == quote => return Ok(out),
                '\\' => {
                    let (i, e) = self.chars.next().ok_or("unterminated escape")?;
                    let byte = match e {
                        'n' => b'\n',
                        'r' => b'\r',
                        't' => b'\t',
                        '0' => 0,
                        '\\' | '\'' | '"' => e as u8,
                        'x' => self.hex(2)? as u8,
                        other => return Err(format!("unknown escape \\{other} at offset {i}")),
                    };
                    out.push(byte);
                }
                c if c.is_ascii() => out.push(c as u8),
                c => return Err(format!("non-ASCII {c:?} in bytes literal at offset {i}")),
            }
        }
    }
}

// ============================================================================
// Display (Python repr)
// ============================================================================

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) if x.is_nan() => f.write_str("nan"),
            Self::Float(x) if x.is_infinite() => f.write_str(if *x > 0.0 { "inf" } else { "-inf" }),
            Self::Float(x) if x.fract() == 0.0 && x.abs() < 1e16 => write!(f, "{x:.1}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => {
                f.write_str("'")?;
                for c in s.chars() {
                    match c {
                        '\'' => f.write_str("\\'")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        c if c.is_control() => write!(f, "\\x{:02x}", u32::from(c))?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("'")
            }
            Self::Bytes(b) => {
                f.write_str("b'")?;
                for &byte in b {
                    match byte {
                        b'\'' => f.write_str("\\'")?,
                        b'\\' => f.write_str("\\\\")?,
                        b'\n' => f.write_str("\\n")?,
                        b'\r' => f.write_str("\\r")?,
                        b'\t' => f.write_str("\\t")?,
                        0x20..=0x7e => write!(f, "{}", byte as char)?,
                        other => write!(f, "\\x{other:02x}")?,
                    }
                }
                f.write_str("'")
            }
            Self::List(items) => {
                f.write_str("[")?;
                write_seq(f, items)?;
                f.write_str("]")
            }
            Self::Tuple(items) => {
                f.write_str("(")?;
                write_seq(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::Set(items) if items.is_empty() => f.write_str("set()"),
            Self::Set(items) => {
                f.write_str("{")?;
                write_seq(f, items)?;
                f.write_str("}")
            }
            Self::Dict(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

// ============================================================================
// JSON output
// ============================================================================

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::None => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(x) => serializer.serialize_f64(*x),
            Self::Str(s) => serializer.serialize_str(s),
            Self::Bytes(b) => {
                let mut seq = serializer.serialize_seq(Some(b.len()))?;
                for byte in b {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            Self::List(items) | Self::Tuple(items) | Self::Set(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Dict(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    // JSON keys must be strings; other keys use their repr.
                    match k {
                        Self::Str(s) => map.serialize_entry(s, v)?,
                        other => map.serialize_entry(&other.to_string(), v)?,
                    }
                }
                map.end()
            }
        }
    }
}
