// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Parse and print the s-expressions spoken on the editor pipe.
// Author: Lukas Bower

//! Minimal s-expression reader and printer.
//!
//! The editor pipe speaks one expression per line: lists of atoms,
//! integers, floats and double-quoted strings. Strings support the
//! backslash escapes `\\ \" \n \t \r` plus three-digit octal escapes for
//! arbitrary bytes.

use std::fmt::Write as _;

use anyhow::{bail, Result};

/// One parsed s-expression value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Bare symbol.
    Atom(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// Double-quoted string, unescaped.
    Str(String),
    /// Parenthesized list.
    List(Vec<Value>),
}

impl Value {
    /// Borrow as an atom name.
    #[must_use]
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Value::Atom(name) => Some(name),
            _ => None,
        }
    }

    /// Borrow as a string payload.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Integer coercion; floats truncate.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    /// Float coercion.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Parse one expression; trailing input is an error.
pub fn parse(input: &str) -> Result<Value> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    parser.skip_space();
    let value = parser.value()?;
    parser.skip_space();
    if parser.pos != parser.bytes.len() {
        bail!("trailing bytes after expression: {input:?}");
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_space(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n')) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek() {
            None => bail!("unexpected end of expression"),
            Some(b'(') => self.list(),
            Some(b'"') => self.string(),
            Some(b'-') | Some(b'0'..=b'9') => self.number(),
            Some(_) => self.atom(),
        }
    }

    fn list(&mut self) -> Result<Value> {
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_space();
            match self.peek() {
                None => bail!("unterminated list"),
                Some(b')') => {
                    self.bump();
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.value()?),
            }
        }
    }

    fn string(&mut self) -> Result<Value> {
        self.bump();
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None => bail!("unterminated string"),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    None => bail!("unterminated escape"),
                    Some(b'\\') => bytes.push(b'\\'),
                    Some(b'"') => bytes.push(b'"'),
                    Some(b'n') => bytes.push(b'\n'),
                    Some(b't') => bytes.push(b'\t'),
                    Some(b'r') => bytes.push(b'\r'),
                    Some(first @ b'0'..=b'7') => {
                        let mut code = u32::from(first - b'0');
                        for _ in 0..2 {
                            match self.bump() {
                                Some(digit @ b'0'..=b'7') => {
                                    code = code * 8 + u32::from(digit - b'0');
                                }
                                _ => bail!("bad octal escape"),
                            }
                        }
                        if code > 0xFF {
                            bail!("octal escape out of range");
                        }
                        bytes.push(code as u8);
                    }
                    Some(other) => bail!("unknown escape \\{}", other as char),
                },
                Some(byte) => bytes.push(byte),
            }
        }
        match String::from_utf8(bytes) {
            Ok(text) => Ok(Value::Str(text)),
            Err(_) => bail!("string is not valid utf8"),
        }
    }

    fn number(&mut self) -> Result<Value> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.bump();
        }
        let mut float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => {
                    self.bump();
                }
                b'.' if !float => {
                    float = true;
                    self.bump();
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).expect("ascii digits");
        if float {
            Ok(Value::Float(text.parse()?))
        } else {
            Ok(Value::Int(text.parse()?))
        }
    }

    fn atom(&mut self) -> Result<Value> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || b == b'(' || b == b')' || b == b'"' {
                break;
            }
            self.bump();
        }
        if start == self.pos {
            bail!("empty atom");
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])?;
        Ok(Value::Atom(text.to_owned()))
    }
}

/// Append a quoted, escaped string literal to `out`.
pub fn write_string(out: &mut String, bytes: &[u8]) {
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7E => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{:03o}", b);
            }
        }
    }
    out.push('"');
}
