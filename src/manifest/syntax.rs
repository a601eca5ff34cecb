// Copyright 2023 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Manifest syntax abstraction.
//!
//! Manifests come in two syntaxes: JSON and a libconfig-style nested map.
//! Both parse into a `serde_json::Value` tree; the accessor set the section
//! walker needs is shared through default trait methods, so the two
//! implementations differ only in `parse`.  The syntax is selected from the
//! first non-whitespace byte of the document.

use anyhow::{anyhow, Result};
use serde_json::{Map, Number, Value};

use crate::errors::UpdateError;

pub trait Syntax {
    fn parse(&self, text: &str) -> Result<Value>;

    fn get_child<'a>(&self, node: &'a Value, name: &str) -> Option<&'a Value> {
        node.get(name)
    }

    fn array_len(&self, node: &Value) -> usize {
        node.as_array().map_or(0, |a| a.len())
    }

    fn elem_at<'a>(&self, node: &'a Value, idx: usize) -> Option<&'a Value> {
        node.as_array()?.get(idx)
    }

    /// Scalar field rendered as a string; `name == None` reads the node
    /// itself.
    fn field_string(&self, node: &Value, name: Option<&str>) -> Option<String> {
        let v = match name {
            Some(n) => node.get(n)?,
            None => node,
        };
        match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn field_bool(&self, node: &Value, name: Option<&str>) -> Option<bool> {
        let v = match name {
            Some(n) => node.get(n)?,
            None => node,
        };
        match v {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_i64() != Some(0)),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn field_u64(&self, node: &Value, name: Option<&str>) -> Option<u64> {
        let v = match name {
            Some(n) => node.get(n)?,
            None => node,
        };
        match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn exist_field(&self, node: &Value, name: &str) -> bool {
        node.get(name).is_some()
    }

    /// Entries of a mapping node, in document order.
    fn object_entries<'a>(&self, node: &'a Value) -> Vec<(&'a str, &'a Value)> {
        match node {
            Value::Object(map) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            _ => Vec::new(),
        }
    }

    /// Walk a mapping node's scalar entries in document order.
    fn iterate_mapping(&self, node: &Value, f: &mut dyn FnMut(&str, &str)) {
        if let Value::Object(map) = node {
            for (name, value) in map {
                if let Some(s) = self.field_string(value, None) {
                    f(name, &s);
                }
            }
        }
    }

    /// Descend from `root` along `path`, one child per segment.
    fn find_root<'a>(&self, root: &'a Value, path: &[String]) -> Option<&'a Value> {
        let mut node = root;
        for segment in path {
            node = self.get_child(node, segment)?;
        }
        Some(node)
    }
}

pub struct JsonSyntax;

impl Syntax for JsonSyntax {
    fn parse(&self, text: &str) -> Result<Value> {
        serde_json::from_str(text)
            .map_err(|e| anyhow!(UpdateError::ManifestSyntax(format!("JSON: {e}"))))
    }
}

pub struct LibconfigSyntax;

impl Syntax for LibconfigSyntax {
    fn parse(&self, text: &str) -> Result<Value> {
        let mut lexer = Lexer::new(text);
        let root = parse_settings(&mut lexer, true)?;
        Ok(root)
    }
}

/// Pick the syntax from the first non-whitespace byte: `{` means JSON,
/// anything else the libconfig form.
pub fn syntax_for(text: &str) -> Box<dyn Syntax> {
    match text.trim_start().as_bytes().first() {
        Some(b'{') => Box::new(JsonSyntax),
        _ => Box::new(LibconfigSyntax),
    }
}

// ---- libconfig-style recursive descent ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Punct(char),
    Eof,
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            input: text.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn syntax_err(&self, msg: &str) -> anyhow::Error {
        anyhow!(UpdateError::ManifestSyntax(format!(
            "line {}: {msg}",
            self.line
        )))
    }

    fn peek_byte(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_noise(&mut self) -> Result<()> {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(b) = self.bump() {
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                Some(b'/') => match self.input.get(self.pos + 1) {
                    Some(b'/') => {
                        while let Some(b) = self.bump() {
                            if b == b'\n' {
                                break;
                            }
                        }
                    }
                    Some(b'*') => {
                        self.bump();
                        self.bump();
                        loop {
                            match self.bump() {
                                Some(b'*') if self.peek_byte() == Some(b'/') => {
                                    self.bump();
                                    break;
                                }
                                Some(_) => {}
                                None => return Err(self.syntax_err("unterminated comment")),
                            }
                        }
                    }
                    _ => return Err(self.syntax_err("unexpected '/'")),
                },
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self) -> Result<String> {
        // opening quote already consumed
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    // leave unknown escapes alone; regexes use them
                    Some(other) => {
                        out.push('\\');
                        out.push(other as char);
                    }
                    None => return Err(self.syntax_err("unterminated string")),
                },
                Some(b) => out.push(b as char),
                None => return Err(self.syntax_err("unterminated string")),
            }
        }
        Ok(out)
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_noise()?;
        let b = match self.bump() {
            Some(b) => b,
            None => return Ok(Token::Eof),
        };
        match b {
            b'{' | b'}' | b'(' | b')' | b'[' | b']' | b'=' | b':' | b';' | b',' => {
                Ok(Token::Punct(b as char))
            }
            b'"' => {
                let mut s = self.string()?;
                // adjacent string literals concatenate
                loop {
                    self.skip_noise()?;
                    if self.peek_byte() == Some(b'"') {
                        self.bump();
                        s.push_str(&self.string()?);
                    } else {
                        break;
                    }
                }
                Ok(Token::Str(s))
            }
            b if b.is_ascii_digit() || b == b'-' || b == b'+' || b == b'.' => {
                let start = self.pos - 1;
                while let Some(c) = self.peek_byte() {
                    if c.is_ascii_alphanumeric() || c == b'.' || c == b'+' || c == b'-' {
                        self.bump();
                    } else {
                        break;
                    }
                }
                let text = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| self.syntax_err("non-ASCII number"))?;
                let trimmed = text.trim_end_matches(|c| c == 'L' || c == 'l');
                if let Some(hexpart) = trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                {
                    let n = i64::from_str_radix(hexpart, 16)
                        .map_err(|_| self.syntax_err("bad hex literal"))?;
                    return Ok(Token::Int(n));
                }
                if let Ok(n) = trimmed.parse::<i64>() {
                    Ok(Token::Int(n))
                } else if let Ok(f) = trimmed.parse::<f64>() {
                    Ok(Token::Float(f))
                } else {
                    Err(self.syntax_err(&format!("bad numeric literal '{text}'")))
                }
            }
            b if b.is_ascii_alphabetic() || b == b'_' || b == b'*' => {
                let start = self.pos - 1;
                while let Some(c) = self.peek_byte() {
                    if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'*' {
                        self.bump();
                    } else {
                        break;
                    }
                }
                let word = std::str::from_utf8(&self.input[start..self.pos]).unwrap();
                match word {
                    "true" | "TRUE" | "True" => Ok(Token::Bool(true)),
                    "false" | "FALSE" | "False" => Ok(Token::Bool(false)),
                    _ => Ok(Token::Name(word.to_string())),
                }
            }
            other => Err(self.syntax_err(&format!("unexpected character '{}'", other as char))),
        }
    }

    fn peek_token(&mut self) -> Result<Token> {
        let save = (self.pos, self.line);
        let token = self.next_token();
        (self.pos, self.line) = save;
        token
    }
}

/// `settings ::= (NAME (= | :) value (; | ,)?)*`
fn parse_settings(lexer: &mut Lexer, top_level: bool) -> Result<Value> {
    let mut map = Map::new();
    loop {
        match lexer.next_token()? {
            Token::Eof if top_level => return Ok(Value::Object(map)),
            Token::Punct('}') if !top_level => return Ok(Value::Object(map)),
            Token::Name(name) => {
                match lexer.next_token()? {
                    Token::Punct('=') | Token::Punct(':') => {}
                    _ => return Err(lexer.syntax_err(&format!("expected '=' after '{name}'"))),
                }
                let value = parse_value(lexer)?;
                map.insert(name, value);
                // optional terminator
                if let Token::Punct(';') | Token::Punct(',') = lexer.peek_token()? {
                    lexer.next_token()?;
                }
            }
            other => {
                return Err(lexer.syntax_err(&format!("expected setting name, got {other:?}")))
            }
        }
    }
}

fn parse_value(lexer: &mut Lexer) -> Result<Value> {
    match lexer.next_token()? {
        Token::Punct('{') => parse_settings(lexer, false),
        Token::Punct('(') => parse_elements(lexer, ')'),
        Token::Punct('[') => parse_elements(lexer, ']'),
        Token::Str(s) => Ok(Value::String(s)),
        Token::Int(n) => Ok(Value::Number(n.into())),
        Token::Float(f) => Ok(Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Token::Bool(b) => Ok(Value::Bool(b)),
        other => Err(lexer.syntax_err(&format!("expected value, got {other:?}"))),
    }
}

fn parse_elements(lexer: &mut Lexer, close: char) -> Result<Value> {
    let mut items = Vec::new();
    loop {
        match lexer.peek_token()? {
            Token::Punct(c) if c == close => {
                lexer.next_token()?;
                return Ok(Value::Array(items));
            }
            Token::Punct(',') => {
                lexer.next_token()?;
            }
            Token::Eof => return Err(lexer.syntax_err("unterminated list")),
            _ => items.push(parse_value(lexer)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_syntax() {
        let json = "  {\"version\": \"1.0\"}";
        let root = syntax_for(json).parse(json).unwrap();
        assert_eq!(root["version"], "1.0");

        let cfg = "software = { version = \"1.0\"; };";
        let root = syntax_for(cfg).parse(cfg).unwrap();
        assert_eq!(root["software"]["version"], "1.0");
    }

    #[test]
    fn parses_libconfig_shapes() {
        let text = r##"
            /* header comment */
            software =
            {
                version = "0.1.0";
                reboot = false;
                count = 0x10;   # hex
                ratio = 1.5;
                hardware-compatibility: [ "1.0", "#RE:^2\.[0-9]+" ];
                images: (
                    {
                        filename = "rootfs" ".img";  // concatenated
                        device = "/dev/mmcblk0p2";
                        offset = 1024L;
                    }
                );
            };
        "##;
        let root = LibconfigSyntax.parse(text).unwrap();
        let sw = &root["software"];
        assert_eq!(sw["version"], "0.1.0");
        assert_eq!(sw["reboot"], false);
        assert_eq!(sw["count"], 16);
        assert_eq!(sw["ratio"], 1.5);
        assert_eq!(sw["hardware-compatibility"][1], "#RE:^2\\.[0-9]+");
        assert_eq!(sw["images"][0]["filename"], "rootfs.img");
        assert_eq!(sw["images"][0]["offset"], 1024);
    }

    #[test]
    fn accessor_coercions() {
        let s = JsonSyntax;
        let v: Value =
            serde_json::json!({"a": "true", "b": 1, "c": false, "n": "42", "m": 42});
        assert_eq!(s.field_bool(&v, Some("a")), Some(true));
        assert_eq!(s.field_bool(&v, Some("b")), Some(true));
        assert_eq!(s.field_bool(&v, Some("c")), Some(false));
        assert_eq!(s.field_u64(&v, Some("n")), Some(42));
        assert_eq!(s.field_u64(&v, Some("m")), Some(42));
        assert_eq!(s.field_string(&v, Some("m")), Some("42".into()));
        assert!(s.exist_field(&v, "a"));
        assert!(!s.exist_field(&v, "z"));
    }

    #[test]
    fn find_root_descends() {
        let s = JsonSyntax;
        let v: Value = serde_json::json!({"software": {"board": {"images": [1, 2]}}});
        let path: Vec<String> = ["software", "board", "images"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(s.array_len(s.find_root(&v, &path).unwrap()), 2);
        let bad: Vec<String> = vec!["software".into(), "nope".into()];
        assert!(s.find_root(&v, &bad).is_none());
    }

    #[test]
    fn syntax_errors_are_typed() {
        let err = LibconfigSyntax.parse("images = ( { broken ").unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::ManifestSyntax(_))
        }));
        let err = JsonSyntax.parse("{ not json").unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::ManifestSyntax(_))
        }));
    }
}
