//! Lenient incremental JSON parser for streamed tool input.
//!
//! Tool-use input arrives as arbitrary string fragments and may be cut off
//! anywhere. [`PartialJsonParser`] consumes characters as they come and
//! [`PartialJsonParser::finish`] closes whatever is still open:
//!
//! - an unterminated string is closed; a dangling escape is dropped
//! - open arrays and objects are closed innermost first
//! - an object key without a value is dropped
//! - trailing commas are ignored
//! - a partial number is trimmed to its longest valid prefix (`12.` is `12`)
//! - a partial `true`, `false` or `null` is completed
//! - anything after a complete top-level value is ignored
//! - an unexpected character stops parsing; what was recovered so far is kept
//!
//! The parser never panics and never returns an error.

use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectState {
    KeyOrEnd,
    Colon,
    Value,
    CommaOrEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayState {
    ValueOrEnd,
    CommaOrEnd,
}

#[derive(Debug)]
enum Frame {
    Object {
        map: Map<String, Value>,
        key: Option<String>,
        state: ObjectState,
    },
    Array {
        items: Vec<Value>,
        state: ArrayState,
    },
}

impl Frame {
    fn into_value(self) -> Value {
        match self {
            Frame::Object { map, .. } => Value::Object(map),
            Frame::Array { items, .. } => Value::Array(items),
        }
    }
}

#[derive(Debug)]
enum Escape {
    None,
    Backslash,
    Unicode(String),
}

#[derive(Debug)]
enum Token {
    None,
    Str {
        buf: String,
        escape: Escape,
        /// High half of a UTF-16 surrogate pair waiting for its low half.
        high: Option<u16>,
        is_key: bool,
    },
    Number(String),
    Literal(String),
}

/// Character-at-a-time JSON parser that recovers truncated documents.
#[derive(Debug)]
pub struct PartialJsonParser {
    stack: Vec<Frame>,
    token: Token,
    root: Option<Value>,
    halted: bool,
}

impl Default for PartialJsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialJsonParser {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            token: Token::None,
            root: None,
            halted: false,
        }
    }

    /// Consume the next fragment of input.
    pub fn feed(&mut self, fragment: &str) {
        for ch in fragment.chars() {
            if self.halted {
                return;
            }
            self.step(ch);
        }
    }

    /// True once a complete top-level value has been read.
    pub fn is_complete(&self) -> bool {
        self.root.is_some()
    }

    /// Close everything still open and return the recovered value, if any.
    pub fn finish(mut self) -> Option<Value> {
        match std::mem::replace(&mut self.token, Token::None) {
            Token::None => {}
            Token::Str { buf, is_key, .. } => {
                if !is_key {
                    self.emit(Value::String(buf));
                }
            }
            Token::Number(buf) => {
                if let Some(n) = parse_number_prefix(&buf) {
                    self.emit(Value::Number(n));
                }
            }
            Token::Literal(buf) => {
                if let Some(v) = complete_literal(&buf, true) {
                    self.emit(v);
                }
            }
        }
        while let Some(frame) = self.stack.pop() {
            let value = frame.into_value();
            self.emit(value);
        }
        self.root
    }

    fn step(&mut self, ch: char) {
        if matches!(self.token, Token::Str { .. }) {
            self.step_string(ch);
            return;
        }

        let consumed = match &mut self.token {
            Token::Number(buf) if is_number_char(ch) => {
                buf.push(ch);
                true
            }
            Token::Literal(buf) if ch.is_ascii_alphabetic() => {
                buf.push(ch);
                true
            }
            _ => false,
        };
        if consumed {
            return;
        }

        if !matches!(self.token, Token::None) {
            self.finish_scalar();
            if self.halted {
                return;
            }
        }
        self.step_structural(ch);
    }

    fn step_structural(&mut self, ch: char) {
        match ch {
            c if c.is_whitespace() => {}
            '{' => {
                if self.begin_value() {
                    self.stack.push(Frame::Object {
                        map: Map::new(),
                        key: None,
                        state: ObjectState::KeyOrEnd,
                    });
                }
            }
            '[' => {
                if self.begin_value() {
                    self.stack.push(Frame::Array {
                        items: Vec::new(),
                        state: ArrayState::ValueOrEnd,
                    });
                }
            }
            '"' => {
                let is_key = matches!(
                    self.stack.last(),
                    Some(Frame::Object {
                        state: ObjectState::KeyOrEnd,
                        ..
                    })
                );
                if is_key || self.begin_value() {
                    self.token = Token::Str {
                        buf: String::new(),
                        escape: Escape::None,
                        high: None,
                        is_key,
                    };
                }
            }
            '}' => match self.stack.last() {
                Some(Frame::Object { .. }) => self.close_container(),
                _ => self.halted = true,
            },
            ']' => match self.stack.last() {
                Some(Frame::Array { .. }) => self.close_container(),
                _ => self.halted = true,
            },
            ':' => match self.stack.last_mut() {
                Some(Frame::Object { state, .. }) if *state == ObjectState::Colon => {
                    *state = ObjectState::Value;
                }
                _ => self.halted = true,
            },
            ',' => match self.stack.last_mut() {
                Some(Frame::Object { state, .. }) if *state == ObjectState::CommaOrEnd => {
                    *state = ObjectState::KeyOrEnd;
                }
                Some(Frame::Array { state, .. }) if *state == ArrayState::CommaOrEnd => {
                    *state = ArrayState::ValueOrEnd;
                }
                _ => self.halted = true,
            },
            '-' | '0'..='9' => {
                if self.begin_value() {
                    self.token = Token::Number(ch.to_string());
                }
            }
            't' | 'f' | 'n' => {
                if self.begin_value() {
                    self.token = Token::Literal(ch.to_string());
                }
            }
            _ => self.halted = true,
        }
    }

    fn step_string(&mut self, ch: char) {
        let Token::Str {
            buf, escape, high, ..
        } = &mut self.token
        else {
            return;
        };

        let mut close = false;
        let mut reprocess = false;
        match escape {
            Escape::None => match ch {
                '"' => close = true,
                '\\' => *escape = Escape::Backslash,
                c => {
                    flush_surrogate(buf, high);
                    buf.push(c);
                }
            },
            Escape::Backslash => {
                let decoded = match ch {
                    'n' => Some('\n'),
                    't' => Some('\t'),
                    'r' => Some('\r'),
                    'b' => Some('\u{8}'),
                    'f' => Some('\u{c}'),
                    'u' => None,
                    other => Some(other),
                };
                match decoded {
                    Some(c) => {
                        flush_surrogate(buf, high);
                        buf.push(c);
                        *escape = Escape::None;
                    }
                    None => *escape = Escape::Unicode(String::new()),
                }
            }
            Escape::Unicode(hex) => {
                if ch.is_ascii_hexdigit() {
                    hex.push(ch);
                    if hex.len() == 4 {
                        let unit = u16::from_str_radix(hex, 16).unwrap_or(0xFFFD);
                        push_code_unit(buf, high, unit);
                        *escape = Escape::None;
                    }
                } else {
                    // Malformed \u escape: drop it and read `ch` as plain input.
                    *escape = Escape::None;
                    reprocess = true;
                }
            }
        }

        if close {
            self.close_string();
        } else if reprocess {
            self.step_string(ch);
        }
    }

    fn close_string(&mut self) {
        if let Token::Str {
            mut buf,
            mut high,
            is_key,
            ..
        } = std::mem::replace(&mut self.token, Token::None)
        {
            flush_surrogate(&mut buf, &mut high);
            if is_key {
                if let Some(Frame::Object { key, state, .. }) = self.stack.last_mut() {
                    *key = Some(buf);
                    *state = ObjectState::Colon;
                }
            } else {
                self.emit(Value::String(buf));
            }
        }
    }

    /// A number or literal was terminated by a delimiter.
    fn finish_scalar(&mut self) {
        let value = match std::mem::replace(&mut self.token, Token::None) {
            Token::Number(buf) => parse_number_prefix(&buf).map(Value::Number),
            Token::Literal(buf) => complete_literal(&buf, false),
            _ => return,
        };
        match value {
            Some(v) => self.emit(v),
            None => self.halted = true,
        }
    }

    /// Check that the current position accepts a value.
    fn begin_value(&mut self) -> bool {
        let ok = match self.stack.last() {
            None => self.root.is_none(),
            Some(Frame::Object { state, .. }) => *state == ObjectState::Value,
            Some(Frame::Array { state, .. }) => *state == ArrayState::ValueOrEnd,
        };
        if !ok {
            self.halted = true;
        }
        ok
    }

    fn close_container(&mut self) {
        if let Some(frame) = self.stack.pop() {
            let value = frame.into_value();
            self.emit(value);
        }
    }

    fn emit(&mut self, value: Value) {
        match self.stack.last_mut() {
            None => {
                self.root = Some(value);
                self.halted = true;
            }
            Some(Frame::Object { map, key, state }) => {
                if let Some(k) = key.take() {
                    map.insert(k, value);
                }
                *state = ObjectState::CommaOrEnd;
            }
            Some(Frame::Array { items, state }) => {
                items.push(value);
                *state = ArrayState::CommaOrEnd;
            }
        }
    }
}

fn is_number_char(ch: char) -> bool {
    ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E')
}

fn parse_number_prefix(buf: &str) -> Option<Number> {
    let mut s = buf;
    loop {
        if s.is_empty() {
            return None;
        }
        if let Ok(n) = serde_json::from_str::<Number>(s) {
            return Some(n);
        }
        match s.strip_suffix(['.', 'e', 'E', '+', '-']) {
            Some(shorter) => s = shorter,
            None => return None,
        }
    }
}

fn complete_literal(buf: &str, at_eof: bool) -> Option<Value> {
    [
        ("true", Value::Bool(true)),
        ("false", Value::Bool(false)),
        ("null", Value::Null),
    ]
    .into_iter()
    .find(|(word, _)| *word == buf || (at_eof && word.starts_with(buf)))
    .map(|(_, value)| value)
}

fn flush_surrogate(buf: &mut String, high: &mut Option<u16>) {
    if high.take().is_some() {
        buf.push(char::REPLACEMENT_CHARACTER);
    }
}

fn push_code_unit(buf: &mut String, high: &mut Option<u16>, unit: u16) {
    match unit {
        0xD800..=0xDBFF => {
            flush_surrogate(buf, high);
            *high = Some(unit);
        }
        0xDC00..=0xDFFF => match high.take() {
            Some(h) => {
                let code = 0x10000 + ((u32::from(h) - 0xD800) << 10) + (u32::from(unit) - 0xDC00);
                buf.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            None => buf.push(char::REPLACEMENT_CHARACTER),
        },
        _ => {
            flush_surrogate(buf, high);
            buf.push(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
    }
}

/// Parse a possibly truncated JSON document.
pub fn parse_partial(input: &str) -> Option<Value> {
    let mut parser = PartialJsonParser::new();
    parser.feed(input);
    parser.finish()
}

/// Parse accumulated tool input. Nothing recoverable yields an empty object.
pub fn parse_tool_input(input: &str) -> Value {
    parse_partial(input).unwrap_or_else(|| Value::Object(Map::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_document() {
        let v = parse_partial(r#"{"query": "federal register", "limit": 5, "exact": false}"#);
        assert_eq!(
            v,
            Some(json!({"query": "federal register", "limit": 5, "exact": false}))
        );
    }

    #[test]
    fn test_fragments_across_feeds() {
        let mut parser = PartialJsonParser::new();
        parser.feed(r#"{"query":"fed"#);
        assert!(!parser.is_complete());
        parser.feed(r#"eral register"}"#);
        assert!(parser.is_complete());
        assert_eq!(parser.finish(), Some(json!({"query": "federal register"})));
    }

    #[test]
    fn test_unterminated_string() {
        assert_eq!(parse_partial(r#"{"query":"fed"#), Some(json!({"query": "fed"})));
    }

    #[test]
    fn test_nested_containers_closed() {
        assert_eq!(
            parse_partial(r#"{"a":[1,2,{"b":"c"#),
            Some(json!({"a": [1, 2, {"b": "c"}]}))
        );
    }

    #[test]
    fn test_dangling_key_dropped() {
        assert_eq!(parse_partial(r#"{"a":1,"b"#), Some(json!({"a": 1})));
        assert_eq!(parse_partial(r#"{"a":1,"b":"#), Some(json!({"a": 1})));
        assert_eq!(parse_partial(r#"{"a":1,"b" "#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_trailing_comma() {
        assert_eq!(parse_partial("[1,2,"), Some(json!([1, 2])));
        assert_eq!(parse_partial(r#"{"a":1,}"#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_partial_numbers() {
        assert_eq!(parse_partial(r#"{"n":12."#), Some(json!({"n": 12})));
        assert_eq!(parse_partial(r#"{"n":1.5e"#), Some(json!({"n": 1.5})));
        assert_eq!(parse_partial(r#"{"n":-"#), Some(json!({})));
    }

    #[test]
    fn test_partial_literals() {
        assert_eq!(parse_partial(r#"{"ok":tr"#), Some(json!({"ok": true})));
        assert_eq!(parse_partial("[nu"), Some(json!([null])));
        assert_eq!(parse_partial("[fals"), Some(json!([false])));
    }

    #[test]
    fn test_escapes() {
        assert_eq!(
            parse_partial(r#""line\nbreak é \"q\"""#),
            Some(json!("line\nbreak é \"q\""))
        );
        assert_eq!(parse_partial(r#""\ud83d\ude00""#), Some(json!("\u{1F600}")));
        assert_eq!(parse_partial(r#""\u00e9t\u00e9""#), Some(json!("\u{e9}t\u{e9}")));
    }

    #[test]
    fn test_dangling_escape_dropped() {
        assert_eq!(parse_partial(r#"{"s":"abc\"#), Some(json!({"s": "abc"})));
        assert_eq!(parse_partial(r#"{"s":"abc\u00"#), Some(json!({"s": "abc"})));
    }

    #[test]
    fn test_trailing_text_ignored() {
        assert_eq!(parse_partial(r#"{"a":1} and more"#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_unexpected_character_keeps_prefix() {
        assert_eq!(parse_partial(r#"{"a":1,"b":@}"#), Some(json!({"a": 1})));
        assert_eq!(parse_partial("[1,,2]"), Some(json!([1])));
    }

    #[test]
    fn test_nothing_recoverable() {
        assert_eq!(parse_partial(""), None);
        assert_eq!(parse_partial("   "), None);
        assert_eq!(parse_partial("not json"), None);
        assert_eq!(parse_tool_input(""), json!({}));
        assert_eq!(parse_tool_input("garbage"), json!({}));
    }

    #[test]
    fn test_every_prefix_is_safe() {
        let doc = r#"{"query":"café é","filters":{"year":[2020,2021],"draft":false},"n":-1.25e3}"#;
        for end in 0..=doc.len() {
            if doc.is_char_boundary(end) {
                let _ = parse_partial(&doc[..end]);
            }
        }
        assert_eq!(
            parse_partial(doc),
            Some(json!({
                "query": "café é",
                "filters": {"year": [2020, 2021], "draft": false},
                "n": -1250.0
            }))
        );
    }
}
