//! A tolerant, incremental JSON parser for streaming structured output.
//!
//! Unlike `serde_json::StreamDeserializer`, which expects each fed chunk to
//! contain a complete value, this consumes raw text fragments as they
//! arrive from an SSE delta and emits `(dotted.keypath, value)` pairs the
//! moment each leaf is fully read, tolerating the occasional malformed byte
//! a model emits mid-stream rather than aborting the whole parse.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Object,
    Array,
}

/// One open container on the parse stack.
#[derive(Debug, Clone)]
struct Frame {
    kind: ContainerKind,
    /// Object: true once the next string read should be treated as a key
    /// rather than a value. Array: unused.
    expecting_key: bool,
    /// Array: the index of the next value to be read.
    index: usize,
    /// The dotted path up to and including this container.
    path: String,
    /// The key this container was opened under in its parent object, or
    /// `None` for an array element or the document root. Recorded at open
    /// time because by the time the container closes, `current_key` has
    /// long since moved on to this container's own children.
    key_in_parent: Option<String>,
    /// Every completed child value so far (key present for object
    /// entries, `None` for array elements), used to materialize this
    /// container's own value when it closes.
    children: Vec<(Option<String>, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Waiting for a value, a key string, or a container open/close.
    Idle,
    InString,
    InLiteral,
}

/// Incremental parser state. Feed raw text via [`JsonStreamParser::feed`];
/// each call returns every `(keypath, value)` pair completed by that chunk,
/// in order.
pub struct JsonStreamParser {
    stack: Vec<Frame>,
    mode: Mode,
    /// Set once a string just closed inside an object and is waiting to be
    /// paired with `:` and a value.
    current_key: Option<String>,
    buffer: String,
    in_escape: bool,
    unicode_escape: String,
    pending_surrogate: Option<u16>,
    /// True once the current string being read is a key, not a value (only
    /// meaningful while `mode == InString`).
    reading_key: bool,
    done: bool,
}

impl Default for JsonStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonStreamParser {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            mode: Mode::Idle,
            current_key: None,
            buffer: String::new(),
            in_escape: false,
            unicode_escape: String::new(),
            pending_surrogate: None,
            reading_key: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one raw chunk; returns every leaf completed while consuming it.
    pub fn feed(&mut self, chunk: &str) -> Vec<(String, Value)> {
        let mut emitted = Vec::new();

        for ch in chunk.chars() {
            if self.done {
                break;
            }
            self.feed_char(ch, &mut emitted);
        }

        emitted
    }

    fn feed_char(&mut self, ch: char, emitted: &mut Vec<(String, Value)>) {
        match self.mode {
            Mode::InString => self.feed_string_char(ch, emitted),
            Mode::InLiteral => self.feed_literal_char(ch, emitted),
            Mode::Idle => self.feed_idle_char(ch, emitted),
        }
    }

    /// Whether the parser is currently positioned to read an object key
    /// rather than a value (top of stack is an object expecting one).
    fn at_key_position(&self) -> bool {
        matches!(self.stack.last(), Some(frame) if frame.kind == ContainerKind::Object && frame.expecting_key)
    }

    fn current_path(&self) -> String {
        self.stack.last().map(|f| f.path.clone()).unwrap_or_default()
    }

    fn child_path(&self, segment: &str) -> String {
        let base = self.current_path();
        if base.is_empty() { segment.to_string() } else { format!("{base}.{segment}") }
    }

    fn feed_idle_char(&mut self, ch: char, emitted: &mut Vec<(String, Value)>) {
        match ch {
            '{' => self.open_container(ContainerKind::Object),
            '[' => self.open_container(ContainerKind::Array),
            '}' => self.close_container(ContainerKind::Object, emitted),
            ']' => self.close_container(ContainerKind::Array, emitted),
            '"' => {
                self.reading_key = self.at_key_position();
                self.buffer.clear();
                self.in_escape = false;
                self.mode = Mode::InString;
            }
            ':' => {}
            ',' => self.advance_after_comma(),
            c if c.is_ascii_digit() || c == '-' || c == 't' || c == 'f' || c == 'n' => {
                self.buffer.clear();
                self.buffer.push(c);
                self.mode = Mode::InLiteral;
            }
            // Whitespace and any other stray byte between tokens is
            // ignored (spec: "unexpected characters outside strings are
            // ignored").
            _ => {}
        }
    }

    fn open_container(&mut self, kind: ContainerKind) {
        let key_in_parent = self.current_key.take();
        let path = match &key_in_parent {
            Some(key) => self.child_path(key),
            None if matches!(self.stack.last(), Some(f) if f.kind == ContainerKind::Array) => {
                let index = self.stack.last().unwrap().index;
                self.child_path(&index.to_string())
            }
            None => self.current_path(),
        };

        self.stack.push(Frame { kind, expecting_key: kind == ContainerKind::Object, index: 0, path, key_in_parent, children: Vec::new() });
    }

    /// Close `expected` and, regardless of whether it was empty, materialize
    /// its value from the children buffered while it was open and emit it
    /// (spec §8 property 6: a container's own `(path, value)` event follows
    /// its elements' events, never replacing them).
    fn close_container(&mut self, expected: ContainerKind, emitted: &mut Vec<(String, Value)>) {
        if self.mode == Mode::InLiteral {
            self.emit_literal(emitted);
        }

        let Some(frame) = self.stack.pop() else { return };

        if frame.kind == expected {
            let value = match expected {
                ContainerKind::Object => Value::Object(frame.children.into_iter().filter_map(|(key, value)| Some((key?, value))).collect()),
                ContainerKind::Array => Value::Array(frame.children.into_iter().map(|(_, value)| value).collect()),
            };

            emitted.push((frame.path, value.clone()));

            if let Some(parent) = self.stack.last_mut() {
                parent.children.push((frame.key_in_parent, value));
            }
        }

        self.advance_after_value();
    }

    fn advance_after_comma(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            match frame.kind {
                ContainerKind::Object => frame.expecting_key = true,
                ContainerKind::Array => frame.index += 1,
            }
        }
    }

    fn advance_after_value(&mut self) {
        if self.stack.is_empty() {
            self.done = true;
        }
    }

    fn feed_string_char(&mut self, ch: char, emitted: &mut Vec<(String, Value)>) {
        if !self.unicode_escape.is_empty() {
            self.unicode_escape.push(ch);
            if self.unicode_escape.len() == 4 {
                self.apply_unicode_escape();
            }
            return;
        }

        if self.in_escape {
            self.in_escape = false;
            match ch {
                'n' => self.buffer.push('\n'),
                't' => self.buffer.push('\t'),
                'r' => self.buffer.push('\r'),
                '"' => self.buffer.push('"'),
                '\\' => self.buffer.push('\\'),
                '/' => self.buffer.push('/'),
                'b' => self.buffer.push('\u{8}'),
                'f' => self.buffer.push('\u{c}'),
                'u' => self.unicode_escape = String::new(),
                // Invalid escapes are preserved verbatim rather than
                // dropped (spec: "invalid escapes are preserved").
                other => {
                    self.buffer.push('\\');
                    self.buffer.push(other);
                }
            }
            return;
        }

        match ch {
            '\\' => self.in_escape = true,
            '"' => self.finish_string(emitted),
            c => self.buffer.push(c),
        }
    }

    fn apply_unicode_escape(&mut self) {
        let code = u16::from_str_radix(&self.unicode_escape, 16).unwrap_or(0xFFFD);
        self.unicode_escape.clear();

        if let Some(high) = self.pending_surrogate.take() {
            if (0xDC00..=0xDFFF).contains(&code) {
                let combined = 0x10000 + (((high as u32) - 0xD800) << 10) + ((code as u32) - 0xDC00);
                if let Some(c) = char::from_u32(combined) {
                    self.buffer.push(c);
                    return;
                }
            }
            self.buffer.push('\u{FFFD}');
        }

        if (0xD800..=0xDBFF).contains(&code) {
            self.pending_surrogate = Some(code);
        } else if let Some(c) = char::from_u32(code as u32) {
            self.buffer.push(c);
        } else {
            self.buffer.push('\u{FFFD}');
        }
    }

    fn finish_string(&mut self, emitted: &mut Vec<(String, Value)>) {
        self.mode = Mode::Idle;

        if self.reading_key {
            self.current_key = Some(self.buffer.clone());
            if let Some(frame) = self.stack.last_mut() {
                frame.expecting_key = false;
            }
            return;
        }

        let value = Value::String(self.buffer.clone());
        let (path, key) = self.leaf_path_and_key();
        emitted.push((path, value.clone()));
        if let Some(parent) = self.stack.last_mut() {
            parent.children.push((key, value));
        }
        self.advance_after_value();
    }

    /// The dotted path for the value currently being read, plus the key it
    /// was read under in its parent object (`None` for an array element or
    /// the document root), for recording into the parent's `children`.
    fn leaf_path_and_key(&mut self) -> (String, Option<String>) {
        if let Some(key) = self.current_key.take() {
            let path = self.child_path(&key);
            return (path, Some(key));
        }

        if let Some(frame) = self.stack.last() {
            if frame.kind == ContainerKind::Array {
                let index = frame.index;
                return (self.child_path(&index.to_string()), None);
            }
        }

        (self.current_path(), None)
    }

    fn feed_literal_char(&mut self, ch: char, emitted: &mut Vec<(String, Value)>) {
        if ch.is_ascii_digit() || ch == '.' || ch == '-' || ch == '+' || ch == 'e' || ch == 'E' || ch.is_ascii_alphabetic() {
            self.buffer.push(ch);
            return;
        }

        self.emit_literal(emitted);
        self.mode = Mode::Idle;
        self.feed_idle_char(ch, emitted);
    }

    fn emit_literal(&mut self, emitted: &mut Vec<(String, Value)>) {
        let value = match self.buffer.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            n => serde_json::from_str::<serde_json::Number>(n).map(Value::Number).unwrap_or(Value::Null),
        };

        self.mode = Mode::Idle;
        let (path, key) = self.leaf_path_and_key();
        emitted.push((path, value.clone()));
        if let Some(parent) = self.stack.last_mut() {
            parent.children.push((key, value));
        }
        self.advance_after_value();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(json: &str) -> Vec<(String, Value)> {
        let mut parser = JsonStreamParser::new();
        parser.feed(json)
    }

    #[test]
    fn emits_leaves_in_order() {
        let events = parse_all(r#"{"a": 1, "b": "two"}"#);
        assert_eq!(events[0], ("a".to_string(), Value::Number(1.into())));
        assert_eq!(events[1], ("b".to_string(), Value::String("two".to_string())));
    }

    #[test]
    fn nested_object_paths_are_dotted() {
        let events = parse_all(r#"{"a": {"b": 1}}"#);
        assert_eq!(events[0], ("a.b".to_string(), Value::Number(1.into())));
    }

    #[test]
    fn array_elements_use_numeric_index_segments() {
        let events = parse_all(r#"{"items": [1, 2]}"#);
        assert_eq!(events[0], ("items.0".to_string(), Value::Number(1.into())));
        assert_eq!(events[1], ("items.1".to_string(), Value::Number(2.into())));
    }

    #[test]
    fn reassembles_surrogate_pair_unicode_escape() {
        let events = parse_all(r#"{"emoji": "😀"}"#);
        assert_eq!(events[0].1, Value::String("\u{1F600}".to_string()));
    }

    #[test]
    fn empty_array_emits_empty_value() {
        let events = parse_all(r#"{"items": []}"#);
        assert_eq!(events[0], ("items".to_string(), Value::Array(vec![])));
    }

    #[test]
    fn empty_object_emits_empty_value() {
        let events = parse_all(r#"{"meta": {}}"#);
        assert_eq!(events[0], ("meta".to_string(), Value::Object(Default::default())));
    }

    #[test]
    fn tolerates_stray_characters_between_tokens() {
        let events = parse_all("{\"a\": 1 , \n\t \"b\": 2}");
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn closing_a_container_emits_its_materialized_value_after_its_elements() {
        let events = parse_all(r#"{"a":"hello","b":[1,2]}"#);
        assert_eq!(events[0], ("a".to_string(), Value::String("hello".to_string())));
        assert_eq!(events[1], ("b.0".to_string(), Value::Number(1.into())));
        assert_eq!(events[2], ("b.1".to_string(), Value::Number(2.into())));
        assert_eq!(events[3], ("b".to_string(), Value::Array(vec![Value::Number(1.into()), Value::Number(2.into())])));
    }

    #[test]
    fn incremental_feed_across_chunk_boundaries_matches_single_shot() {
        let whole = parse_all(r#"{"a": 1, "b": "hi"}"#);

        let mut parser = JsonStreamParser::new();
        let mut streamed = Vec::new();
        for chunk in [r#"{"a": "#, "1, \"b", r#"": "hi"}"#] {
            streamed.extend(parser.feed(chunk));
        }

        assert_eq!(streamed, whole);
    }

    #[test]
    fn reassembles_explicit_surrogate_pair_escape_sequence() {
        let events = parse_all("{\"emoji\": \"\\uD83D\\uDE00\"}");
        assert_eq!(events[0].1, Value::String("\u{1F600}".to_string()));
    }

    #[test]
    fn invalid_escape_is_preserved_literally() {
        let events = parse_all(r#"{"a": "x\qy"}"#);
        assert_eq!(events[0].1, Value::String("x\\qy".to_string()));
    }
}
