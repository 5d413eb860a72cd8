//! Aggregates vendor-agnostic chunk deltas into a running structured
//! output, a reasoning transcript and finalised tool calls (spec §4.1
//! "StreamingContext").

use std::collections::BTreeMap;

use serde_json::Value;

use super::json_stream_parser::JsonStreamParser;
use crate::domain::{ContentPart, LlmUsage};
use crate::provider::ParsedChunk;

enum OutputStreamer {
    /// `output_schema` is present: incrementally parsed into `(keypath,
    /// value)` updates merged onto a running object.
    Structured { parser: JsonStreamParser, merged: Value },
    Raw(String),
}

#[derive(Debug, Default, Clone)]
struct ToolCallBuffer {
    id: Option<String>,
    tool_name: Option<String>,
    arguments: String,
}

impl ToolCallBuffer {
    /// A tool call is only surfaced once id, name and JSON-parsable
    /// arguments are all present (spec §4.1).
    fn finalized(&self) -> Option<ContentPart> {
        let id = self.id.clone()?;
        let tool_name = self.tool_name.clone()?;
        let input = serde_json::from_str(&self.arguments).ok()?;

        Some(ContentPart::ToolCallRequest { id, tool_name, input, index: None })
    }
}

/// Accumulates one streaming completion's state as chunks arrive.
pub struct StreamingContext {
    output: OutputStreamer,
    reasoning: String,
    tool_calls: BTreeMap<u32, ToolCallBuffer>,
    usage: Option<LlmUsage>,
    finish_reason: Option<String>,
}

impl StreamingContext {
    pub fn new(has_output_schema: bool) -> Self {
        Self {
            output: if has_output_schema {
                OutputStreamer::Structured { parser: JsonStreamParser::new(), merged: Value::Object(Default::default()) }
            } else {
                OutputStreamer::Raw(String::new())
            },
            reasoning: String::new(),
            tool_calls: BTreeMap::new(),
            usage: None,
            finish_reason: None,
        }
    }

    /// Fold one adapter chunk into the running state, returning the set of
    /// `(keypath, value)` updates produced by this chunk (empty for raw/
    /// non-structured output).
    pub fn ingest(&mut self, chunk: ParsedChunk) -> Vec<(String, Value)> {
        let mut updates = Vec::new();

        if let Some(text) = chunk.delta_text {
            match &mut self.output {
                OutputStreamer::Structured { parser, merged } => {
                    for (keypath, value) in parser.feed(&text) {
                        set_keypath(merged, &keypath, value.clone());
                        updates.push((keypath, value));
                    }
                }
                OutputStreamer::Raw(buffer) => buffer.push_str(&text),
            }
        }

        if let Some(delta) = chunk.reasoning_delta {
            self.reasoning.push_str(&delta);
        }

        for delta in chunk.tool_call_deltas {
            let Some(index) = delta.index else { continue };
            let entry = self.tool_calls.entry(index).or_default();

            if let Some(id) = delta.id {
                entry.id = Some(id);
            }
            if let Some(name) = delta.tool_name {
                entry.tool_name = Some(name);
            }
            if let Some(fragment) = delta.arguments_fragment {
                entry.arguments.push_str(&fragment);
            }
        }

        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }

        updates
    }

    /// Tool calls that have id, name and parseable arguments as of right
    /// now, in ascending stream-index order.
    pub fn finalized_tool_calls(&self) -> Vec<ContentPart> {
        self.tool_calls.values().filter_map(ToolCallBuffer::finalized).collect()
    }

    pub fn raw_text(&self) -> Option<&str> {
        match &self.output {
            OutputStreamer::Raw(text) => Some(text),
            OutputStreamer::Structured { .. } => None,
        }
    }

    pub fn structured_output(&self) -> Option<&Value> {
        match &self.output {
            OutputStreamer::Structured { merged, .. } => Some(merged),
            OutputStreamer::Raw(_) => None,
        }
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn usage(&self) -> Option<&LlmUsage> {
        self.usage.as_ref()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }
}

/// Apply one dotted keypath update onto a running `Value::Object`,
/// creating intermediate objects/arrays as needed.
fn set_keypath(root: &mut Value, keypath: &str, value: Value) {
    if keypath.is_empty() {
        *root = value;
        return;
    }

    let mut cursor = root;
    let segments: Vec<&str> = keypath.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        let is_last = i == segments.len() - 1;
        let is_index = segment.parse::<usize>().is_ok();

        if is_index {
            let idx: usize = segment.parse().unwrap();
            if !cursor.is_array() {
                *cursor = Value::Array(vec![]);
            }
            let arr = cursor.as_array_mut().unwrap();
            while arr.len() <= idx {
                arr.push(Value::Null);
            }
            if is_last {
                arr[idx] = value;
                return;
            }
            cursor = &mut arr[idx];
        } else {
            if !cursor.is_object() {
                *cursor = Value::Object(Default::default());
            }
            let obj = cursor.as_object_mut().unwrap();
            if is_last {
                obj.insert(segment.to_string(), value);
                return;
            }
            cursor = obj.entry(segment.to_string()).or_insert(Value::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> ParsedChunk {
        ParsedChunk { delta_text: Some(text.to_string()), ..Default::default() }
    }

    #[test]
    fn raw_mode_accumulates_plain_text() {
        let mut ctx = StreamingContext::new(false);
        ctx.ingest(chunk("hello "));
        ctx.ingest(chunk("world"));
        assert_eq!(ctx.raw_text(), Some("hello world"));
    }

    #[test]
    fn structured_mode_merges_keypaths_into_a_running_object() {
        let mut ctx = StreamingContext::new(true);
        ctx.ingest(chunk(r#"{"name": "#));
        ctx.ingest(chunk(r#""Ada"}"#));

        assert_eq!(ctx.structured_output().unwrap()["name"], "Ada");
    }

    #[test]
    fn tool_call_is_finalized_only_once_arguments_parse() {
        let mut ctx = StreamingContext::new(false);
        ctx.ingest(ParsedChunk {
            tool_call_deltas: vec![crate::provider::ToolCallDelta {
                id: Some("call_1".into()),
                index: Some(0),
                tool_name: Some("search".into()),
                arguments_fragment: Some("{\"q\":".into()),
            }],
            ..Default::default()
        });
        assert!(ctx.finalized_tool_calls().is_empty());

        ctx.ingest(ParsedChunk {
            tool_call_deltas: vec![crate::provider::ToolCallDelta {
                id: None,
                index: Some(0),
                tool_name: None,
                arguments_fragment: Some("\"rust\"}".into()),
            }],
            ..Default::default()
        });
        assert_eq!(ctx.finalized_tool_calls().len(), 1);
    }
}
