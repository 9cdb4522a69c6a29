//! Chat-completion stream post-processing: splits
//! `reasoning_content` out of `content` for "think" models and synthesizes
//! an empty tool-call argument chunk for any tool call whose arguments
//! never arrived before the stream finished.
use std::collections::BTreeMap;

use regex_lite::Regex;
use serde_json::Value;

/// One decoded item pulled off a chat completion SSE stream.
#[derive(Debug, Clone)]
pub enum ChatStreamItem {
    /// A frame that wasn't a `data:` line, passed through verbatim.
    Raw(String),
    /// The terminal `[DONE]` marker.
    Done,
    /// A parsed chunk, `delta` already reasoning/content split.
    Chunk(Value),
    /// The final chunk, carrying `usage`.
    Usage(Value),
    /// A `data:` frame that failed JSON parsing.
    Error { raw: String, message: String },
}

trait DeltaTransform {
    fn apply(&mut self, delta: &mut Value);
}

struct PassthroughTransform;

impl DeltaTransform for PassthroughTransform {
    fn apply(&mut self, _delta: &mut Value) {}
}

/// Moves streamed text into `reasoning_content` until a `</think>` marker
/// (or an explicit `reasoning_content` field) signals the model has moved
/// past its preamble.
struct ThinkTransform {
    thinking: bool,
    has_parsed: bool,
}

impl Default for ThinkTransform {
    fn default() -> Self {
        Self {
            thinking: true,
            has_parsed: false,
        }
    }
}

impl DeltaTransform for ThinkTransform {
    fn apply(&mut self, delta: &mut Value) {
        let content = delta.get("content").and_then(Value::as_str).map(str::to_string);
        let reasoning_content = delta
            .get("reasoning_content")
            .and_then(Value::as_str)
            .map(str::to_string);

        if !self.has_parsed && reasoning_content.is_some() {
            self.has_parsed = true;
        }

        let mut content = content;
        if self.thinking {
            if let Some(c) = &content {
                if !self.has_parsed && c.contains("</think>") {
                    content = Some(c.replace("</think>", ""));
                    self.thinking = false;
                }
            }
            if self.has_parsed {
                self.thinking = false;
            }
        }

        if self.thinking {
            let reasoning = reasoning_content.or_else(|| content.clone());
            delta["reasoning_content"] = reasoning.map_or(Value::Null, Value::String);
            delta["content"] = Value::Null;
        } else {
            delta["reasoning_content"] = Value::Null;
            delta["content"] = content.map_or(Value::Null, Value::String);
        }
    }
}

/// Buffers raw SSE text, splitting on blank-line frame boundaries, and
/// turns each `data:` frame into a [`ChatStreamItem`].
pub struct ChatStreamParser {
    buffer: String,
    transform: Box<dyn DeltaTransform + Send>,
    is_finish: bool,
    tool_arg: BTreeMap<i64, String>,
    pub reasoning_content: String,
    pub content: String,
}

impl ChatStreamParser {
    fn new(transform: Box<dyn DeltaTransform + Send>) -> Self {
        Self {
            buffer: String::new(),
            transform,
            is_finish: false,
            tool_arg: BTreeMap::new(),
            reasoning_content: String::new(),
            content: String::new(),
        }
    }

    /// Feed raw text and return any complete frames parsed out of it.
    pub fn feed(&mut self, chunk: &str) -> Vec<ChatStreamItem> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(index) = self.buffer.find("\n\n") {
            let part = self.buffer[..index].trim().to_string();
            self.buffer.drain(..index + 2);
            if part.is_empty() {
                continue;
            }
            self.process_frame(&part, &mut out);
        }
        out
    }

    /// Flush a dangling, unterminated trailing frame as an error item, the
    /// way the original reports a stream that ended mid-frame.
    pub fn finish(&mut self) -> Option<ChatStreamItem> {
        if self.buffer.trim().is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        Some(ChatStreamItem::Error {
            message: "stream ended with an incomplete frame".to_string(),
            raw,
        })
    }

    fn process_frame(&mut self, part: &str, out: &mut Vec<ChatStreamItem>) {
        let Some(rest) = part.strip_prefix("data:") else {
            out.push(ChatStreamItem::Raw(part.to_string()));
            return;
        };
        let data = rest.trim();
        if data == "[DONE]" {
            out.push(ChatStreamItem::Done);
            return;
        }

        let mut parsed: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(err) => {
                out.push(ChatStreamItem::Error {
                    raw: part.to_string(),
                    message: err.to_string(),
                });
                return;
            }
        };

        if let Some(choices) = parsed.get_mut("choices").and_then(Value::as_array_mut) {
            for choice in choices.iter_mut() {
                let finished = choice
                    .get("finish_reason")
                    .is_some_and(|v| !v.is_null() && v.as_str() != Some(""));
                if finished {
                    self.is_finish = true;
                }

                let Some(delta) = choice.get_mut("delta") else {
                    continue;
                };
                self.transform.apply(delta);

                if let Some(s) = delta.get("reasoning_content").and_then(Value::as_str) {
                    self.reasoning_content.push_str(s);
                }
                if let Some(s) = delta.get("content").and_then(Value::as_str) {
                    self.content.push_str(s);
                }

                if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    for tool_call in tool_calls {
                        let Some(function) = tool_call.get("function") else {
                            continue;
                        };
                        let Some(index) = tool_call.get("index").and_then(Value::as_i64) else {
                            continue;
                        };
                        let args = function.get("arguments").and_then(Value::as_str).unwrap_or("");
                        self.tool_arg.entry(index).or_default().push_str(args);
                    }
                }
            }
        }

        if self.is_finish {
            for (&index, argument) in &mut self.tool_arg {
                if !argument.is_empty() {
                    continue;
                }
                *argument = " {}".to_string();
                let mut trunk = serde_json::json!({});
                for key in ["id", "object", "created", "model"] {
                    if let Some(v) = parsed.get(key) {
                        trunk[key] = v.clone();
                    }
                }
                trunk["choices"] = serde_json::json!([{
                    "index": 0,
                    "delta": {
                        "content": Value::Null,
                        "reasoning_content": Value::Null,
                        "tool_calls": [{"id": "", "index": index, "function": {"arguments": " {}"}}],
                    },
                    "finish_reason": Value::Null,
                }]);
                out.push(ChatStreamItem::Chunk(trunk));
            }
        }

        let has_usage = parsed.get("usage").is_some_and(|v| !v.is_null());
        if self.is_finish && has_usage {
            out.push(ChatStreamItem::Usage(parsed));
        } else {
            out.push(ChatStreamItem::Chunk(parsed));
        }
    }
}

/// Whether `model_name` matches any of the configured think-model patterns
/// (anchored full-string regexes, spec S4.6).
#[must_use]
pub fn model_is_think(model_name: &str, think_model_patterns: &[String]) -> bool {
    think_model_patterns.iter().any(|pattern| {
        Regex::new(&format!("^{pattern}$"))
            .map(|re| re.is_match(model_name))
            .unwrap_or(false)
    })
}

/// Select a stream parser for `model_name`: think-splitting if it matches a
/// configured pattern, otherwise a no-op passthrough.
#[must_use]
pub fn get_parser(model_name: &str, think_model_patterns: &[String]) -> ChatStreamParser {
    if model_is_think(model_name, think_model_patterns) {
        ChatStreamParser::new(Box::new(ThinkTransform::default()))
    } else {
        ChatStreamParser::new(Box::new(PassthroughTransform))
    }
}

/// Post-hoc think-split for a non-streaming chat response: everything
/// before the first `</think>` becomes `reasoning_content`, the rest
/// becomes `content`. A response with no marker is returned as `content`
/// unchanged.
#[must_use]
pub fn split_think_content(raw_content: &str) -> (Option<String>, String) {
    const MARKER: &str = "</think>";
    match raw_content.find(MARKER) {
        Some(idx) => {
            let reasoning = raw_content[..idx].to_string();
            let rest = raw_content[idx + MARKER.len()..].trim_start().to_string();
            (Some(reasoning), rest)
        }
        None => (None, raw_content.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_json(item: &ChatStreamItem) -> &Value {
        match item {
            ChatStreamItem::Chunk(v) | ChatStreamItem::Usage(v) => v,
            other => panic!("expected a Chunk or Usage item, got {other:?}"),
        }
    }

    #[test]
    fn passthrough_parser_leaves_deltas_untouched() {
        let mut parser = get_parser("gpt-4", &[]);
        let items = parser.feed("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n\n");
        assert_eq!(items.len(), 1);
        let delta = &chunk_json(&items[0])["choices"][0]["delta"];
        assert_eq!(delta["content"], "hi");
        assert!(delta.get("reasoning_content").is_none());
    }

    #[test]
    fn think_parser_splits_reasoning_until_marker() {
        let patterns = vec!["deepseek-.*".to_string()];
        assert!(model_is_think("deepseek-r1", &patterns));
        let mut parser = get_parser("deepseek-r1", &patterns);

        let first =
            parser.feed("data: {\"choices\":[{\"delta\":{\"content\":\"pondering\"},\"finish_reason\":null}]}\n\n");
        let delta = &chunk_json(&first[0])["choices"][0]["delta"];
        assert_eq!(delta["reasoning_content"], "pondering");
        assert!(delta["content"].is_null());

        let second = parser.feed(
            "data: {\"choices\":[{\"delta\":{\"content\":\"</think>answer\"},\"finish_reason\":null}]}\n\n",
        );
        let delta = &chunk_json(&second[0])["choices"][0]["delta"];
        assert!(delta["reasoning_content"].is_null());
        assert_eq!(delta["content"], "answer");

        let third =
            parser.feed("data: {\"choices\":[{\"delta\":{\"content\":\" more\"},\"finish_reason\":null}]}\n\n");
        let delta = &chunk_json(&third[0])["choices"][0]["delta"];
        assert_eq!(delta["content"], " more");
        assert_eq!(parser.reasoning_content, "pondering");
        assert_eq!(parser.content, "answer more");
    }

    #[test]
    fn think_parser_switches_early_on_explicit_reasoning_field() {
        let mut parser = get_parser("r1-x", &["r1-.*".to_string()]);
        parser.feed(
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"because\"},\"finish_reason\":null}]}\n\n",
        );
        let items = parser.feed("data: {\"choices\":[{\"delta\":{\"content\":\"done\"},\"finish_reason\":\"stop\"}]}\n\n");
        let delta = &chunk_json(&items[0])["choices"][0]["delta"];
        assert_eq!(delta["content"], "done");
        assert!(delta["reasoning_content"].is_null());
    }

    #[test]
    fn done_and_raw_frames_pass_through() {
        let mut parser = get_parser("gpt-4", &[]);
        let items = parser.feed(": keep-alive\n\ndata: [DONE]\n\n");
        assert!(matches!(items[0], ChatStreamItem::Raw(_)));
        assert!(matches!(items[1], ChatStreamItem::Done));
    }

    #[test]
    fn tool_call_arguments_accumulate_and_empty_calls_synthesize_at_finish() {
        let mut parser = get_parser("gpt-4", &[]);
        parser.feed(
            "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"a\\\":\"}}]},\"finish_reason\":null}]}\n\n",
        );
        parser.feed(
            "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"1}\"}},{\"index\":1,\"function\":{\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n\n",
        );
        let last = parser.feed(
            "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        );
        assert_eq!(parser.tool_arg.get(&0).unwrap(), "{\"a\":1}");
        // index 1 never received arguments; a synthesized empty-args chunk
        // should appear once the stream finishes.
        let synthesized = last
            .iter()
            .find_map(|item| match item {
                ChatStreamItem::Chunk(v) if v["choices"][0]["delta"]["tool_calls"].is_array() => Some(v),
                _ => None,
            })
            .expect("expected a synthesized empty tool-call chunk");
        assert_eq!(
            synthesized["choices"][0]["delta"]["tool_calls"][0]["index"],
            1
        );
        assert_eq!(
            synthesized["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            " {}"
        );
    }

    #[test]
    fn usage_chunk_classified_separately_from_content_chunks() {
        let mut parser = get_parser("gpt-4", &[]);
        let items = parser.feed(
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"total_tokens\":10}}\n\n",
        );
        assert!(matches!(items.last(), Some(ChatStreamItem::Usage(_))));
    }

    #[test]
    fn split_think_content_separates_reasoning_from_answer() {
        let (reasoning, content) = split_think_content("first I think</think>then I answer");
        assert_eq!(reasoning.as_deref(), Some("first I think"));
        assert_eq!(content, "then I answer");

        let (reasoning, content) = split_think_content("no marker here");
        assert!(reasoning.is_none());
        assert_eq!(content, "no marker here");
    }
}
