//! Server-sent event decoding for streamed conversation turns.
//!
//! The stream is a sequence of `data: {json}` lines. Delta events are
//! concatenated client-side; the terminal `chat.end` event carries the full
//! result object, including the session id.

use serde_json::Value;

use super::types::ContentBlock;

/// Incremental SSE decoder. Feed raw body chunks with [`push`](Self::push),
/// then call [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct SseAccumulator {
    pending: Vec<u8>,
    parts: Vec<String>,
    response_id: Option<String>,
    result: Option<Value>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(&line);
        }
    }

    /// Returns the session id and the output blocks of the streamed turn.
    pub fn finish(mut self) -> (Option<String>, Vec<ContentBlock>) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.handle_line(&line);
        }

        if self.parts.is_empty() {
            if let Some(result) = &self.result {
                let blocks = blocks_from_result(result);
                if !blocks.is_empty() {
                    return (self.response_id, blocks);
                }
            }
            return (self.response_id, Vec::new());
        }

        (
            self.response_id,
            vec![ContentBlock::message(self.parts.concat())],
        )
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };

        if let Some(id) = event.pointer("/result/response_id").and_then(Value::as_str) {
            self.response_id = Some(id.to_string());
        }

        match event.get("type").and_then(Value::as_str) {
            Some("message.delta" | "output_text.delta" | "response.output_text.delta") => {
                let delta = event
                    .get("content")
                    .or_else(|| event.get("delta"))
                    .map(value_text)
                    .unwrap_or_default();
                if !delta.is_empty() {
                    self.parts.push(delta);
                }
            }
            Some("message" | "message.completed" | "response.output_text") => {
                let content = event.get("content").map(value_text).unwrap_or_default();
                if !content.is_empty() {
                    self.parts.push(content);
                }
            }
            Some("chat.end") => {
                if let Some(result) = event.get("result") {
                    self.result = Some(result.clone());
                }
            }
            _ => {}
        }
    }
}

/// Extract output blocks from a single-shot result object.
///
/// Understands the stateful `{ "output": [...] }` shape and falls back to the
/// chat-completions `choices[0].message.content` shape.
pub fn blocks_from_result(result: &Value) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if let Some(output) = result.get("output").and_then(Value::as_array) {
        for entry in output {
            match entry {
                Value::String(s) => blocks.push(ContentBlock::message(s.clone())),
                Value::Object(obj) => {
                    let kind = obj
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("message")
                        .to_string();
                    let text = obj
                        .get("content")
                        .filter(|v| !v.is_null())
                        .or_else(|| obj.get("text").filter(|v| !v.is_null()));
                    if let Some(text) = text {
                        blocks.push(ContentBlock {
                            kind,
                            text: value_text(text),
                        });
                    }
                }
                _ => {}
            }
        }
    } else if let Some(content) = result
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        blocks.push(ContentBlock::message(content));
    }
    blocks
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deltas_are_concatenated_across_split_chunks() {
        let mut acc = SseAccumulator::new();
        acc.push(b"data: {\"type\":\"message.delta\",\"content\":\"{\\\"a\\\"\"}\n");
        acc.push(b"data: {\"type\":\"message.de");
        acc.push(b"lta\",\"content\":\":1}\"}\n");
        acc.push(b": keep-alive\n");
        acc.push(b"data: {\"type\":\"chat.end\",\"result\":{\"response_id\":\"resp_7\"}}\n");
        acc.push(b"data: [DONE]\n");

        let (id, blocks) = acc.finish();
        assert_eq!(id.as_deref(), Some("resp_7"));
        assert_eq!(blocks, vec![ContentBlock::message("{\"a\":1}")]);
    }

    #[test]
    fn chat_end_output_is_used_when_no_deltas_arrived() {
        let mut acc = SseAccumulator::new();
        acc.push(
            b"data: {\"type\":\"chat.end\",\"result\":{\"response_id\":\"r\",\"output\":[{\"type\":\"message\",\"content\":\"done\"}]}}",
        );
        let (id, blocks) = acc.finish();
        assert_eq!(id.as_deref(), Some("r"));
        assert_eq!(blocks, vec![ContentBlock::message("done")]);
    }

    #[test]
    fn single_shot_blocks_keep_kinds_and_fallback_to_choices() {
        let result = json!({
            "response_id": "x",
            "output": [
                {"type": "reasoning", "content": "hmm"},
                {"type": "message", "content": "hello"},
                "tail"
            ]
        });
        let blocks = blocks_from_result(&result);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].kind, "reasoning");
        assert!(!blocks[0].is_message());
        assert_eq!(blocks[2], ContentBlock::message("tail"));

        let legacy = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(blocks_from_result(&legacy), vec![ContentBlock::message("hi")]);
    }
}
