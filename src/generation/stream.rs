//! Chat-completion-compatible chunk formatting and SSE framing.

use serde_json::{json, Value};

pub const DONE: &str = "data: [DONE]\n\n";

/// The first chunk of a stream: carries `role=assistant` and no content yet.
pub fn role_chunk(id: &str, model: &str, created: i64) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "role": "assistant", "tool_calls": null },
        }],
        "usage": null,
    })
}

/// A mid-stream progress/heartbeat chunk carrying plain content.
pub fn content_chunk(id: &str, model: &str, created: i64, content: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": content, "tool_calls": null },
        }],
        "usage": null,
    })
}

/// The terminal chunk on a successful generation: carries the rendered media
/// and `finish_reason=STOP`.
pub fn final_chunk(id: &str, model: &str, created: i64, rendered_media: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": rendered_media, "tool_calls": null },
            "finish_reason": "STOP",
            "native_finish_reason": "STOP",
        }],
        "usage": null,
    })
}

/// Render an `sse` data line: `data: <json>\n\n`.
pub fn sse_line(value: &Value) -> String {
    format!("data: {value}\n\n")
}

/// Non-streaming response body: same chat-completion shape, but with a single
/// `message` in place of per-chunk `delta`, and no trailing `[DONE]`.
pub fn non_stream_response(id: &str, model: &str, created: i64, content: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "STOP",
            "native_finish_reason": "STOP",
        }],
        "usage": null,
    })
}

/// Markdown image block the image branch emits as its terminal content.
pub fn image_markdown(url: &str) -> String {
    format!("![generated image]({url})")
}

/// HTML `<video>` block the video branch emits as its terminal content.
pub fn video_html(url: &str) -> String {
    format!("<video controls src=\"{url}\"></video>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_chunk_carries_assistant_role() {
        let chunk = role_chunk("id-1", "sora-image", 1700000000);
        assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");
        assert!(chunk["choices"][0].get("finish_reason").is_none());
    }

    #[test]
    fn final_chunk_carries_stop_and_media() {
        let chunk = final_chunk("id-1", "sora-image", 1700000000, &image_markdown("https://x/a.png"));
        assert_eq!(chunk["choices"][0]["finish_reason"], "STOP");
        assert!(chunk["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap()
            .contains("![generated image]"));
    }

    #[test]
    fn sse_line_is_data_prefixed_and_double_newline_terminated() {
        let line = sse_line(&json!({"a": 1}));
        assert!(line.starts_with("data: "));
        assert!(line.ends_with("\n\n"));
    }

    #[test]
    fn non_stream_response_has_no_delta_field() {
        let body = non_stream_response("id-1", "sora-image", 1700000000, "ok");
        assert!(body["choices"][0].get("delta").is_none());
        assert_eq!(body["choices"][0]["message"]["content"], "ok");
    }
}
