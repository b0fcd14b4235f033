use crate::error::AppError;
use axum::response::sse::Event;
use serde_json::{json, Value};
use std::time::Duration;

/// Terminal sentinel in the OpenAI dialect.
pub fn done_event() -> Event {
    Event::default().data("[DONE]")
}

/// Error frame written when a failure happens after the SSE channel opened.
pub fn error_event(err: &AppError) -> Event {
    Event::default().data(json!({ "error": err.envelope() }).to_string())
}

/// One OpenAI-shape streaming chunk.
pub fn openai_chunk(
    id: &str,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

pub fn chunk_event(chunk: &Value) -> Event {
    Event::default().data(chunk.to_string())
}

/// Keep-alive frame sent while a streaming client waits in the queue. Must
/// not contain anything the client would render as model output: production
/// mode emits an SSE comment; diagnostic mode emits a well-formed fake chunk
/// with an empty delta. Clients that declared `badSseParser=true` get
/// nothing at all.
pub fn heartbeat_event(
    model: &str,
    depth: usize,
    estimated_wait: Duration,
    diagnostic: bool,
    bad_sse_parser: bool,
) -> Option<Event> {
    if bad_sse_parser {
        return None;
    }
    if diagnostic {
        let chunk = openai_chunk("keepalive", model, json!({}), None);
        return Some(Event::default().event("keepalive").data(chunk.to_string()));
    }
    Some(Event::default().comment(format!(
        "queue heartbeat: depth={} estimated_wait_ms={}",
        depth,
        estimated_wait.as_millis()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn bad_sse_parser_suppresses_heartbeats() {
        assert!(heartbeat_event("gpt-4", 1, Duration::ZERO, false, true).is_none());
        assert!(heartbeat_event("gpt-4", 1, Duration::ZERO, true, true).is_none());
        assert!(heartbeat_event("gpt-4", 1, Duration::ZERO, false, false).is_some());
    }

    #[test]
    fn chunk_shape_is_openai() {
        let chunk = openai_chunk("chatcmpl-x", "gpt-4", json!({"content": "hi"}), None);
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");
        assert!(chunk["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn error_event_carries_envelope() {
        let err = AppError::proxy(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        let event = format!("{:?}", error_event(&err));
        assert!(event.contains("boom"));
    }
}
