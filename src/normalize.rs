use crate::config::RuntimeConfig;
use crate::providers::ApiDialect;
use crate::ticket::Ticket;
use crate::tokens;
use serde_json::{json, Value};
use uuid::Uuid;

pub const PROMPT_LOGGING_NOTE: &str =
    "This proxy logs prompts and completions for research purposes.";

/// Transforms a provider-native response into the client's dialect. The
/// token estimator has already written `prompt_tokens`/`output_tokens` onto
/// the ticket by the time this runs.
pub fn normalize_response(ticket: &mut Ticket, upstream: Value, config: &RuntimeConfig) -> Value {
    let mut response = match (ticket.inbound, ticket.outbound) {
        (ApiDialect::OpenAi, ApiDialect::Anthropic) => anthropic_to_openai(ticket, &upstream),
        (ApiDialect::OpenAi, ApiDialect::GooglePalm) => palm_to_openai(ticket, &upstream),
        _ => {
            // Same dialect: trust the upstream's own usage metadata over our
            // estimates when it is present.
            if let Some(count) = upstream
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
            {
                ticket.prompt_tokens = count;
            }
            if let Some(count) = upstream
                .pointer("/usage/completion_tokens")
                .and_then(|v| v.as_u64())
            {
                ticket.output_tokens = count;
            }
            upstream
        }
    };
    augment(ticket, &mut response, config);
    response
}

/// Wraps Anthropic's `completion` into an OpenAI chat completion.
fn anthropic_to_openai(ticket: &mut Ticket, upstream: &Value) -> Value {
    let completion = upstream
        .get("completion")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim_start()
        .to_string();
    ticket.output_tokens = tokens::estimate_text_tokens(&completion);
    let finish_reason = match upstream.get("stop_reason").and_then(|v| v.as_str()) {
        Some("max_tokens") => json!("length"),
        Some(_) => json!("stop"),
        None => Value::Null,
    };
    json!({
        "id": format!("ant-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": ticket.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": completion },
            "finish_reason": finish_reason,
        }],
        "usage": usage_block(ticket),
    })
}

/// Lifts PaLM's first candidate into an OpenAI chat completion. PaLM gives
/// no finish signal, so `finish_reason` stays null.
fn palm_to_openai(ticket: &mut Ticket, upstream: &Value) -> Value {
    let content = upstream
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|candidates| candidates.first())
        .and_then(|c| c.get("output"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    ticket.output_tokens = tokens::estimate_text_tokens(&content);
    json!({
        "id": format!("plm-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": ticket.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": Value::Null,
        }],
        "usage": usage_block(ticket),
    })
}

fn usage_block(ticket: &Ticket) -> Value {
    json!({
        "prompt_tokens": ticket.prompt_tokens,
        "completion_tokens": ticket.output_tokens,
        "total_tokens": ticket.prompt_tokens + ticket.output_tokens,
    })
}

fn augment(ticket: &Ticket, response: &mut Value, config: &RuntimeConfig) {
    let Some(obj) = response.as_object_mut() else {
        return;
    };
    if config.prompt_logging {
        obj.insert("proxy_note".to_string(), json!(PROMPT_LOGGING_NOTE));
    }
    if ticket.debug {
        obj.insert(
            "proxy_tokenizer".to_string(),
            json!({
                "prompt_tokens": ticket.prompt_tokens,
                "output_tokens": ticket.output_tokens,
                "family": ticket.family.as_str(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::families::ModelFamily;
    use crate::providers::Provider;

    fn ticket_for(provider: Provider, model: &str) -> Ticket {
        let family = crate::families::partition(provider, model);
        Ticket::new(
            Identity::Ip("10.0.0.1".parse().expect("ip")),
            provider,
            family,
            model.to_string(),
            json!({}),
            false,
        )
    }

    #[test]
    fn anthropic_completion_is_wrapped() {
        let mut ticket = ticket_for(Provider::Anthropic, "claude-2");
        ticket.prompt_tokens = 10;
        let out = normalize_response(
            &mut ticket,
            json!({"completion": " Hello there", "stop_reason": "stop_sequence"}),
            &RuntimeConfig::default(),
        );
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["choices"][0]["message"]["role"], "assistant");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello there");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["prompt_tokens"], 10);
    }

    #[test]
    fn palm_candidate_becomes_message_content() {
        let mut ticket = ticket_for(Provider::GooglePalm, "text-bison-001");
        ticket.prompt_tokens = 5;
        let out = normalize_response(
            &mut ticket,
            json!({"candidates": [{"output": "pong"}]}),
            &RuntimeConfig::default(),
        );
        assert_eq!(out["choices"][0]["message"]["content"], "pong");
        assert!(out["id"].as_str().expect("id").starts_with("plm-"));
        assert!(out["choices"][0]["finish_reason"].is_null());
        let usage = &out["usage"];
        assert_eq!(usage["prompt_tokens"], 5);
        assert_eq!(usage["completion_tokens"], 1);
        assert_eq!(usage["total_tokens"], 6);
    }

    #[test]
    fn same_dialect_passes_through() {
        let mut ticket = ticket_for(Provider::OpenAi, "gpt-4");
        let upstream = json!({"id": "chatcmpl-1", "choices": [{"message": {"content": "ok"}}]});
        let out = normalize_response(&mut ticket, upstream.clone(), &RuntimeConfig::default());
        assert_eq!(out, upstream);
    }

    #[test]
    fn message_content_round_trips_byte_for_byte() {
        let original = "exact \u{00e9}✓ bytes\n  with whitespace";
        let mut ticket = ticket_for(Provider::GooglePalm, "text-bison-001");
        let client = normalize_response(
            &mut ticket,
            json!({"candidates": [{"output": original}]}),
            &RuntimeConfig::default(),
        );
        let content = client["choices"][0]["message"]["content"]
            .as_str()
            .expect("content");
        let reembedded = json!({"candidates": [{"output": content}]});
        assert_eq!(reembedded["candidates"][0]["output"], original);
    }

    #[test]
    fn prompt_logging_adds_disclosure_note() {
        let config = RuntimeConfig {
            prompt_logging: true,
            ..RuntimeConfig::default()
        };
        let mut ticket = ticket_for(Provider::OpenAi, "gpt-4");
        let out = normalize_response(&mut ticket, json!({"id": "chatcmpl-1"}), &config);
        assert_eq!(out["proxy_note"], PROMPT_LOGGING_NOTE);
    }

    #[test]
    fn debug_flag_attaches_tokenizer_info() {
        let mut ticket = ticket_for(Provider::OpenAi, "gpt-4");
        ticket.debug = true;
        ticket.prompt_tokens = 7;
        let out = normalize_response(&mut ticket, json!({"id": "chatcmpl-1"}), &RuntimeConfig::default());
        assert_eq!(out["proxy_tokenizer"]["prompt_tokens"], 7);
    }
}
