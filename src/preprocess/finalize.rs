use super::{RewriteContext, RewriteError, Rewriter};
use crate::providers::Provider;
use serde_json::{json, Map, Value};

pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Serializes the inbound OpenAI chat body into the provider's wire shape.
/// Runs last; `max_tokens` has already been capped by the quota stage.
pub struct FinalizeBody;

impl Rewriter for FinalizeBody {
    fn name(&self) -> &'static str {
        "finalize_body"
    }

    fn apply(&self, ctx: &mut RewriteContext<'_>) -> Result<(), RewriteError> {
        let body = &ctx.ticket.body;
        if body.get("model").and_then(|v| v.as_str()).is_none() {
            return Err(RewriteError::BadRequest("missing model".to_string()));
        }
        if !body
            .get("messages")
            .map(|v| v.is_array())
            .unwrap_or(false)
        {
            return Err(RewriteError::BadRequest("missing messages".to_string()));
        }

        let max_tokens = body.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(16);
        let temperature = body.get("temperature").cloned();
        let finalized = match ctx.ticket.provider {
            Provider::OpenAi => finalize_openai(body, ctx.ticket.stream),
            Provider::Anthropic => {
                finalize_anthropic(body, max_tokens, temperature, ctx.ticket.stream, false)
            }
            Provider::Aws => finalize_anthropic(body, max_tokens, temperature, false, true),
            Provider::GooglePalm => finalize_palm(body, max_tokens, temperature),
        };
        ctx.ticket.body = finalized;
        Ok(())
    }
}

fn finalize_openai(body: &Value, stream: bool) -> Value {
    let mut out = body.as_object().cloned().unwrap_or_else(Map::new);
    out.insert("stream".to_string(), json!(stream));
    Value::Object(out)
}

/// Flattens the chat transcript into Anthropic's prompt format. Bedrock
/// speaks the same dialect but wants an explicit version marker and no
/// stream flag in the body.
fn finalize_anthropic(
    body: &Value,
    max_tokens: u64,
    temperature: Option<Value>,
    stream: bool,
    bedrock: bool,
) -> Value {
    let prompt = flatten_to_anthropic_prompt(body);
    let mut out = Map::new();
    if !bedrock {
        if let Some(model) = body.get("model") {
            out.insert("model".to_string(), model.clone());
        }
        out.insert("stream".to_string(), json!(stream));
    } else {
        out.insert(
            "anthropic_version".to_string(),
            json!(BEDROCK_ANTHROPIC_VERSION),
        );
    }
    out.insert("prompt".to_string(), json!(prompt));
    out.insert("max_tokens_to_sample".to_string(), json!(max_tokens));
    out.insert("stop_sequences".to_string(), json!(["\n\nHuman:"]));
    if let Some(temperature) = temperature {
        out.insert("temperature".to_string(), temperature);
    }
    Value::Object(out)
}

fn finalize_palm(body: &Value, max_tokens: u64, temperature: Option<Value>) -> Value {
    let mut text = String::new();
    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
        for message in messages {
            if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(content);
            }
        }
    }
    let mut out = Map::new();
    out.insert("prompt".to_string(), json!({ "text": text }));
    out.insert("maxOutputTokens".to_string(), json!(max_tokens));
    out.insert("candidateCount".to_string(), json!(1));
    if let Some(temperature) = temperature {
        out.insert("temperature".to_string(), temperature);
    }
    Value::Object(out)
}

fn flatten_to_anthropic_prompt(body: &Value) -> String {
    let mut prompt = String::new();
    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
        for message in messages {
            let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let speaker = match role {
                "assistant" => "Assistant",
                _ => "Human",
            };
            prompt.push_str(&format!("\n\n{}: {}", speaker, content));
        }
    }
    prompt.push_str("\n\nAssistant:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::super::tests::context_fixture;
    use super::*;
    use crate::families::ModelFamily;
    use serde_json::json;

    #[test]
    fn openai_body_keeps_client_fields() {
        let (config, mut ticket, headers) = context_fixture(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.7,
        }));
        let mut ctx = RewriteContext {
            config: &config,
            ticket: &mut ticket,
            inbound_headers: &headers,
        };
        FinalizeBody.apply(&mut ctx).expect("finalize");
        assert_eq!(ctx.ticket.body["model"], "gpt-4");
        assert_eq!(ctx.ticket.body["temperature"], json!(0.7));
        assert_eq!(ctx.ticket.body["stream"], json!(false));
    }

    #[test]
    fn anthropic_prompt_is_flattened() {
        let (config, mut ticket, headers) = context_fixture(json!({
            "model": "claude-2",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi there"},
                {"role": "user", "content": "how are you"}
            ],
        }));
        ticket.provider = Provider::Anthropic;
        ticket.family = ModelFamily::Claude;
        let mut ctx = RewriteContext {
            config: &config,
            ticket: &mut ticket,
            inbound_headers: &headers,
        };
        FinalizeBody.apply(&mut ctx).expect("finalize");
        let prompt = ctx.ticket.body["prompt"].as_str().expect("prompt");
        assert!(prompt.contains("\n\nHuman: hello"));
        assert!(prompt.contains("\n\nAssistant: hi there"));
        assert!(prompt.ends_with("\n\nAssistant:"));
        assert_eq!(ctx.ticket.body["max_tokens_to_sample"], json!(100));
    }

    #[test]
    fn bedrock_body_carries_version_marker() {
        let (config, mut ticket, headers) = context_fixture(json!({
            "model": "anthropic.claude-v2",
            "messages": [{"role": "user", "content": "ping"}],
        }));
        ticket.provider = Provider::Aws;
        ticket.family = ModelFamily::AwsClaude;
        let mut ctx = RewriteContext {
            config: &config,
            ticket: &mut ticket,
            inbound_headers: &headers,
        };
        FinalizeBody.apply(&mut ctx).expect("finalize");
        assert_eq!(
            ctx.ticket.body["anthropic_version"],
            json!(BEDROCK_ANTHROPIC_VERSION)
        );
        assert!(ctx.ticket.body.get("model").is_none());
    }

    #[test]
    fn palm_body_uses_generate_text_shape() {
        let (config, mut ticket, headers) = context_fixture(json!({
            "model": "text-bison-001",
            "messages": [{"role": "user", "content": "ping"}],
        }));
        ticket.provider = Provider::GooglePalm;
        ticket.family = ModelFamily::Bison;
        let mut ctx = RewriteContext {
            config: &config,
            ticket: &mut ticket,
            inbound_headers: &headers,
        };
        FinalizeBody.apply(&mut ctx).expect("finalize");
        assert_eq!(ctx.ticket.body["prompt"]["text"], "ping");
        assert_eq!(ctx.ticket.body["candidateCount"], json!(1));
    }

    #[test]
    fn missing_messages_is_a_bad_request() {
        let (config, mut ticket, headers) = context_fixture(json!({"model": "gpt-4"}));
        let mut ctx = RewriteContext {
            config: &config,
            ticket: &mut ticket,
            inbound_headers: &headers,
        };
        let err = FinalizeBody.apply(&mut ctx).expect_err("rejected");
        assert!(matches!(err, RewriteError::BadRequest(_)));
    }
}
