use serde_json::Value;

/// Token counts feeding the quota stage and the normalizer's usage block.
/// Estimates only: roughly four characters per token, plus a small per-message
/// overhead for chat framing. Rate limiting never depends on these numbers.
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

pub fn estimate_prompt_tokens(body: &Value) -> u64 {
    let Some(messages) = body.get("messages").and_then(|v| v.as_array()) else {
        return 0;
    };
    let mut total = 0u64;
    for message in messages {
        total += 4;
        if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
            total += estimate_text_tokens(content);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_body_estimates_zero() {
        assert_eq!(estimate_prompt_tokens(&json!({})), 0);
    }

    #[test]
    fn longer_prompts_estimate_more() {
        let short = json!({"messages": [{"role": "user", "content": "hi"}]});
        let long = json!({"messages": [{"role": "user", "content": "a".repeat(400)}]});
        assert!(estimate_prompt_tokens(&long) > estimate_prompt_tokens(&short));
    }

    #[test]
    fn text_tokens_round_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }
}
