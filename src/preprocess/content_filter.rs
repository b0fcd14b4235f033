use super::{message_text, RewriteContext, RewriteError, Rewriter};
use regex::Regex;
use std::sync::OnceLock;

// Matches prompts that sexualize minors. Deliberately narrow: false
// positives terminate real requests.
const DISALLOWED_PATTERN: &str =
    r"(?i)\b(?:under[\s-]?age|minor|child|preteen|loli|shota)s?\b[\s\S]{0,80}?\b(?:sexual|sexy|nsfw|explicit|nude|lewd)\b";

fn matches_disallowed(text: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DISALLOWED_PATTERN).ok())
        .as_ref()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// Rejects requests whose prompt matches the disallowed-content pattern.
/// Only active when `REJECT_DISALLOWED` is set.
pub struct RejectDisallowed;

impl Rewriter for RejectDisallowed {
    fn name(&self) -> &'static str {
        "reject_disallowed"
    }

    fn apply(&self, ctx: &mut RewriteContext<'_>) -> Result<(), RewriteError> {
        if !ctx.config.reject_disallowed {
            return Ok(());
        }
        let text = message_text(&ctx.ticket.body);
        if matches_disallowed(&text) {
            return Err(RewriteError::Blocked(ctx.config.reject_message.clone()));
        }
        Ok(())
    }
}
