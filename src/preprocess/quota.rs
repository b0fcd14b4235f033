use super::{RewriteContext, RewriteError, Rewriter};
use serde_json::json;

/// Caps the requested output tokens to the configured family limit. A
/// missing or non-numeric `max_tokens` gets the limit outright.
pub struct ApplyQuotaLimits;

impl Rewriter for ApplyQuotaLimits {
    fn name(&self) -> &'static str {
        "apply_quota_limits"
    }

    fn apply(&self, ctx: &mut RewriteContext<'_>) -> Result<(), RewriteError> {
        let limit = ctx.config.max_output_tokens(ctx.ticket.family) as u64;
        let requested = ctx
            .ticket
            .body
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(limit);
        let capped = requested.min(limit);
        if let Some(obj) = ctx.ticket.body.as_object_mut() {
            obj.insert("max_tokens".to_string(), json!(capped));
        }
        Ok(())
    }
}
