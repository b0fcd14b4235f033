use super::{RewriteContext, RewriteError, Rewriter};

/// Rejects requests arriving from a configured origin (matched against the
/// `Origin` and `Referer` headers, substring semantics).
pub struct BlockOrigins;

impl Rewriter for BlockOrigins {
    fn name(&self) -> &'static str {
        "block_origins"
    }

    fn apply(&self, ctx: &mut RewriteContext<'_>) -> Result<(), RewriteError> {
        if ctx.config.blocked_origins.is_empty() {
            return Ok(());
        }
        for header in ["origin", "referer"] {
            let Some(value) = ctx
                .inbound_headers
                .get(header)
                .and_then(|v| v.to_str().ok())
            else {
                continue;
            };
            if ctx
                .config
                .blocked_origins
                .iter()
                .any(|blocked| value.contains(blocked.as_str()))
            {
                let message = match &ctx.config.block_redirect {
                    Some(redirect) => {
                        format!("{} Please use {} instead.", ctx.config.block_message, redirect)
                    }
                    None => ctx.config.block_message.clone(),
                };
                return Err(RewriteError::Blocked(message));
            }
        }
        Ok(())
    }
}
