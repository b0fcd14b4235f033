use super::{RewriteContext, RewriteError, Rewriter};

// Headers that would leak the originating client to the upstream provider,
// plus framing headers the executor sets itself.
const STRIPPED: &[&str] = &[
    "authorization",
    "cookie",
    "origin",
    "referer",
    "user-agent",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
    "forwarded",
    "cf-connecting-ip",
    "cf-ipcountry",
    "cf-ray",
    "host",
    "content-length",
    "content-type",
    "accept-encoding",
    "transfer-encoding",
    "connection",
];

/// Prunes the ticket's forwarded header set down to what is safe to send
/// upstream; the executor attaches what survives to every attempt.
pub struct StripOriginatingHeaders;

impl Rewriter for StripOriginatingHeaders {
    fn name(&self) -> &'static str {
        "strip_originating_headers"
    }

    fn apply(&self, ctx: &mut RewriteContext<'_>) -> Result<(), RewriteError> {
        for header in STRIPPED {
            ctx.ticket.forward_headers.remove(*header);
        }
        Ok(())
    }
}
