use crate::config::RuntimeConfig;
use crate::ticket::Ticket;
use axum::http::HeaderMap;

pub mod block_origins;
pub mod content_filter;
pub mod finalize;
pub mod quota;
pub mod strip_headers;

/// Everything a rewriter stage may look at or mutate. Built once per ticket
/// at admission; the pipeline never runs again on retry. The forwarded
/// header set lives on the ticket itself so the executor can attach it to
/// every upstream attempt.
pub struct RewriteContext<'a> {
    pub config: &'a RuntimeConfig,
    pub ticket: &'a mut Ticket,
    pub inbound_headers: &'a HeaderMap,
}

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("{0}")]
    Blocked(String),
    #[error("{0}")]
    BadRequest(String),
}

impl RewriteError {
    pub fn status(&self) -> axum::http::StatusCode {
        match self {
            RewriteError::Blocked(_) => axum::http::StatusCode::FORBIDDEN,
            RewriteError::BadRequest(_) => axum::http::StatusCode::BAD_REQUEST,
        }
    }
}

pub trait Rewriter: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, ctx: &mut RewriteContext<'_>) -> Result<(), RewriteError>;
}

/// The standard chain. Credential attachment is not a stage here: the proxy
/// executor builds a fresh signed request per attempt, so the leased key is
/// applied there instead.
pub fn pipeline() -> Vec<Box<dyn Rewriter>> {
    vec![
        Box::new(quota::ApplyQuotaLimits),
        Box::new(content_filter::RejectDisallowed),
        Box::new(block_origins::BlockOrigins),
        Box::new(strip_headers::StripOriginatingHeaders),
        Box::new(finalize::FinalizeBody),
    ]
}

pub fn run(ctx: &mut RewriteContext<'_>) -> Result<(), RewriteError> {
    for stage in pipeline() {
        stage.apply(ctx).map_err(|err| {
            tracing::debug!("rewriter {} rejected request: {}", stage.name(), err);
            err
        })?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::auth::Identity;
    use crate::config::RuntimeConfig;
    use crate::families::partition;
    use crate::providers::Provider;
    use crate::ticket::Ticket;
    use axum::http::HeaderMap;
    use serde_json::Value;

    pub(crate) fn context_fixture(body: Value) -> (RuntimeConfig, Ticket, HeaderMap) {
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("gpt-3.5-turbo")
            .to_string();
        let family = partition(Provider::OpenAi, &model);
        let mut ticket = Ticket::new(
            Identity::Ip("10.0.0.1".parse().expect("ip")),
            Provider::OpenAi,
            family,
            model,
            body,
            false,
        );
        let headers = HeaderMap::new();
        ticket.forward_headers = headers.clone();
        (RuntimeConfig::default(), ticket, headers)
    }
}

pub fn message_text(body: &serde_json::Value) -> String {
    let mut out = String::new();
    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
        for message in messages {
            if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(content);
            }
        }
    }
    out
}
