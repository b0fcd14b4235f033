use crate::auth::Identity;
use crate::families::ModelFamily;
use crate::providers::{ApiDialect, Provider};
use axum::http::HeaderMap;
use serde_json::Value;
use std::time::Instant;
use uuid::Uuid;

/// Internal handle for one in-flight client request. Created at admission,
/// cycled through the queue on retries, destroyed on terminal success or
/// failure, client abort, or stall timeout.
#[derive(Debug)]
pub struct Ticket {
    pub id: Uuid,
    pub identity: Identity,
    pub provider: Provider,
    pub inbound: ApiDialect,
    pub outbound: ApiDialect,
    pub family: ModelFamily,
    pub model: String,
    /// Provider wire body; the preprocessor rewrites this once, at admission.
    pub body: Value,
    /// Client headers that accompany every upstream attempt. Starts as a
    /// copy of the inbound set; the preprocessor prunes it down.
    pub forward_headers: HeaderMap,
    pub stream: bool,
    pub bad_sse_parser: bool,
    pub debug: bool,
    pub started_at: Instant,
    pub queue_out_at: Option<Instant>,
    pub retry_count: u32,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

impl Ticket {
    pub fn new(
        identity: Identity,
        provider: Provider,
        family: ModelFamily,
        model: String,
        body: Value,
        stream: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            provider,
            inbound: ApiDialect::OpenAi,
            outbound: provider.dialect(),
            family,
            model,
            body,
            forward_headers: HeaderMap::new(),
            stream,
            bad_sse_parser: false,
            debug: false,
            started_at: Instant::now(),
            queue_out_at: None,
            retry_count: 0,
            prompt_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn deprioritized(&self) -> bool {
        self.identity.deprioritized()
    }
}
