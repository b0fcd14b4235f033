use crate::config::RuntimeConfig;
use crate::error::AppError;
use crate::keys::{Credential, LeasedKey};
use axum::http::StatusCode;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use serde_json::Value;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Upstream services the proxy multiplexes onto. AWS hosts Claude behind
/// Bedrock and speaks the Anthropic dialect on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Anthropic,
    GooglePalm,
    Aws,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiDialect {
    OpenAi,
    Anthropic,
    GooglePalm,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::GooglePalm,
        Provider::Aws,
    ];

    pub fn from_route_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google-palm" => Some(Self::GooglePalm),
            "aws" => Some(Self::Aws),
            _ => None,
        }
    }

    pub fn route_prefix(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::GooglePalm => "google-palm",
            Self::Aws => "aws",
        }
    }

    pub fn dialect(&self) -> ApiDialect {
        match self {
            Self::OpenAi => ApiDialect::OpenAi,
            Self::Anthropic | Self::Aws => ApiDialect::Anthropic,
            Self::GooglePalm => ApiDialect::GooglePalm,
        }
    }

    /// Whether the provider can stream SSE back to us. PaLM and Bedrock
    /// responses are buffered upstream and re-streamed synthetically.
    pub fn streams_natively(&self) -> bool {
        matches!(self, Self::OpenAi | Self::Anthropic)
    }

    pub fn default_base_url(&self, region: Option<&str>) -> String {
        match self {
            Self::OpenAi => "https://api.openai.com".to_string(),
            Self::Anthropic => "https://api.anthropic.com".to_string(),
            Self::GooglePalm => "https://generativelanguage.googleapis.com".to_string(),
            Self::Aws => format!(
                "https://bedrock-runtime.{}.amazonaws.com",
                region.unwrap_or("us-east-1")
            ),
        }
    }

    /// Rewrites the canonical client path into the provider-specific one.
    pub fn upstream_path(&self, model: &str) -> String {
        match self {
            Self::OpenAi => "/v1/chat/completions".to_string(),
            Self::Anthropic => "/v1/complete".to_string(),
            Self::GooglePalm => format!("/v1beta2/models/{}:generateText", model),
            Self::Aws => format!("/model/{}/invoke", model),
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{}/{}", base, path)
}

fn base_url_for(config: &RuntimeConfig, provider: Provider, key: &LeasedKey) -> String {
    let region = match &key.credential {
        Credential::Aws { region, .. } => Some(region.as_str()),
        _ => None,
    };
    config
        .base_url_override(provider)
        .map(|s| s.to_string())
        .unwrap_or_else(|| provider.default_base_url(region))
}

/// Builds a fresh upstream request for one attempt. The forwarded header set
/// was already scrubbed of client-identifying entries by the preprocessor;
/// credentials come from the leased key, so a retried ticket passes through
/// here again with a new lease.
pub fn build_upstream_request(
    client: &reqwest::Client,
    config: &RuntimeConfig,
    provider: Provider,
    model: &str,
    body: &Value,
    forward_headers: &axum::http::HeaderMap,
    key: &LeasedKey,
    timeout: std::time::Duration,
) -> Result<reqwest::Request, AppError> {
    let url = join_url(&base_url_for(config, provider, key), &provider.upstream_path(model));
    let mut req = client
        .post(&url)
        .timeout(timeout)
        .headers(forward_headers.clone())
        .json(body);

    match (&provider, &key.credential) {
        (Provider::OpenAi, Credential::Api { secret, org }) => {
            req = req.bearer_auth(secret);
            if let Some(org) = org {
                req = req.header("OpenAI-Organization", org.as_str());
            }
        }
        (Provider::Anthropic, Credential::Api { secret, .. }) => {
            req = req
                .header("x-api-key", secret.as_str())
                .header("anthropic-version", ANTHROPIC_VERSION);
        }
        (Provider::GooglePalm, Credential::Api { secret, .. }) => {
            req = req.query(&[("key", secret.as_str())]);
        }
        (Provider::Aws, Credential::Aws { .. }) => {
            req = req.header("accept", "application/json");
        }
        _ => {
            return Err(AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                "leased key does not match provider",
            ));
        }
    }

    let mut req = req.build().map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            format!("failed to build upstream request: {}", err),
        )
    })?;

    if let Credential::Aws {
        access,
        secret,
        region,
    } = &key.credential
    {
        sign_bedrock_request(&mut req, access, secret, region)?;
    }

    Ok(req)
}

/// SigV4-signs a Bedrock invoke call in place. Bedrock takes plain HTTPS
/// POSTs on the region-prefixed invoke path, so the proxy signs the raw
/// request instead of going through an SDK client.
fn sign_bedrock_request(
    req: &mut reqwest::Request,
    access: &str,
    secret: &str,
    region: &str,
) -> Result<(), AppError> {
    let sign_err = |err: String| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            format!("bedrock request signing failed: {}", err),
        )
    };

    let identity = Credentials::new(access, secret, None, None, "keymux").into();
    let params: aws_sigv4::http_request::SigningParams<'_> = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name("bedrock")
        .time(std::time::SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|err| sign_err(err.to_string()))?
        .into();

    let body_bytes = req
        .body()
        .and_then(|b| b.as_bytes())
        .unwrap_or_default()
        .to_vec();
    // The host header must be part of the canonical request.
    let host = req
        .url()
        .host_str()
        .map(|h| match req.url().port() {
            Some(port) => format!("{}:{}", h, port),
            None => h.to_string(),
        })
        .unwrap_or_default();
    let mut header_pairs: Vec<(String, String)> = vec![("host".to_string(), host)];
    header_pairs.extend(req.headers().iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
    }));
    let signable = SignableRequest::new(
        req.method().as_str(),
        req.url().as_str(),
        header_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        SignableBody::Bytes(&body_bytes),
    )
    .map_err(|err| sign_err(err.to_string()))?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(|err| sign_err(err.to_string()))?
        .into_parts();

    let mut signed = http::Request::builder()
        .method(req.method().as_str())
        .uri(req.url().as_str());
    for (name, value) in &header_pairs {
        signed = signed.header(name, value);
    }
    let mut signed = signed
        .body(body_bytes)
        .map_err(|err| sign_err(err.to_string()))?;
    instructions.apply_to_request_http1x(&mut signed);

    for (name, value) in signed.headers() {
        let header_name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| sign_err(err.to_string()))?;
        let header_value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| sign_err(err.to_string()))?;
        req.headers_mut().insert(header_name, header_value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_prefixes_round_trip() {
        for provider in Provider::ALL {
            assert_eq!(
                Provider::from_route_prefix(provider.route_prefix()),
                Some(provider)
            );
        }
        assert_eq!(Provider::from_route_prefix("palm"), None);
    }

    #[test]
    fn palm_path_uses_generate_text() {
        assert_eq!(
            Provider::GooglePalm.upstream_path("text-bison-001"),
            "/v1beta2/models/text-bison-001:generateText"
        );
    }

    #[test]
    fn aws_path_is_region_prefixed_invoke() {
        assert_eq!(
            Provider::Aws.default_base_url(Some("eu-west-1")),
            "https://bedrock-runtime.eu-west-1.amazonaws.com"
        );
        assert_eq!(
            Provider::Aws.upstream_path("anthropic.claude-v2"),
            "/model/anthropic.claude-v2/invoke"
        );
    }
}
