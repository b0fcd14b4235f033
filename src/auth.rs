use crate::config::{GatekeeperMode, RuntimeConfig};
use crate::error::AppError;
use axum::http::{HeaderMap, StatusCode};
use std::net::IpAddr;

/// Stable identity a ticket is attributed to for the concurrency cap.
/// Shared-identity sources front many users: they get a higher cap but are
/// deprioritized in scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    UserToken(String),
    SharedIp(IpAddr),
    Ip(IpAddr),
}

impl Identity {
    pub fn concurrency_cap(&self) -> usize {
        match self {
            Identity::SharedIp(_) => 5,
            _ => 1,
        }
    }

    pub fn deprioritized(&self) -> bool {
        matches!(self, Identity::SharedIp(_))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::UserToken(token) => write!(f, "token:{}", mask(token)),
            Identity::SharedIp(ip) => write!(f, "shared:{}", ip),
            Identity::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

fn mask(token: &str) -> String {
    if token.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &token[..4])
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn client_ip(headers: &HeaderMap) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// Resolves the caller's identity, enforcing the gatekeeper mode first.
pub fn identify(config: &RuntimeConfig, headers: &HeaderMap) -> Result<Identity, AppError> {
    let token = bearer_token(headers);
    match config.gatekeeper {
        GatekeeperMode::ProxyKey => {
            let expected = config.proxy_key.as_deref().unwrap_or_default();
            if expected.is_empty() || token.as_deref() != Some(expected) {
                return Err(AppError::proxy(
                    StatusCode::UNAUTHORIZED,
                    "invalid proxy password",
                ));
            }
        }
        GatekeeperMode::UserToken => {
            if let Some(token) = token {
                return Ok(Identity::UserToken(token));
            }
            return Err(AppError::proxy(
                StatusCode::UNAUTHORIZED,
                "user token required",
            ));
        }
        GatekeeperMode::None => {
            if let Some(token) = token {
                return Ok(Identity::UserToken(token));
            }
        }
    }
    let ip = client_ip(headers);
    if config.shared_ips.contains(&ip) {
        Ok(Identity::SharedIp(ip))
    } else {
        Ok(Identity::Ip(ip))
    }
}
