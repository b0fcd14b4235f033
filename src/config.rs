use crate::families::ModelFamily;
use crate::providers::Provider;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatekeeperMode {
    None,
    ProxyKey,
    UserToken,
}

impl GatekeeperMode {
    fn from_str(s: &str) -> Self {
        match s {
            "proxy_key" => Self::ProxyKey,
            "user_token" => Self::UserToken,
            _ => Self::None,
        }
    }
}

/// Everything the proxy reads from the environment, resolved once at startup.
/// Tests construct this directly instead of going through the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    pub server_title: String,

    pub openai_keys: Vec<String>,
    pub anthropic_keys: Vec<String>,
    pub google_palm_keys: Vec<String>,
    /// `access:secret:region` triples.
    pub aws_credentials: Vec<String>,

    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub google_palm_base_url: Option<String>,
    pub aws_base_url: Option<String>,

    pub model_rate_limit: Option<u32>,
    pub max_output_tokens_openai: u32,
    pub max_output_tokens_anthropic: u32,
    pub allowed_model_families: Option<HashSet<ModelFamily>>,

    pub blocked_origins: Vec<String>,
    pub block_message: String,
    pub block_redirect: Option<String>,
    pub reject_disallowed: bool,
    pub reject_message: String,

    pub prompt_logging: bool,
    pub check_keys: bool,
    pub gatekeeper: GatekeeperMode,
    pub gatekeeper_store: String,
    pub proxy_key: Option<String>,
    pub max_ips_per_user: u32,
    pub token_quota: HashMap<ModelFamily, u64>,
    pub quota_refresh_period: Option<String>,

    pub shared_ips: HashSet<IpAddr>,
    pub heartbeat_diagnostics: bool,

    pub dispatch_tick: Duration,
    pub sweep_interval: Duration,
    pub stall_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub sample_retention: Duration,
    pub upstream_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 7860,
            server_title: "keymux".to_string(),
            openai_keys: Vec::new(),
            anthropic_keys: Vec::new(),
            google_palm_keys: Vec::new(),
            aws_credentials: Vec::new(),
            openai_base_url: None,
            anthropic_base_url: None,
            google_palm_base_url: None,
            aws_base_url: None,
            model_rate_limit: None,
            max_output_tokens_openai: 400,
            max_output_tokens_anthropic: 600,
            allowed_model_families: None,
            blocked_origins: Vec::new(),
            block_message: "You must be over the age of majority in your country to use this service.".to_string(),
            block_redirect: None,
            reject_disallowed: false,
            reject_message: "This content violates the proxy's acceptable use policy.".to_string(),
            prompt_logging: false,
            check_keys: false,
            gatekeeper: GatekeeperMode::None,
            gatekeeper_store: "memory".to_string(),
            proxy_key: None,
            max_ips_per_user: 0,
            token_quota: HashMap::new(),
            quota_refresh_period: None,
            shared_ips: HashSet::new(),
            heartbeat_diagnostics: false,
            dispatch_tick: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(20),
            stall_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(10),
            sample_retention: Duration::from_secs(300),
            upstream_timeout: Duration::from_secs(120),
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_list(name: &str) -> Vec<String> {
    env_str(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_str(name).as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_str(name).and_then(|v| v.parse().ok())
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let allowed_model_families = env_str("ALLOWED_MODEL_FAMILIES").map(|v| {
            v.split(',')
                .filter_map(|s| ModelFamily::from_str(s.trim()))
                .collect()
        });

        let mut token_quota = HashMap::new();
        for family in ModelFamily::ALL {
            let var = format!(
                "TOKEN_QUOTA_{}",
                family.as_str().replace('-', "_").to_uppercase()
            );
            if let Some(quota) = env_parse::<u64>(&var) {
                token_quota.insert(family, quota);
            }
        }

        let shared_ips = env_list("SHARED_IPS")
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            server_title: env_str("SERVER_TITLE").unwrap_or(defaults.server_title),
            openai_keys: env_list("OPENAI_KEY"),
            anthropic_keys: env_list("ANTHROPIC_KEY"),
            google_palm_keys: env_list("GOOGLE_PALM_KEY"),
            aws_credentials: env_list("AWS_CREDENTIALS"),
            openai_base_url: env_str("OPENAI_BASE_URL"),
            anthropic_base_url: env_str("ANTHROPIC_BASE_URL"),
            google_palm_base_url: env_str("GOOGLE_PALM_BASE_URL"),
            aws_base_url: env_str("AWS_BASE_URL"),
            model_rate_limit: env_parse("MODEL_RATE_LIMIT"),
            max_output_tokens_openai: env_parse("MAX_OUTPUT_TOKENS_OPENAI")
                .unwrap_or(defaults.max_output_tokens_openai),
            max_output_tokens_anthropic: env_parse("MAX_OUTPUT_TOKENS_ANTHROPIC")
                .unwrap_or(defaults.max_output_tokens_anthropic),
            allowed_model_families,
            blocked_origins: env_list("BLOCKED_ORIGINS"),
            block_message: env_str("BLOCK_MESSAGE").unwrap_or(defaults.block_message),
            block_redirect: env_str("BLOCK_REDIRECT"),
            reject_disallowed: env_bool("REJECT_DISALLOWED"),
            reject_message: env_str("REJECT_MESSAGE").unwrap_or(defaults.reject_message),
            prompt_logging: env_bool("PROMPT_LOGGING"),
            check_keys: env_bool("CHECK_KEYS"),
            gatekeeper: GatekeeperMode::from_str(
                env_str("GATEKEEPER").as_deref().unwrap_or("none"),
            ),
            gatekeeper_store: env_str("GATEKEEPER_STORE").unwrap_or(defaults.gatekeeper_store),
            proxy_key: env_str("PROXY_KEY"),
            max_ips_per_user: env_parse("MAX_IPS_PER_USER").unwrap_or(defaults.max_ips_per_user),
            token_quota,
            quota_refresh_period: env_str("QUOTA_REFRESH_PERIOD"),
            shared_ips,
            heartbeat_diagnostics: env_bool("HEARTBEAT_DIAGNOSTICS"),
            dispatch_tick: env_parse("DISPATCH_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch_tick),
            sweep_interval: env_parse("SWEEP_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            stall_timeout: env_parse("QUEUE_STALL_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stall_timeout),
            heartbeat_interval: env_parse("HEARTBEAT_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            sample_retention: defaults.sample_retention,
            upstream_timeout: env_parse("UPSTREAM_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.upstream_timeout),
        }
    }

    pub fn base_url_override(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::OpenAi => self.openai_base_url.as_deref(),
            Provider::Anthropic => self.anthropic_base_url.as_deref(),
            Provider::GooglePalm => self.google_palm_base_url.as_deref(),
            Provider::Aws => self.aws_base_url.as_deref(),
        }
    }

    pub fn max_output_tokens(&self, family: ModelFamily) -> u32 {
        match family {
            ModelFamily::Turbo | ModelFamily::Gpt4 | ModelFamily::Gpt4_32k => {
                self.max_output_tokens_openai
            }
            ModelFamily::Claude | ModelFamily::Bison | ModelFamily::AwsClaude => {
                self.max_output_tokens_anthropic
            }
        }
    }

    pub fn family_allowed(&self, family: ModelFamily) -> bool {
        self.allowed_model_families
            .as_ref()
            .map(|set| set.contains(&family))
            .unwrap_or(true)
    }
}
