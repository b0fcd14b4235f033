use crate::config::RuntimeConfig;
use crate::families::ModelFamily;
use crate::providers::Provider;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Rate limits are opaque to the proxy: a key either works right now or is
/// locked out of a family until some instant. No token-bucket accounting.
pub const DEFAULT_LOCKOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum Credential {
    Api {
        secret: String,
        org: Option<String>,
    },
    Aws {
        access: String,
        secret: String,
        region: String,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FamilyUsage {
    pub requests: u64,
    pub tokens: u64,
}

#[derive(Debug)]
pub struct KeyRecord {
    pub id: String,
    pub provider: Provider,
    pub credential: Credential,
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub last_rate_limited_at: Option<Instant>,
    last_used: HashMap<ModelFamily, Instant>,
    lockout_until: HashMap<ModelFamily, Instant>,
    usage: HashMap<ModelFamily, FamilyUsage>,
}

impl KeyRecord {
    fn new(id: String, provider: Provider, credential: Credential) -> Self {
        Self {
            id,
            provider,
            credential,
            enabled: true,
            disabled_reason: None,
            last_rate_limited_at: None,
            last_used: HashMap::new(),
            lockout_until: HashMap::new(),
            usage: HashMap::new(),
        }
    }

    fn usable_for(&self, family: ModelFamily, now: Instant) -> bool {
        self.enabled
            && self.provider == family.provider()
            && self
                .lockout_until
                .get(&family)
                .map(|until| *until <= now)
                .unwrap_or(true)
    }
}

/// Snapshot handed out by `lease`; the pool keeps ownership of the record.
#[derive(Debug, Clone)]
pub struct LeasedKey {
    pub id: String,
    pub provider: Provider,
    pub credential: Credential,
}

pub struct KeyPool {
    keys: Mutex<Vec<KeyRecord>>,
}

impl KeyPool {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let mut keys = Vec::new();
        for (idx, secret) in config.openai_keys.iter().enumerate() {
            keys.push(KeyRecord::new(
                format!("oai-{}", idx),
                Provider::OpenAi,
                Credential::Api {
                    secret: secret.clone(),
                    org: None,
                },
            ));
        }
        for (idx, secret) in config.anthropic_keys.iter().enumerate() {
            keys.push(KeyRecord::new(
                format!("ant-{}", idx),
                Provider::Anthropic,
                Credential::Api {
                    secret: secret.clone(),
                    org: None,
                },
            ));
        }
        for (idx, secret) in config.google_palm_keys.iter().enumerate() {
            keys.push(KeyRecord::new(
                format!("plm-{}", idx),
                Provider::GooglePalm,
                Credential::Api {
                    secret: secret.clone(),
                    org: None,
                },
            ));
        }
        for (idx, triple) in config.aws_credentials.iter().enumerate() {
            let mut parts = triple.splitn(3, ':');
            let (Some(access), Some(secret), Some(region)) =
                (parts.next(), parts.next(), parts.next())
            else {
                tracing::warn!("ignoring malformed AWS credential entry at index {}", idx);
                continue;
            };
            keys.push(KeyRecord::new(
                format!("aws-{}", idx),
                Provider::Aws,
                Credential::Aws {
                    access: access.to_string(),
                    secret: secret.to_string(),
                    region: region.to_string(),
                },
            ));
        }
        Self {
            keys: Mutex::new(keys),
        }
    }

    /// Returns an enabled, non-locked-out key for the family, preferring the
    /// least recently used one. `None` is back-pressure, not an error: the
    /// caller leaves the request queued for another dispatcher tick.
    pub async fn lease(&self, family: ModelFamily) -> Option<LeasedKey> {
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        let candidate = keys
            .iter_mut()
            .filter(|k| k.usable_for(family, now))
            .min_by_key(|k| k.last_used.get(&family).copied())?;
        candidate.last_used.insert(family, now);
        Some(LeasedKey {
            id: candidate.id.clone(),
            provider: candidate.provider,
            credential: candidate.credential.clone(),
        })
    }

    /// Zero when at least one usable key exists for the family. Otherwise the
    /// minimum remaining lockout, or `Duration::MAX` when no key of the
    /// family's provider is configured at all.
    pub async fn lockout_period(&self, family: ModelFamily) -> Duration {
        let now = Instant::now();
        let keys = self.keys.lock().await;
        let mut min_remaining: Option<Duration> = None;
        for key in keys.iter() {
            if !key.enabled || key.provider != family.provider() {
                continue;
            }
            let remaining = key
                .lockout_until
                .get(&family)
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Duration::ZERO;
            }
            min_remaining = Some(match min_remaining {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        }
        min_remaining.unwrap_or(Duration::MAX)
    }

    pub async fn mark_rate_limited(
        &self,
        key_id: &str,
        family: ModelFamily,
        retry_after: Option<Duration>,
    ) {
        let lockout = retry_after.unwrap_or(DEFAULT_LOCKOUT);
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.iter_mut().find(|k| k.id == key_id) {
            key.last_rate_limited_at = Some(now);
            key.lockout_until.insert(family, now + lockout);
            tracing::warn!(
                "key {} locked out of {} for {:?}",
                key_id,
                family,
                lockout
            );
            metrics::counter!("keymux_key_lockouts_total", "family" => family.as_str())
                .increment(1);
        }
    }

    /// Permanently retires a key. Used on 401/403 and quota-exhausted signals.
    pub async fn disable(&self, key_id: &str, reason: &str) {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.iter_mut().find(|k| k.id == key_id) {
            if key.enabled {
                key.enabled = false;
                key.disabled_reason = Some(reason.to_string());
                tracing::warn!("key {} disabled: {}", key_id, reason);
            }
        }
    }

    pub async fn record_usage(&self, key_id: &str, family: ModelFamily, token_count: u64) {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.iter_mut().find(|k| k.id == key_id) {
            let usage = key.usage.entry(family).or_default();
            usage.requests += 1;
            usage.tokens += token_count;
        }
    }

    pub async fn usable_count(&self, family: ModelFamily) -> usize {
        let now = Instant::now();
        let keys = self.keys.lock().await;
        keys.iter().filter(|k| k.usable_for(family, now)).count()
    }

    pub async fn usage_snapshot(&self, key_id: &str, family: ModelFamily) -> FamilyUsage {
        let keys = self.keys.lock().await;
        keys.iter()
            .find(|k| k.id == key_id)
            .and_then(|k| k.usage.get(&family).copied())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_openai_keys(n: usize) -> KeyPool {
        let config = RuntimeConfig {
            openai_keys: (0..n).map(|i| format!("sk-test-{}", i)).collect(),
            ..RuntimeConfig::default()
        };
        KeyPool::from_config(&config)
    }

    #[tokio::test]
    async fn lease_rotates_least_recently_used() {
        let pool = pool_with_openai_keys(2);
        let first = pool.lease(ModelFamily::Turbo).await.expect("key");
        let second = pool.lease(ModelFamily::Turbo).await.expect("key");
        assert_ne!(first.id, second.id);
        let third = pool.lease(ModelFamily::Turbo).await.expect("key");
        assert_eq!(third.id, first.id);
    }

    #[tokio::test]
    async fn lease_skips_locked_out_keys() {
        let pool = pool_with_openai_keys(2);
        let first = pool.lease(ModelFamily::Turbo).await.expect("key");
        pool.mark_rate_limited(&first.id, ModelFamily::Turbo, Some(Duration::from_secs(60)))
            .await;
        for _ in 0..3 {
            let leased = pool.lease(ModelFamily::Turbo).await.expect("key");
            assert_ne!(leased.id, first.id);
        }
    }

    #[tokio::test]
    async fn lockout_is_per_family() {
        let pool = pool_with_openai_keys(1);
        let key = pool.lease(ModelFamily::Turbo).await.expect("key");
        pool.mark_rate_limited(&key.id, ModelFamily::Turbo, Some(Duration::from_secs(60)))
            .await;
        assert!(pool.lease(ModelFamily::Turbo).await.is_none());
        assert!(pool.lease(ModelFamily::Gpt4).await.is_some());
    }

    #[tokio::test]
    async fn lockout_period_reports_minimum_remaining() {
        let pool = pool_with_openai_keys(2);
        let a = pool.lease(ModelFamily::Turbo).await.expect("key");
        let b = pool.lease(ModelFamily::Turbo).await.expect("key");
        pool.mark_rate_limited(&a.id, ModelFamily::Turbo, Some(Duration::from_secs(60)))
            .await;
        pool.mark_rate_limited(&b.id, ModelFamily::Turbo, Some(Duration::from_secs(5)))
            .await;
        let period = pool.lockout_period(ModelFamily::Turbo).await;
        assert!(period > Duration::ZERO);
        assert!(period <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn lockout_period_zero_with_usable_key() {
        let pool = pool_with_openai_keys(1);
        assert_eq!(pool.lockout_period(ModelFamily::Turbo).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn no_keys_means_max_lockout() {
        let pool = pool_with_openai_keys(1);
        assert_eq!(pool.lockout_period(ModelFamily::Claude).await, Duration::MAX);
    }

    #[tokio::test]
    async fn disabled_keys_are_never_leased() {
        let pool = pool_with_openai_keys(1);
        let key = pool.lease(ModelFamily::Turbo).await.expect("key");
        pool.disable(&key.id, "revoked").await;
        assert!(pool.lease(ModelFamily::Turbo).await.is_none());
        assert_eq!(pool.lockout_period(ModelFamily::Turbo).await, Duration::MAX);
    }

    #[tokio::test]
    async fn usage_counters_accumulate() {
        let pool = pool_with_openai_keys(1);
        let key = pool.lease(ModelFamily::Turbo).await.expect("key");
        pool.record_usage(&key.id, ModelFamily::Turbo, 100).await;
        pool.record_usage(&key.id, ModelFamily::Turbo, 50).await;
        let usage = pool.usage_snapshot(&key.id, ModelFamily::Turbo).await;
        assert_eq!(usage.requests, 2);
        assert_eq!(usage.tokens, 150);
    }

    #[tokio::test]
    async fn aws_triples_are_parsed() {
        let config = RuntimeConfig {
            aws_credentials: vec![
                "AKIA123:secretpart:us-west-2".to_string(),
                "malformed".to_string(),
            ],
            ..RuntimeConfig::default()
        };
        let pool = KeyPool::from_config(&config);
        let key = pool.lease(ModelFamily::AwsClaude).await.expect("aws key");
        match key.credential {
            Credential::Aws {
                access,
                secret,
                region,
            } => {
                assert_eq!(access, "AKIA123");
                assert_eq!(secret, "secretpart");
                assert_eq!(region, "us-west-2");
            }
            _ => panic!("expected aws credential"),
        }
        assert!(pool.lease(ModelFamily::AwsClaude).await.is_some());
    }
}
