use odds_types::{ParseError, RaffleTemplate, WalletAddress};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ACTIVE_TARGET: u64 = 10;
pub const DEFAULT_HORIZON_DAYS: u32 = 30;
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_HTTP_RATE_LIMIT_PER_SECOND: u64 = 50;
pub const DEFAULT_HTTP_RATE_LIMIT_BURST: u32 = 100;
pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_LEADERBOARD_SIZE: u64 = 10;

/// How the scheduler keeps raffles flowing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RotationPolicy {
    /// Keep `active_target` raffles open at all times; raffles end when sold out.
    Pool { active_target: u64 },
    /// One raffle per UTC day, scheduled `horizon_days` ahead.
    Daily { horizon_days: u32 },
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy::Pool {
            active_target: DEFAULT_ACTIVE_TARGET,
        }
    }
}

impl FromStr for RotationPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pool" => Ok(RotationPolicy::default()),
            "daily" => Ok(RotationPolicy::Daily {
                horizon_days: DEFAULT_HORIZON_DAYS,
            }),
            other => Err(ParseError::UnknownVariant {
                kind: "rotation policy",
                value: other.to_string(),
            }),
        }
    }
}

/// A secret that never appears in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Browser origins allowed to call the API.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    pub allowed: HashSet<String>,
    /// Accept requests without an `Origin` header (server-to-server callers).
    pub allow_no_origin: bool,
}

impl OriginPolicy {
    /// Accept every origin, including none.
    pub fn permissive() -> Self {
        Self {
            allowed: HashSet::from(["*".to_string()]),
            allow_no_origin: true,
        }
    }

    pub fn allows_any(&self) -> bool {
        self.allowed.contains("*")
    }

    pub fn from_list(list: &str, allow_no_origin: bool) -> Self {
        Self {
            allowed: list
                .split(',')
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
            allow_no_origin,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub jwt_secret: Secret,
    pub token_ttl: Duration,
    /// Alchemy webhook signing key. Webhooks are rejected when unset.
    pub webhook_signing_key: Option<Secret>,
    /// Admin routes are rejected when unset.
    pub admin_token: Option<Secret>,
    /// `/metrics` is open when unset.
    pub metrics_token: Option<Secret>,
    /// Webhook logs from other accounts are ignored when set.
    pub lottery_contract: Option<WalletAddress>,
    pub rotation: RotationPolicy,
    pub template: RaffleTemplate,
    pub scheduler_interval: Duration,
    pub leaderboard_size: u64,
    pub origins: OriginPolicy,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            jwt_secret: Secret::default(),
            token_ttl: DEFAULT_TOKEN_TTL,
            webhook_signing_key: None,
            admin_token: None,
            metrics_token: None,
            lottery_contract: None,
            rotation: RotationPolicy::default(),
            template: RaffleTemplate::default(),
            scheduler_interval: DEFAULT_SCHEDULER_INTERVAL,
            leaderboard_size: DEFAULT_LEADERBOARD_SIZE,
            origins: OriginPolicy::default(),
            http_rate_limit_per_second: Some(DEFAULT_HTTP_RATE_LIMIT_PER_SECOND),
            http_rate_limit_burst: Some(DEFAULT_HTTP_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
        }
    }
}
