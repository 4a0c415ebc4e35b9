/*!
 * Outbound rate limiting.
 *
 * Fixed-window admission control for provider calls, keyed per endpoint (or
 * by one global key). The limiter gates the operations the flow machine
 * dispatches, not the machine's own transitions. Counters live in a
 * `DashMap`; each check-and-increment runs as a single atomic unit per key,
 * since concurrent flows may share one limiter instance.
 */
use dashmap::DashMap;
use metrics::counter;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
struct WindowEntry {
    request_count: u32,
    window_start: Instant,
    last_request: Instant,
}

impl WindowEntry {
    fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            last_request: now,
        }
    }
}

/// Limiter configuration: a global window plus optional per-endpoint
/// overrides matched by key prefix.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub endpoint_policies: Vec<EndpointPolicy>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            endpoint_policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    pub prefix: String,
    pub max_requests: u32,
    pub window: Duration,
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window resets; the retry-after for rejections.
    pub retry_after: Duration,
}

/// Fixed-window request admission control.
#[derive(Clone)]
pub struct RateLimiter {
    entries: std::sync::Arc<DashMap<String, WindowEntry>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        if config.max_requests == 0 {
            return Err(RateLimitError::InvalidConfig(
                "max_requests must be greater than zero".into(),
            ));
        }
        if config.window.is_zero() {
            return Err(RateLimitError::InvalidConfig(
                "window must be greater than zero".into(),
            ));
        }
        for policy in &config.endpoint_policies {
            if policy.max_requests == 0 || policy.window.is_zero() {
                return Err(RateLimitError::InvalidConfig(format!(
                    "endpoint policy '{}' must have positive limit and window",
                    policy.prefix
                )));
            }
        }
        Ok(Self {
            entries: std::sync::Arc::new(DashMap::new()),
            config,
        })
    }

    fn policy_for(&self, key: &str) -> (u32, Duration) {
        for policy in &self.config.endpoint_policies {
            if key.starts_with(&policy.prefix) {
                return (policy.max_requests, policy.window);
            }
        }
        (self.config.max_requests, self.config.window)
    }

    /// Admission check for `key` at the current instant.
    pub fn check(&self, key: &str) -> RateLimitResult {
        self.check_at(key, Instant::now())
    }

    /// Admission check at an explicit instant. Window semantics: expire the
    /// window first, then reject when the count is at the limit, otherwise
    /// increment and admit.
    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitResult {
        let (limit, window) = self.policy_for(key);
        // The entry guard holds the shard lock, making the whole
        // check-and-increment atomic per key.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry::new(now));

        if now.duration_since(entry.window_start) >= window {
            entry.window_start = now;
            entry.request_count = 0;
        }

        let elapsed = now.duration_since(entry.window_start);
        if entry.request_count >= limit {
            entry.last_request = now;
            counter!("payflow_rate_limit_denied_total", 1, "key" => key.to_string());
            warn!(key, limit, "rate limit exceeded");
            return RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: window - elapsed,
            };
        }

        entry.request_count += 1;
        entry.last_request = now;
        counter!("payflow_rate_limit_allowed_total", 1, "key" => key.to_string());
        RateLimitResult {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(entry.request_count),
            retry_after: window - elapsed,
        }
    }

    /// Remaining quota without consuming any.
    pub fn remaining_quota(&self, key: &str) -> u32 {
        let (limit, window) = self.policy_for(key);
        match self.entries.get(key) {
            Some(entry) => {
                if Instant::now().duration_since(entry.window_start) >= window {
                    limit
                } else {
                    limit.saturating_sub(entry.request_count)
                }
            }
            None => limit,
        }
    }

    pub fn reset(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop entries whose window has long expired. Intended for a periodic
    /// sweep on long-lived limiter instances.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|key, entry| {
            let (_, window) = self.policy_for(key);
            now.duration_since(entry.window_start) < window
        });
    }
}

/// Errors from parsing endpoint policy strings.
#[derive(Debug, Error)]
pub enum PolicyParseError {
    #[error("invalid policy format for '{spec}': expected 'endpoint:limit:window_secs', got {parts} parts")]
    InvalidFormat { spec: String, parts: usize },

    #[error("invalid limit value '{value}' in policy '{spec}': {reason}")]
    InvalidLimit {
        spec: String,
        value: String,
        reason: String,
    },

    #[error("invalid window duration '{value}' in policy '{spec}': {reason}")]
    InvalidWindow {
        spec: String,
        value: String,
        reason: String,
    },

    #[error("empty policy specification")]
    EmptySpec,

    #[error("limit must be at least 1, got {limit}")]
    LimitTooSmall { limit: u32 },

    #[error("window duration must be at least 1 second, got {window_secs}")]
    WindowTooSmall { window_secs: u64 },
}

/// Parse one endpoint policy specification.
///
/// Format: "endpoint:limit:window_secs", e.g. "stripe:start_payment:10:1"
/// uses the last two segments as limit and window.
pub fn parse_endpoint_policy(spec: &str) -> Result<EndpointPolicy, PolicyParseError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(PolicyParseError::EmptySpec);
    }

    let parts: Vec<&str> = spec.rsplitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(PolicyParseError::InvalidFormat {
            spec: spec.to_string(),
            parts: parts.len(),
        });
    }
    // rsplitn yields segments right-to-left.
    let (window_part, limit_part, endpoint) = (parts[0], parts[1], parts[2]);
    if endpoint.trim().is_empty() {
        return Err(PolicyParseError::EmptySpec);
    }

    let limit: u32 = limit_part
        .trim()
        .parse()
        .map_err(|e| PolicyParseError::InvalidLimit {
            spec: spec.to_string(),
            value: limit_part.to_string(),
            reason: format!("{}", e),
        })?;
    if limit < 1 {
        return Err(PolicyParseError::LimitTooSmall { limit });
    }

    let window_secs: u64 =
        window_part
            .trim()
            .parse()
            .map_err(|e| PolicyParseError::InvalidWindow {
                spec: spec.to_string(),
                value: window_part.to_string(),
                reason: format!("{}", e),
            })?;
    if window_secs < 1 {
        return Err(PolicyParseError::WindowTooSmall { window_secs });
    }

    Ok(EndpointPolicy {
        prefix: endpoint.trim().to_string(),
        max_requests: limit,
        window: Duration::from_secs(window_secs),
    })
}

/// Parse comma-separated endpoint policies, collecting warnings for the
/// specs that fail instead of aborting the whole list.
pub fn parse_endpoint_policies(specs: &str) -> (Vec<EndpointPolicy>, Vec<String>) {
    let mut policies = Vec::new();
    let mut warnings = Vec::new();

    for spec in specs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match parse_endpoint_policy(spec) {
            Ok(policy) => policies.push(policy),
            Err(e) => warnings.push(format!("skipping invalid endpoint policy '{}': {}", spec, e)),
        }
    }

    (policies, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window: Duration::from_millis(window_ms),
            endpoint_policies: Vec::new(),
        })
        .unwrap()
    }

    #[test]
    fn window_admits_then_rejects_then_resets() {
        let limiter = limiter(1, 1000);
        let t0 = Instant::now();

        let first = limiter.check_at("stripe:start_payment", t0);
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);

        let second = limiter.check_at("stripe:start_payment", t0 + Duration::from_millis(500));
        assert!(!second.allowed);
        assert_eq!(second.retry_after, Duration::from_millis(500));

        let third = limiter.check_at("stripe:start_payment", t0 + Duration::from_millis(1001));
        assert!(third.allowed, "fresh window must admit");
    }

    #[test]
    fn keys_are_tracked_independently() {
        let limiter = limiter(1, 60_000);
        let t0 = Instant::now();
        assert!(limiter.check_at("stripe:start_payment", t0).allowed);
        assert!(limiter.check_at("paypal:start_payment", t0).allowed);
        assert!(!limiter.check_at("stripe:start_payment", t0).allowed);
        assert!(!limiter.check_at("paypal:start_payment", t0).allowed);
    }

    #[test]
    fn endpoint_policy_overrides_global_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 100,
            window: Duration::from_secs(60),
            endpoint_policies: vec![EndpointPolicy {
                prefix: "stripe:".into(),
                max_requests: 1,
                window: Duration::from_secs(60),
            }],
        })
        .unwrap();
        let t0 = Instant::now();
        assert!(limiter.check_at("stripe:confirm_payment", t0).allowed);
        assert!(!limiter.check_at("stripe:confirm_payment", t0).allowed);
        assert!(limiter.check_at("paypal:confirm_payment", t0).allowed);
    }

    #[test]
    fn remaining_quota_does_not_consume() {
        let limiter = limiter(5, 60_000);
        assert_eq!(limiter.remaining_quota("k"), 5);
        limiter.check("k");
        assert_eq!(limiter.remaining_quota("k"), 4);
        assert_eq!(limiter.remaining_quota("k"), 4);
    }

    #[test]
    fn zero_config_is_rejected() {
        assert!(RateLimiter::new(RateLimitConfig {
            max_requests: 0,
            ..Default::default()
        })
        .is_err());
        assert!(RateLimiter::new(RateLimitConfig {
            window: Duration::ZERO,
            ..Default::default()
        })
        .is_err());
    }

    mod policy_parsing {
        use super::*;

        #[test]
        fn parses_valid_policy() {
            let policy = parse_endpoint_policy("stripe:start_payment:10:1").unwrap();
            assert_eq!(policy.prefix, "stripe:start_payment");
            assert_eq!(policy.max_requests, 10);
            assert_eq!(policy.window, Duration::from_secs(1));
        }

        #[test]
        fn rejects_bad_formats() {
            assert!(matches!(
                parse_endpoint_policy("start_payment:10"),
                Err(PolicyParseError::InvalidFormat { .. })
            ));
            assert!(matches!(
                parse_endpoint_policy("start_payment:abc:1"),
                Err(PolicyParseError::InvalidLimit { .. })
            ));
            assert!(matches!(
                parse_endpoint_policy("start_payment:0:1"),
                Err(PolicyParseError::LimitTooSmall { .. })
            ));
            assert!(matches!(
                parse_endpoint_policy("start_payment:10:0"),
                Err(PolicyParseError::WindowTooSmall { .. })
            ));
            assert!(matches!(
                parse_endpoint_policy(""),
                Err(PolicyParseError::EmptySpec)
            ));
        }

        #[test]
        fn collects_warnings_for_invalid_entries() {
            let (policies, warnings) =
                parse_endpoint_policies("a:10:1,broken,b:20:2");
            assert_eq!(policies.len(), 2);
            assert_eq!(warnings.len(), 1);
            assert!(warnings[0].contains("broken"));
        }
    }
}
