//! Dynamic host-API policy evaluation (§4.4, §9): allow-lists, rate limits,
//! and conditional access evaluated over a request/auth/env context object,
//! layered on top of each capability's own code-level bounds checks.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    config::HostApiConfig,
    error::{Error, PolicyError, Result},
};

/// Request/auth/env context a [`DynamicPolicy`] evaluates against. Built
/// fresh per `host_execute` call from the worker's [`HostApiConfig`] plus
/// whatever the capability call itself carries (e.g. the `state` key being
/// accessed).
#[derive(Clone, Debug)]
pub struct PolicyContext {
    pub service_name: String,
    pub namespace: String,
    pub env: HashMap<String, String>,
    pub auth_claims: HashMap<String, String>,
    /// The resource the call targets, if the capability has one (a `state`
    /// key, an `http` URL, a `queue` topic, ...). `None` for verbs with no
    /// single addressable resource.
    pub resource: Option<String>,
}

impl PolicyContext {
    #[must_use]
    pub fn new(config: &HostApiConfig, resource: Option<String>) -> Self {
        Self {
            service_name: config.service_name.clone(),
            namespace: config.namespace.clone(),
            env: config.env.clone(),
            auth_claims: config.auth_claims.clone(),
            resource,
        }
    }
}

/// Evaluates whether a capability call is permitted beyond its code-level
/// bounds. The default implementation is a declarative glob-style allow-list
/// matcher (§4.4: `"app:*"`-shaped prefixes).
pub trait DynamicPolicy: Send + Sync + 'static {
    fn check(&self, capability: &str, method: &str, ctx: &PolicyContext) -> Result<()>;
}

/// Glob-style prefix matcher: a pattern `"app:*"` allows any resource
/// starting with `"app:"`; a bare pattern with no `*` must match exactly.
/// A capability with no configured rules is allowed by default.
#[derive(Clone, Debug, Default)]
pub struct AllowListPolicy {
    rules: HashMap<&'static str, Vec<String>>,
}

impl AllowListPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow(mut self, capability: &'static str, pattern: impl Into<String>) -> Self {
        self.rules.entry(capability).or_default().push(pattern.into());
        self
    }

    fn pattern_matches(pattern: &str, resource: &str) -> bool {
        pattern
            .strip_suffix('*')
            .map_or(pattern == resource, |prefix| resource.starts_with(prefix))
    }
}

impl DynamicPolicy for AllowListPolicy {
    fn check(&self, capability: &str, _method: &str, ctx: &PolicyContext) -> Result<()> {
        let Some(patterns) = self.rules.get(capability) else {
            return Ok(());
        };
        let resource = ctx.resource.as_deref().unwrap_or("");
        if patterns
            .iter()
            .any(|pattern| Self::pattern_matches(pattern, resource))
        {
            Ok(())
        } else {
            Err(Error::Policy(PolicyError::Denied(
                capability.to_string(),
                format!("`{resource}` is not allow-listed"),
            )))
        }
    }
}

/// Permits every call. The default when no policy is configured for a
/// deployment.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllPolicy;

impl DynamicPolicy for AllowAllPolicy {
    fn check(&self, _capability: &str, _method: &str, _ctx: &PolicyContext) -> Result<()> {
        Ok(())
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-`(service, capability)` token bucket. One shared instance backs an
/// entire [`crate::host::HostApiMediator`]; callers across workers of the
/// same service share the same budget, matching the spec's rate-limit
/// scope (§4.4).
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Unlimited: every call is admitted. Used as the default when a
    /// deployment configures no rate limit.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY)
    }

    pub fn check(&self, key: &str) -> Result<()> {
        if self.capacity.is_infinite() {
            return Ok(());
        }
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Error::Policy(PolicyError::RateLimited(key.to_string())))
        }
    }
}

/// Rejects access to keys/resources carrying a reserved prefix (e.g. the
/// `okra:` namespace used internally by the runtime).
#[must_use]
pub fn reject_reserved_prefix(key: &str, reserved: &[&str]) -> Result<()> {
    for prefix in reserved {
        if key.starts_with(prefix) {
            return Err(Error::Policy(PolicyError::ReservedKey(key.to_string())));
        }
    }
    Ok(())
}

#[must_use = "callers must propagate the size-limit error"]
pub fn check_size_limit(actual: usize, limit: usize) -> Result<()> {
    if actual > limit {
        Err(Error::Policy(PolicyError::SizeLimitExceeded { actual, limit }))
    } else {
        Ok(())
    }
}

#[must_use = "callers must propagate the bounds error"]
pub fn check_duration_bounds(value: Duration, min: Duration, max: Duration) -> Result<()> {
    if value < min || value > max {
        Err(Error::Policy(PolicyError::OutOfBounds(format!(
            "{value:?} not in [{min:?}, {max:?}]"
        ))))
    } else {
        Ok(())
    }
}

/// A capability call's JSON params didn't match what the verb expects.
/// Malformed/out-of-range params are code-level policy violations (§4.4),
/// not a distinct error kind.
#[must_use]
pub fn invalid_params(message: impl Into<String>) -> Error {
    Error::Policy(PolicyError::OutOfBounds(message.into()))
}

const KEY_CHARSET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789:_.-";

#[must_use = "callers must propagate the charset error"]
pub fn check_key_charset(key: &str) -> Result<()> {
    if key.is_empty() || !key.chars().all(|c| KEY_CHARSET.contains(c)) {
        Err(Error::Policy(PolicyError::OutOfBounds(format!(
            "key `{key}` contains characters outside the allowed charset"
        ))))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(resource: &str) -> PolicyContext {
        PolicyContext {
            service_name: "svc".to_string(),
            namespace: "default".to_string(),
            env: HashMap::new(),
            auth_claims: HashMap::new(),
            resource: Some(resource.to_string()),
        }
    }

    #[test]
    fn allow_list_permits_matching_prefix() {
        let policy = AllowListPolicy::new().allow("state", "app:*");
        assert!(policy.check("state", "get", &ctx("app:settings")).is_ok());
    }

    #[test]
    fn allow_list_denies_non_matching_resource() {
        let policy = AllowListPolicy::new().allow("state", "app:*");
        let err = policy.check("state", "get", &ctx("secret:token")).unwrap_err();
        assert!(matches!(err, Error::Policy(PolicyError::Denied(_, _))));
    }

    #[test]
    fn capability_without_rules_is_allowed() {
        let policy = AllowListPolicy::new().allow("state", "app:*");
        assert!(policy.check("log", "emit", &ctx("anything")).is_ok());
    }

    #[test]
    fn reserved_prefix_is_rejected() {
        let err = reject_reserved_prefix("okra:internal", &["okra:"]).unwrap_err();
        assert!(matches!(err, Error::Policy(PolicyError::ReservedKey(_))));
    }

    #[test]
    fn size_limit_enforced() {
        assert!(check_size_limit(10, 100).is_ok());
        assert!(check_size_limit(200, 100).is_err());
    }

    #[test]
    fn rate_limiter_exhausts_then_recovers_over_time() {
        let limiter = RateLimiter::new(1.0, 1000.0);
        assert!(limiter.check("svc:state").is_ok());
        assert!(limiter.check("svc:state").is_err());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.check("svc:state").is_ok());
    }

    #[test]
    fn unlimited_rate_limiter_never_denies() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..100 {
            assert!(limiter.check("svc:state").is_ok());
        }
    }
}
