//! Rate-limit scope registry (§6): the server-side throttle groups this
//! client knows about, their published hard limits and burst sizes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A server-side throttle group. The set is closed: the core does not
/// invent new scopes, it only consumes what the control plane documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    User,
    JobSubmission,
    JobsUsage,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::JobSubmission => "job-submission",
            Scope::JobsUsage => "jobs-usage",
        }
    }

    pub fn limits(self) -> ScopeLimits {
        match self {
            Scope::User => ScopeLimits {
                hard_limit: 2.0,
                target: 1.7,
                burst: 150,
            },
            Scope::JobSubmission => ScopeLimits {
                hard_limit: 0.278,
                target: 0.236,
                burst: 50,
            },
            Scope::JobsUsage => ScopeLimits {
                hard_limit: 25.0,
                target: 21.25,
                burst: 300,
            },
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Scope::User),
            "job-submission" => Ok(Scope::JobSubmission),
            "jobs-usage" => Ok(Scope::JobsUsage),
            other => anyhow::bail!("unknown rate-limit scope {other:?}"),
        }
    }
}

/// Published quota for a [`Scope`]: req/s hard limit, the 85% target rate
/// leases are carved out of, and the local token-bucket burst size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeLimits {
    pub hard_limit: f64,
    pub target: f64,
    pub burst: u32,
}

/// Identifies an authoritative token bucket: `{baseURL, hash(apiKey)[:8], scope}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub base_url: String,
    pub key_hash: String,
    pub scope: Scope,
}

impl BucketKey {
    pub fn new(base_url: impl Into<String>, api_key: &str, scope: Scope) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        let digest = hasher.finalize();
        let key_hash = hex::encode(&digest[..4]); // [:8] hex chars == 4 bytes
        Self {
            base_url: base_url.into(),
            key_hash,
            scope,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.base_url, self.key_hash, self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_string_form_matches_wire_format() {
        let key = BucketKey::new("https://api.example.com", "secret-key", Scope::JobsUsage);
        let rendered = key.to_string();
        assert_eq!(rendered.matches('|').count(), 2);
        assert!(rendered.ends_with("|jobs-usage"));
    }

    #[test]
    fn key_hash_is_eight_hex_chars() {
        let key = BucketKey::new("https://x", "abc", Scope::User);
        assert_eq!(key.key_hash.len(), 8);
    }

    #[test]
    fn scope_round_trips_through_str() {
        for scope in [Scope::User, Scope::JobSubmission, Scope::JobsUsage] {
            let parsed: Scope = scope.as_str().parse().unwrap();
            assert_eq!(parsed, scope);
        }
    }
}
