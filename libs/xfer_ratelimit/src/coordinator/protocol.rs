//! Newline-delimited JSON wire protocol (spec §6). Each client
//! connection sends one request and reads one response; `Acquire` is
//! retried by the client issuing a fresh `Acquire` after sleeping out a
//! `Wait` response, not by holding the connection open.

use super::lease::LeaseGrant;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use xfer_utils::Scope;

/// Every request carries enough to identify the bucket
/// (`{base_url, key_hash, scope}`) and the requesting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketIdentity {
    pub client_id: String,
    pub scope: Scope,
    pub base_url: String,
    pub key_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Acquire(BucketIdentity),
    AcquireLease(BucketIdentity),
    Drain(BucketIdentity),
    SetCooldown {
        #[serde(flatten)]
        identity: BucketIdentity,
        #[serde(with = "humantime_serde")]
        cooldown_duration: Duration,
    },
    Heartbeat {
        client_id: String,
        lease_id: String,
    },
    GetState {
        scope: Scope,
        base_url: String,
        key_hash: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStateSnapshot {
    pub tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Granted,
    Wait {
        #[serde(with = "humantime_serde")]
        wait_duration: Duration,
    },
    LeaseGranted {
        lease: LeaseGrant,
    },
    Ok,
    StateData {
        state: BucketStateSnapshot,
    },
    Error {
        error: String,
    },
}

/// Encode one message as a single JSON line (no embedded newlines: JSON
/// strings escape them, so this always holds).
pub fn encode_line<T: Serialize>(message: &T) -> anyhow::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> anyhow::Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json_line() {
        let req = Request::Acquire(BucketIdentity {
            client_id: "pid-123".into(),
            scope: Scope::User,
            base_url: "https://api.example.com".into(),
            key_hash: "deadbeef".into(),
        });
        let line = encode_line(&req).unwrap();
        assert!(line.ends_with('\n'));
        let decoded: Request = decode_line(&line).unwrap();
        match decoded {
            Request::Acquire(id) => assert_eq!(id.client_id, "pid-123"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_wait_round_trips() {
        let resp = Response::Wait {
            wait_duration: Duration::from_millis(1500),
        };
        let line = encode_line(&resp).unwrap();
        let decoded: Response = decode_line(&line).unwrap();
        match decoded {
            Response::Wait { wait_duration } => assert_eq!(wait_duration, Duration::from_millis(1500)),
            _ => panic!("wrong variant"),
        }
    }
}
