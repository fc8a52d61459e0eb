//! Security core (C2): HMAC verification, timestamp window, nonce replay
//! protection, per-device lockout, and per-device rate limiting.
//!
//! All state is per-gateway, in-memory, guarded by a single mutex. The
//! nonce cache is FIFO-by-count rather than time-based cleanup, keeping
//! eviction bounded without a background sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureReason {
    LockedOut,
    InvalidFormat,
    InvalidSignature,
    InvalidJson,
    InvalidTimestamp,
    ReplayAttack,
    RateLimited,
}

impl AuthFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockedOut => "locked_out",
            Self::InvalidFormat => "invalid_format",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidJson => "invalid_json",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::ReplayAttack => "replay_attack",
            Self::RateLimited => "rate_limited",
        }
    }
}

struct LockoutState {
    failed_attempts: u32,
    locked_until: Option<Instant>,
}

impl Default for LockoutState {
    fn default() -> Self {
        Self {
            failed_attempts: 0,
            locked_until: None,
        }
    }
}

struct RateLimitState {
    window_start: Instant,
    count: u32,
}

pub struct SecurityConfig {
    pub ts_tolerance_s: i64,
    pub nonce_cache_size: usize,
    pub max_failed_attempts: u32,
    pub lockout_duration_s: u64,
    pub rate_limit_window_s: u64,
    pub rate_limit_max_requests: u32,
}

struct Inner {
    lockouts: HashMap<String, LockoutState>,
    rate_limits: HashMap<String, RateLimitState>,
    nonce_seen: VecDeque<i64>,
    nonce_set: std::collections::HashSet<i64>,
    total_failed_attempts: u64,
}

/// The per-gateway security core. Cheap to clone (an `Arc` wrapper is
/// expected at the call site); internally a single `Mutex` guards all state.
pub struct SecurityCore {
    config: SecurityConfig,
    key: Vec<u8>,
    inner: Mutex<Inner>,
}

impl SecurityCore {
    pub fn new(key: Vec<u8>, config: SecurityConfig) -> Self {
        Self {
            config,
            key,
            inner: Mutex::new(Inner {
                lockouts: HashMap::new(),
                rate_limits: HashMap::new(),
                nonce_seen: VecDeque::new(),
                nonce_set: std::collections::HashSet::new(),
                total_failed_attempts: 0,
            }),
        }
    }

    pub fn compute_hmac(&self, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(body.as_bytes());
        hex_lower(&mac.finalize().into_bytes())
    }

    /// `verify_hmac(body, received_hex, key)`: constant-time comparison of
    /// the exact body string's HMAC-SHA-256 against the provided hex digest.
    pub fn verify_hmac(&self, body: &str, received_hex: &str) -> bool {
        let expected = self.compute_hmac(body);
        let Ok(expected_bytes) = hex_decode(&expected) else {
            return false;
        };
        let Ok(received_bytes) = hex_decode(received_hex) else {
            return false;
        };
        if expected_bytes.len() != received_bytes.len() {
            return false;
        }
        expected_bytes.ct_eq(&received_bytes).into()
    }

    /// Device clock must be within `ts_tolerance_s` of wall clock.
    pub fn validate_timestamp(&self, ts: i64) -> bool {
        let now = unix_now();
        (now - ts).abs() <= self.config.ts_tolerance_s
    }

    /// Returns true iff `n` is not already in the bounded FIFO nonce set,
    /// inserting it atomically with the check. Oldest entries are evicted
    /// once the cache reaches `nonce_cache_size`.
    pub fn validate_nonce(&self, n: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.nonce_set.contains(&n) {
            return false;
        }
        inner.nonce_set.insert(n);
        inner.nonce_seen.push_back(n);
        if inner.nonce_seen.len() > self.config.nonce_cache_size {
            if let Some(evicted) = inner.nonce_seen.pop_front() {
                inner.nonce_set.remove(&evicted);
            }
        }
        true
    }

    pub fn is_locked_out(&self, device_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.lockouts.get_mut(device_id) {
            Some(state) => match state.locked_until {
                Some(until) if Instant::now() >= until => {
                    state.locked_until = None;
                    state.failed_attempts = 0;
                    false
                }
                Some(_) => true,
                None => false,
            },
            None => false,
        }
    }

    /// Returns whether this attempt triggered a fresh lockout.
    pub fn record_failed_attempt(&self, device_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.total_failed_attempts += 1;
        let state = inner.lockouts.entry(device_id.to_string()).or_default();
        state.failed_attempts += 1;
        if state.failed_attempts >= self.config.max_failed_attempts && state.locked_until.is_none()
        {
            state.locked_until =
                Some(Instant::now() + Duration::from_secs(self.config.lockout_duration_s));
            return true;
        }
        false
    }

    pub fn record_success(&self, device_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.lockouts.remove(device_id);
    }

    /// Sliding 60 s / 10-request-per-device ceiling carried over from the
    /// original `check_rate_limit`. Fails open: an internal error never
    /// denies a request on rate-limiting grounds alone.
    pub fn check_rate_limit(&self, device_id: &str) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return true;
        };
        let window = Duration::from_secs(self.config.rate_limit_window_s);
        let now = Instant::now();
        let state = inner
            .rate_limits
            .entry(device_id.to_string())
            .or_insert_with(|| RateLimitState {
                window_start: now,
                count: 0,
            });
        if now.duration_since(state.window_start) >= window {
            state.window_start = now;
            state.count = 0;
        }
        state.count += 1;
        state.count <= self.config.rate_limit_max_requests
    }

    pub fn statistics(&self) -> SecurityStats {
        let inner = self.inner.lock().unwrap();
        SecurityStats {
            active_lockouts: inner
                .lockouts
                .values()
                .filter(|s| s.locked_until.is_some())
                .count(),
            nonce_cache_size: inner.nonce_seen.len(),
            total_failed_attempts: inner.total_failed_attempts,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SecurityStats {
    pub active_lockouts: usize,
    pub nonce_cache_size: usize,
    pub total_failed_attempts: u64,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

fn default_config() -> SecurityConfig {
    SecurityConfig {
        ts_tolerance_s: 300,
        nonce_cache_size: 1000,
        max_failed_attempts: 5,
        lockout_duration_s: 300,
        rate_limit_window_s: 60,
        rate_limit_max_requests: 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> SecurityCore {
        SecurityCore::new(vec![0u8; 32], default_config())
    }

    #[test]
    fn hmac_round_trips_and_rejects_tampering() {
        let sec = core();
        let body = r#"{"cmd":"unlock_request"}"#;
        let mac = sec.compute_hmac(body);
        assert!(sec.verify_hmac(body, &mac));
        assert!(!sec.verify_hmac("tampered", &mac));

        let other = SecurityCore::new(vec![1u8; 32], default_config());
        assert!(!other.verify_hmac(body, &mac));
    }

    #[test]
    fn nonce_is_single_use_until_evicted() {
        let sec = SecurityCore::new(
            vec![0u8; 32],
            SecurityConfig {
                nonce_cache_size: 2,
                ..default_config()
            },
        );
        assert!(sec.validate_nonce(1));
        assert!(!sec.validate_nonce(1));
        assert!(sec.validate_nonce(2));
        assert!(sec.validate_nonce(3)); // evicts nonce 1 (FIFO, cache size 2)
        assert!(sec.validate_nonce(1)); // 1 was evicted, so it is accepted again
    }

    #[test]
    fn lockout_triggers_after_max_attempts_and_clears_on_success() {
        let sec = SecurityCore::new(
            vec![0u8; 32],
            SecurityConfig {
                max_failed_attempts: 3,
                lockout_duration_s: 300,
                ..default_config()
            },
        );
        assert!(!sec.is_locked_out("dev1"));
        assert!(!sec.record_failed_attempt("dev1"));
        assert!(!sec.record_failed_attempt("dev1"));
        assert!(sec.record_failed_attempt("dev1"));
        assert!(sec.is_locked_out("dev1"));

        sec.record_success("dev1");
        assert!(!sec.is_locked_out("dev1"));
    }

    #[test]
    fn timestamp_outside_tolerance_is_rejected() {
        let sec = core();
        let now = unix_now();
        assert!(sec.validate_timestamp(now));
        assert!(!sec.validate_timestamp(now - 1000));
    }

    #[test]
    fn rate_limit_fails_closed_within_window_then_resets() {
        let sec = SecurityCore::new(
            vec![0u8; 32],
            SecurityConfig {
                rate_limit_window_s: 60,
                rate_limit_max_requests: 2,
                ..default_config()
            },
        );
        assert!(sec.check_rate_limit("dev1"));
        assert!(sec.check_rate_limit("dev1"));
        assert!(!sec.check_rate_limit("dev1"));
    }
}
