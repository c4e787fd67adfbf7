//! Webhook authentication and rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use base64::Engine;
use hmac::{Hmac, Mac};
use regex::Regex;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::webhook::models::WebhookEntry;

const WINDOW: Duration = Duration::from_secs(60);

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Check an `Authorization: Bearer <token>` header value.
///
/// Comparison is constant-time to prevent timing attacks.
pub fn validate_bearer_token(authorization: &str, expected_token: &str) -> bool {
    let Some(provided) = authorization.strip_prefix("Bearer ") else {
        warn!("Auth failed: invalid token");
        return false;
    };
    let valid = constant_time_eq(provided, expected_token);
    if !valid {
        warn!("Auth failed: invalid token");
    }
    valid
}

/// HMAC parameters extracted from a hook entry.
pub struct HmacParams<'a> {
    pub secret: &'a str,
    pub algorithm: &'a str,
    pub encoding: &'a str,
    pub sig_prefix: &'a str,
    pub sig_regex: &'a str,
    pub payload_prefix_regex: &'a str,
}

/// Validate an HMAC signature with fully configurable parameters.
///
/// The signature is extracted from `signature_value` via regex (group 1)
/// when configured, else by stripping the prefix. The signed payload is
/// `<extracted-prefix>.<body>` when a payload-prefix regex matches
/// (Stripe/Slack style), else the body alone.
pub fn validate_hmac_signature(body: &[u8], signature_value: &str, params: &HmacParams) -> bool {
    if signature_value.is_empty() || params.secret.is_empty() {
        warn!("HMAC auth failed: missing signature or secret");
        return false;
    }

    let sig = if !params.sig_regex.is_empty() {
        match Regex::new(params.sig_regex)
            .ok()
            .and_then(|re| re.captures(signature_value))
            .and_then(|caps| caps.get(1))
        {
            Some(m) if !m.as_str().is_empty() => m.as_str().to_string(),
            _ => {
                warn!("HMAC auth failed: sig_regex did not match");
                return false;
            }
        }
    } else if !params.sig_prefix.is_empty() {
        signature_value
            .strip_prefix(params.sig_prefix)
            .unwrap_or(signature_value)
            .to_string()
    } else {
        signature_value.to_string()
    };

    let mut signed_payload = body.to_vec();
    if !params.payload_prefix_regex.is_empty() {
        if let Some(prefix) = Regex::new(params.payload_prefix_regex)
            .ok()
            .and_then(|re| re.captures(signature_value))
            .and_then(|caps| caps.get(1))
            .filter(|m| !m.as_str().is_empty())
        {
            let mut combined = prefix.as_str().as_bytes().to_vec();
            combined.push(b'.');
            combined.extend_from_slice(body);
            signed_payload = combined;
        }
    }

    let digest = compute_hmac(params.algorithm, params.secret, &signed_payload);

    let expected = if params.encoding == "base64" {
        base64::engine::general_purpose::STANDARD.encode(&digest)
    } else {
        hex::encode(&digest)
    };

    let valid = constant_time_eq(&sig, &expected);
    if !valid {
        warn!(
            algorithm = params.algorithm,
            encoding = params.encoding,
            "HMAC auth failed: signature mismatch"
        );
    }
    valid
}

fn compute_hmac(algorithm: &str, secret: &str, payload: &[u8]) -> Vec<u8> {
    match algorithm {
        "sha1" => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts any key length");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        "sha512" => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts any key length");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        _ => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts any key length");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Per-hook authentication dispatcher.
///
/// `hmac` mode validates the configured signature; `bearer` (and any
/// unrecognized mode) validates the per-hook token with global fallback.
pub fn validate_hook_auth(
    hook: &WebhookEntry,
    authorization: &str,
    signature_header_value: &str,
    body: &[u8],
    global_token: &str,
) -> bool {
    if hook.auth_mode == "hmac" {
        return validate_hmac_signature(
            body,
            signature_header_value,
            &HmacParams {
                secret: &hook.hmac_secret,
                algorithm: &hook.hmac_algorithm,
                encoding: &hook.hmac_encoding,
                sig_prefix: &hook.hmac_sig_prefix,
                sig_regex: &hook.hmac_sig_regex,
                payload_prefix_regex: &hook.hmac_payload_prefix_regex,
            },
        );
    }

    let expected = if hook.token.is_empty() {
        global_token
    } else {
        &hook.token
    };
    if expected.is_empty() {
        warn!(hook = %hook.id, "Auth failed: no token configured");
        return false;
    }
    validate_bearer_token(authorization, expected)
}

/// Sliding-window rate limiter over a bounded timestamp deque.
pub struct RateLimiter {
    max_per_minute: usize,
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            timestamps: VecDeque::new(),
        }
    }

    /// Return true if the request is allowed, false if rate-limited.
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        while self
            .timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) > WINDOW)
        {
            self.timestamps.pop_front();
        }
        let remaining = self.max_per_minute.saturating_sub(self.timestamps.len());
        debug!(remaining, "Rate limit check");
        if remaining == 0 {
            warn!("Rate limit exceeded");
            return false;
        }
        self.timestamps.push_back(now);
        true
    }

    pub fn reset(&mut self) {
        self.timestamps.clear();
    }
}
