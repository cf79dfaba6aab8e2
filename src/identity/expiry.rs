use std::fmt::{Display, Formatter};
use std::str::FromStr;

use super::claims::{decode_claims, Claims};

/// What to do with a token whose payload has no `exp` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingExp {
    /// Some issuing paths omit `exp`; trust the server to reject such tokens later.
    #[default]
    NeverExpires,
    Expired,
}

impl FromStr for MissingExp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" | "never_expires" => Ok(MissingExp::NeverExpires),
            "expired" => Ok(MissingExp::Expired),
            other => Err(format!("unknown missing-exp policy '{other}' (expected never|expired)")),
        }
    }
}

impl Display for MissingExp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MissingExp::NeverExpires => write!(f, "never"),
            MissingExp::Expired => write!(f, "expired"),
        }
    }
}

/// Local expiry decision for session tokens.
///
/// A token is expired once `now >= exp - buffer_secs`, so it is refreshed a
/// little before the server would start rejecting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub buffer_secs: i64,
    pub missing_exp: MissingExp,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self { buffer_secs: crate::config::DEFAULT_REFRESH_BUFFER_SECS, missing_exp: MissingExp::NeverExpires }
    }
}

impl ExpiryPolicy {
    pub fn is_expired_at(&self, claims: &Claims, now_secs: i64) -> bool {
        let Some(exp) = claims.exp else {
            return self.missing_exp == MissingExp::Expired;
        };
        let exp = normalize_exp(exp, now_secs);
        let now = now_secs as f64;
        now - (exp - self.buffer_secs as f64) >= 0.0
    }

    /// Unix second from which `is_expired_at` answers true. None without `exp`.
    pub fn expires_at(&self, claims: &Claims, now_secs: i64) -> Option<f64> {
        let exp = normalize_exp(claims.exp?, now_secs);
        Some(exp - self.buffer_secs as f64)
    }

    pub fn is_expired(&self, claims: &Claims) -> bool {
        self.is_expired_at(claims, now_secs())
    }

    /// Decode and evaluate in one step. An undecodable token counts as expired.
    pub fn token_expired(&self, token: &str) -> bool {
        match decode_claims(token) {
            Ok(c) => self.is_expired(&c),
            Err(_) => true,
        }
    }
}

/// Issuers disagree on `exp` units: anything more than ~100x "now in seconds"
/// is taken to be milliseconds.
// TODO: drop once the issuer is confirmed to always send seconds.
pub fn normalize_exp(exp: f64, now_secs: i64) -> f64 {
    if exp > (now_secs as f64) * 100.0 {
        exp / 1000.0
    } else {
        exp
    }
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
