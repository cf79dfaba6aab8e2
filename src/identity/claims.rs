//! Session token codec.
//!
//! Tokens are three dot-separated base64url segments. Only the middle (payload)
//! segment is read; the signature is never checked here because the issuer is
//! the one that verifies it on the next real API call.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::AppError;

const INDIFFERENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, INDIFFERENT);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, INDIFFERENT);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("token has {0} segments, expected 3")]
    SegmentCount(usize),
    #[error("payload segment is not valid base64url")]
    Base64,
    #[error("payload is not a JSON object: {0}")]
    Json(String),
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        let code = match err {
            DecodeError::SegmentCount(_) => "bad_segments",
            DecodeError::Base64 => "bad_base64",
            DecodeError::Json(_) => "bad_json",
        };
        AppError::Decode { code: code.into(), message: err.to_string() }
    }
}

/// Claims carried in a session token payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Claims {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub role: Option<String>,
    /// Raw `exp` claim, seconds or milliseconds depending on the issuing path.
    pub exp: Option<f64>,
}

pub fn decode_claims(token: &str) -> Result<Claims, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return Err(DecodeError::SegmentCount(segments.len()));
    };
    let bytes = URL_SAFE_LENIENT
        .decode(payload)
        .or_else(|_| STANDARD_LENIENT.decode(payload))
        .map_err(|_| DecodeError::Base64)?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|e| DecodeError::Json(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(DecodeError::Json("payload is not an object".into()));
    };
    Ok(Claims {
        user_id: first_string(&map, &["userId", "_id", "id", "sub"]),
        tenant_id: first_string(&map, &["tenantId"]),
        role: first_string(&map, &["role"]),
        exp: map.get("exp").and_then(Value::as_f64),
    })
}

// Ids sometimes arrive as numbers.
fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match map.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
