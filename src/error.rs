//! Unified error model for the session layer and the HTTP boundary.
//! Every failure carries a stable `code` plus a human message, and maps to one
//! `ErrorKind` so callers can pick a message without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Decode,
    Expired,
    Auth,
    Network,
    Validation,
    Remote,
    Storage,
    Internal,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    #[error("{code}: {message}")]
    Decode { code: String, message: String },
    #[error("{code}: {message}")]
    Expired { code: String, message: String },
    #[error("{code}: {message}")]
    Auth { code: String, message: String },
    #[error("{code}: {message}")]
    Network { code: String, message: String },
    #[error("{code}: {message}")]
    Validation { code: String, message: String },
    #[error("{code} (HTTP {status}): {message}")]
    Remote { status: u16, code: String, message: String },
    #[error("{code}: {message}")]
    Storage { code: String, message: String },
    #[error("{code}: {message}")]
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Decode { code, .. }
            | AppError::Expired { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Network { code, .. }
            | AppError::Validation { code, .. }
            | AppError::Remote { code, .. }
            | AppError::Storage { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Decode { message, .. }
            | AppError::Expired { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Network { message, .. }
            | AppError::Validation { message, .. }
            | AppError::Remote { message, .. }
            | AppError::Storage { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Decode { .. } => ErrorKind::Decode,
            AppError::Expired { .. } => ErrorKind::Expired,
            AppError::Auth { .. } => ErrorKind::Auth,
            AppError::Network { .. } => ErrorKind::Network,
            AppError::Validation { .. } => ErrorKind::Validation,
            AppError::Remote { .. } => ErrorKind::Remote,
            AppError::Storage { .. } => ErrorKind::Storage,
            AppError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn decode<S: Into<String>>(code: S, msg: S) -> Self { AppError::Decode { code: code.into(), message: msg.into() } }
    pub fn expired<S: Into<String>>(code: S, msg: S) -> Self { AppError::Expired { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn network<S: Into<String>>(code: S, msg: S) -> Self { AppError::Network { code: code.into(), message: msg.into() } }
    pub fn validation<S: Into<String>>(code: S, msg: S) -> Self { AppError::Validation { code: code.into(), message: msg.into() } }
    pub fn remote<S: Into<String>>(status: u16, code: S, msg: S) -> Self { AppError::Remote { status, code: code.into(), message: msg.into() } }
    pub fn storage<S: Into<String>>(code: S, msg: S) -> Self { AppError::Storage { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// True for a 401/403 from the server or a call made with no usable session.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, AppError::Auth { .. } | AppError::Expired { .. })
    }

    /// HTTP status behind the error, when one exists.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            AppError::Remote { status, .. } => Some(*status),
            AppError::Auth { code, .. } if code == "forbidden" => Some(403),
            AppError::Auth { code, .. } if code == "unauthorized" => Some(401),
            _ => None,
        }
    }

    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Decode { .. } | AppError::Expired { .. } | AppError::Auth { .. } => {
                "Your session has ended. Please sign in again.".to_string()
            }
            AppError::Network { .. } => {
                "Unable to connect to the server. Please check your connection or whether the server is running.".to_string()
            }
            AppError::Validation { message, .. } | AppError::Remote { message, .. } => message.clone(),
            AppError::Storage { .. } | AppError::Internal { .. } => "Something went wrong. Please try again.".to_string(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return AppError::internal("decode_response".to_string(), err.to_string());
        }
        if err.is_timeout() {
            return AppError::network("timeout".to_string(), err.to_string());
        }
        if err.is_connect() {
            return AppError::network("unreachable".to_string(), err.to_string());
        }
        if err.is_builder() {
            return AppError::internal("bad_request".to_string(), err.to_string());
        }
        // request/body/redirect failures all happen below the HTTP status line
        AppError::network("transport".to_string(), err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal { code: "json".into(), message: err.to_string() }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage { code: "io".into(), message: err.to_string() }
    }
}
