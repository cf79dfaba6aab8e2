use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::envelope::error_message;
use crate::error::{AppError, AppResult};

/// Classify an HTTP response and return its JSON body.
///
/// 401/403 become authentication rejections, other non-2xx statuses become
/// `Remote` errors carrying the server's message. An empty 2xx body is `null`.
pub async fn read_json(resp: Response) -> AppResult<Value> {
    let status = resp.status();
    let url = resp.url().path().to_string();
    let text = resp.text().await?;
    let body: Option<Value> = if text.trim().is_empty() { None } else { serde_json::from_str(&text).ok() };
    debug!(target: "galley::http", "{} -> {}", url, status.as_u16());

    if status.is_success() {
        return match body {
            Some(v) => Ok(v),
            None if text.trim().is_empty() => Ok(Value::Null),
            None => Err(AppError::internal("invalid_response".to_string(), format!("{url}: response body is not JSON"))),
        };
    }

    let message = body
        .as_ref()
        .and_then(error_message)
        .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()))
        .unwrap_or_else(|| format!("API request failed with status {}", status.as_u16()));

    Err(classify_status(status, message))
}

pub fn classify_status(status: StatusCode, message: String) -> AppError {
    match status {
        StatusCode::UNAUTHORIZED => AppError::auth("unauthorized".to_string(), message),
        StatusCode::FORBIDDEN => AppError::auth("forbidden".to_string(), message),
        StatusCode::NOT_FOUND => AppError::remote(status.as_u16(), "not_found".to_string(), message),
        s if s.is_client_error() => AppError::remote(s.as_u16(), "rejected".to_string(), message),
        s => AppError::remote(s.as_u16(), "remote_error".to_string(), message),
    }
}
