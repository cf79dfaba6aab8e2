use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::envelope;
use super::response::read_json;
use crate::allergen::{Allergen, IngredientCheck};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::{SessionManager, UserProfile, MIN_PASSWORD_LEN};

/// Authenticated access to the platform API. Every request goes through
/// `SessionManager::guarded_call`, so refresh and rejection handling are shared.
#[derive(Debug, Clone)]
pub struct ApiClient {
    session: SessionManager,
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(session: SessionManager, http: reqwest::Client, base: Url) -> Self {
        Self { session, http, base }
    }

    pub fn from_config(session: SessionManager, cfg: &Config) -> AppResult<Self> {
        Ok(Self::new(session, cfg.http_client()?, cfg.api_base.clone()))
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Raw JSON body of an authenticated request, envelope still attached.
    pub async fn send_raw(&self, method: Method, path: &str, body: Option<&Value>) -> AppResult<Value> {
        let url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| AppError::validation("bad_path".to_string(), format!("{path}: {e}")))?;
        debug!(target: "galley::api", "{} {}", method, url.path());
        self.session
            .guarded_call(|token| {
                let mut req = self.http.request(method.clone(), url.clone()).bearer_auth(token);
                if let Some(b) = body {
                    req = req.json(b);
                }
                async move { read_json(req.send().await?).await }
            })
            .await
    }

    async fn send<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&Value>) -> AppResult<T> {
        let raw = self.send_raw(method, path, body).await?;
        decode(envelope::normalize(raw), path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> AppResult<T> {
        let body = serde_json::to_value(body)?;
        self.send(Method::POST, path, Some(&body)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> AppResult<T> {
        let body = serde_json::to_value(body)?;
        self.send(Method::PUT, path, Some(&body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        self.send(Method::DELETE, path, None).await
    }

    pub async fn current_user(&self) -> AppResult<UserProfile> {
        let raw = self.send_raw(Method::GET, "auth/me", None).await?;
        decode(envelope::item(raw, "user"), "auth/me")
    }

    pub async fn update_password(&self, current: &str, new: &str) -> AppResult<()> {
        if current.is_empty() {
            return Err(AppError::validation("password_required", "Current password is required"));
        }
        if new.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::validation("password_too_short".to_string(), format!("Password must be at least {MIN_PASSWORD_LEN} characters long")));
        }
        let body = serde_json::json!({ "currentPassword": current, "newPassword": new });
        self.send_raw(Method::POST, "auth/update-password", Some(&body)).await?;
        Ok(())
    }

    /// All allergens visible to the tenant, with severities filled in.
    pub async fn allergens(&self) -> AppResult<Vec<Allergen>> {
        let raw = self.send_raw(Method::GET, "allergens", None).await?;
        let records = envelope::collection(raw, "allergens");
        let mut out = Vec::with_capacity(records.len());
        for r in records {
            match Allergen::from_raw(r) {
                Ok(a) => out.push(a),
                Err(e) => warn!(target: "galley::api", "skipping malformed allergen record: {}", e),
            }
        }
        Ok(out)
    }

    pub async fn check_ingredient(&self, ingredient: &str) -> AppResult<IngredientCheck> {
        let path = format!("allergens/check/{}", urlencoding::encode(ingredient));
        let mut check: IngredientCheck = self.get(&path).await?;
        if check.ingredient.is_empty() {
            check.ingredient = ingredient.to_string();
        }
        Ok(check)
    }
}

fn decode<T: DeserializeOwned>(v: Value, path: &str) -> AppResult<T> {
    serde_json::from_value(v).map_err(|e| AppError::internal("unexpected_shape".to_string(), format!("{path}: {e}")))
}
