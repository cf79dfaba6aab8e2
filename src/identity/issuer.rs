//! Token issuer boundary: request payloads, their client-side validation, and
//! the HTTP implementation that talks to the platform's `auth/*` endpoints.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use super::principal::{TenantProfile, UserProfile};
use crate::api::envelope;
use crate::api::response::read_json;
use crate::config::Config;
use crate::error::{AppError, AppResult};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)+$")
        .expect("email regex compiles")
});

pub const MIN_PASSWORD_LEN: usize = 8;

/// Trim and lower-case an email, rejecting anything that is not an address.
pub fn validate_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    if !EMAIL_RE.is_match(&email) {
        return Err(AppError::validation("invalid_email", "Please enter a valid email address"));
    }
    Ok(email)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self { email: email.into(), password: password.into(), tenant_id: None }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Normalized copy ready to send, or a validation error.
    pub fn validated(&self) -> AppResult<Self> {
        let email = validate_email(&self.email)?;
        if self.password.is_empty() {
            return Err(AppError::validation("password_required", "Password is required"));
        }
        Ok(Self { email, password: self.password.clone(), tenant_id: self.tenant_id.clone() })
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub company_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub phone: String,
    pub subscription_plan: String,
}

impl SignupRequest {
    pub fn validated(&self) -> AppResult<Self> {
        let email = validate_email(&self.email)?;
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::validation("password_too_short".to_string(), format!("Password must be at least {MIN_PASSWORD_LEN} characters long")));
        }
        if self.password != self.confirm_password {
            return Err(AppError::validation("password_mismatch", "Passwords don't match"));
        }
        if self.company_name.trim().is_empty() {
            return Err(AppError::validation("company_required", "Company name is required"));
        }
        let subscription_plan = if self.subscription_plan.is_empty() { "basic".to_string() } else { self.subscription_plan.clone() };
        Ok(Self { email, subscription_plan, company_name: self.company_name.trim().to_string(), ..self.clone() })
    }
}

/// `{ token, data: { user, tenant } }` as returned by login, signup and refresh.
/// Only the token is required; `data` is a cache and is dropped when malformed.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct IssuedToken {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub data: Option<IssuedData>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct IssuedData {
    #[serde(default, deserialize_with = "lenient")]
    pub user: Option<UserProfile>,
    #[serde(default, deserialize_with = "lenient")]
    pub tenant: Option<TenantProfile>,
}

fn lenient<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Value::deserialize(de)?;
    if raw.is_null() {
        return Ok(None);
    }
    match serde_json::from_value(raw) {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            debug!(target: "galley::issuer", "ignoring malformed issued record: {}", e);
            Ok(None)
        }
    }
}

impl IssuedToken {
    pub fn user(&self) -> Option<&UserProfile> { self.data.as_ref()?.user.as_ref() }
    pub fn tenant(&self) -> Option<&TenantProfile> { self.data.as_ref()?.tenant.as_ref() }
}

/// Everything the session manager needs from the token issuer.
#[async_trait]
pub trait Issuer: Send + Sync {
    async fn login(&self, req: &LoginRequest) -> AppResult<IssuedToken>;
    async fn signup(&self, req: &SignupRequest) -> AppResult<IssuedToken>;
    /// `Ok(None)` when the endpoint answered but handed out no token.
    async fn refresh(&self, prior_token: Option<&str>) -> AppResult<Option<String>>;
    async fn logout(&self, token: &str) -> AppResult<()>;
    async fn tenant_for_email(&self, email: &str) -> AppResult<TenantProfile>;
    async fn tenant_by_id(&self, id: &str) -> AppResult<TenantProfile>;
}

#[derive(Debug, Clone)]
pub struct HttpIssuer {
    base: Url,
    client: reqwest::Client,
}

impl HttpIssuer {
    pub fn new(base: Url, client: reqwest::Client) -> Self { Self { base, client } }

    pub fn from_config(cfg: &Config) -> AppResult<Self> {
        Ok(Self::new(cfg.api_base.clone(), cfg.http_client()?))
    }

    fn url(&self, path: &str) -> AppResult<Url> {
        self.base
            .join(path)
            .map_err(|e| AppError::internal("bad_url".to_string(), format!("{path}: {e}")))
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B, bearer: Option<&str>) -> AppResult<Value> {
        let url = self.url(path)?;
        debug!(target: "galley::issuer", "POST {}", url.path());
        let mut req = self.client.post(url).json(body);
        if let Some(t) = bearer {
            req = req.bearer_auth(t);
        }
        read_json(req.send().await?).await
    }

    async fn get_json(&self, path: &str) -> AppResult<Value> {
        let url = self.url(path)?;
        debug!(target: "galley::issuer", "GET {}", url.path());
        read_json(self.client.get(url).send().await?).await
    }
}

fn issued(v: Value) -> AppResult<IssuedToken> {
    Ok(serde_json::from_value(v)?)
}

fn tenant_from(v: Value) -> AppResult<TenantProfile> {
    let tenant: TenantProfile = serde_json::from_value(envelope::item(v, "tenant"))?;
    if tenant.id.is_empty() {
        return Err(AppError::remote(404, "tenant_not_found", "No company found with this email"));
    }
    Ok(tenant)
}

#[async_trait]
impl Issuer for HttpIssuer {
    async fn login(&self, req: &LoginRequest) -> AppResult<IssuedToken> {
        issued(self.post_json("auth/login", req, None).await?)
    }

    async fn signup(&self, req: &SignupRequest) -> AppResult<IssuedToken> {
        issued(self.post_json("auth/signup", req, None).await?)
    }

    async fn refresh(&self, prior_token: Option<&str>) -> AppResult<Option<String>> {
        let v = self.post_json("auth/refresh-token", &serde_json::json!({}), prior_token).await?;
        let token = envelope::normalize(v)
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Ok(token)
    }

    async fn logout(&self, token: &str) -> AppResult<()> {
        self.post_json("auth/logout", &serde_json::json!({}), Some(token)).await?;
        Ok(())
    }

    async fn tenant_for_email(&self, email: &str) -> AppResult<TenantProfile> {
        tenant_from(self.get_json(&format!("auth/tenant-for-email/{}", urlencoding::encode(email))).await?)
    }

    async fn tenant_by_id(&self, id: &str) -> AppResult<TenantProfile> {
        tenant_from(self.get_json(&format!("auth/tenant/{}", urlencoding::encode(id))).await?)
    }
}
