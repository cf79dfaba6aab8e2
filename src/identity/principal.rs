use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::claims::Claims;
use crate::api::envelope::record_id;

/// Who is signed in, as decoded from the current session token.
/// Stored under the `user` key as camelCase JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySnapshot {
    pub user_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl IdentitySnapshot {
    /// None when the token carries no subject; such a token cannot establish a session.
    pub fn from_claims(claims: &Claims) -> Option<Self> {
        let user_id = claims.user_id.clone()?;
        Some(Self { user_id, tenant_id: claims.tenant_id.clone(), role: claims.role.clone() })
    }
}

/// The company a user signs in to. The name is only known after a company lookup or signup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TenantRef {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// User record as returned by the issuer and `auth/me`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", from = "RawUserProfile")]
pub struct UserProfile {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<String>,
    pub tenant_id: Option<String>,
}

/// Tenant record as returned by the company lookup endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", from = "RawTenantProfile")]
pub struct TenantProfile {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub plan: Option<String>,
}

// Wire shapes. The backend may send `_id` and `id` side by side, and
// `tenantId` either as an id or as the populated tenant record.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUserProfile {
    #[serde(default, rename = "_id")]
    mongo_id: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    tenant_id: Option<Value>,
}

impl From<RawUserProfile> for UserProfile {
    fn from(r: RawUserProfile) -> Self {
        UserProfile {
            id: record_id(r.mongo_id).or_else(|| record_id(r.id)).unwrap_or_default(),
            email: r.email,
            first_name: r.first_name,
            last_name: r.last_name,
            role: r.role,
            tenant_id: record_id(r.tenant_id),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTenantProfile {
    #[serde(default, rename = "_id")]
    mongo_id: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    subscription_plan: Option<String>,
}

impl From<RawTenantProfile> for TenantProfile {
    fn from(r: RawTenantProfile) -> Self {
        TenantProfile {
            id: record_id(r.mongo_id).or_else(|| record_id(r.id)).unwrap_or_default(),
            name: r.name,
            email: r.email,
            plan: r.subscription_plan.or(r.plan),
        }
    }
}

impl From<&TenantProfile> for TenantRef {
    fn from(p: &TenantProfile) -> Self {
        TenantRef { id: p.id.clone(), name: p.name.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_requires_subject() {
        assert!(IdentitySnapshot::from_claims(&Claims::default()).is_none());
        let c = Claims { user_id: Some("u".into()), tenant_id: Some("t".into()), ..Default::default() };
        let s = IdentitySnapshot::from_claims(&c).unwrap();
        assert_eq!(s.tenant_id.as_deref(), Some("t"));
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let s = IdentitySnapshot { user_id: "u".into(), tenant_id: Some("t".into()), role: Some("staff".into()) };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v, serde_json::json!({"userId":"u","tenantId":"t","role":"staff"}));
    }

    #[test]
    fn profiles_accept_mongo_ids() {
        let t: TenantProfile = serde_json::from_value(serde_json::json!({"_id":"t1","name":"Acme Corp","subscriptionPlan":"basic"})).unwrap();
        assert_eq!(t.id, "t1");
        assert_eq!(t.plan.as_deref(), Some("basic"));
        assert_eq!(TenantRef::from(&t).label(), "Acme Corp");
        let u: UserProfile = serde_json::from_value(serde_json::json!({"id":"u1","tenantId":"t1"})).unwrap();
        assert_eq!(u.id, "u1");
        assert_eq!(u.tenant_id.as_deref(), Some("t1"));
    }

    #[test]
    fn profiles_tolerate_duplicate_ids_and_populated_tenant() {
        let u: UserProfile = serde_json::from_value(serde_json::json!({
            "_id": "u1", "id": "u1", "email": null,
            "tenantId": {"_id": "t1", "id": "t1", "name": "Acme Corp"}
        }))
        .unwrap();
        assert_eq!(u.id, "u1");
        assert_eq!(u.email, None);
        assert_eq!(u.tenant_id.as_deref(), Some("t1"));

        let t: TenantProfile =
            serde_json::from_value(serde_json::json!({"_id":"t1","id":"t1","plan":"pro","subscriptionPlan":"basic"})).unwrap();
        assert_eq!(t.id, "t1");
        assert_eq!(t.plan.as_deref(), Some("basic"));
    }
}
