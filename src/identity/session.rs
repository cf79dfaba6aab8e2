//! Session lifecycle: login, refresh, guarded calls and logout.
//!
//! `SessionManager` is a cheap clonable handle; every component that talks to
//! the API shares the same instance. The held token, its identity snapshot and
//! the tenant reference always change together, in memory and in the
//! `SessionStore`.
//!
//! Refresh is single-flight: the first caller to find the token expired spawns
//! the refresh as a task and parks a `Shared` future in `refresh`; everyone
//! else awaits that same future. Because the work runs in its own task, a
//! caller that gives up (timeout, dropped future) does not interrupt the state
//! transition.
//!
//! The published state only carries an identity while the held token is
//! usable. A held token that is past its local expiry is published as
//! `Expired` until a refresh replaces it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::claims::decode_claims;
use super::expiry::{now_secs, ExpiryPolicy};
use super::issuer::{IssuedToken, Issuer, LoginRequest, SignupRequest, validate_email};
use super::principal::{IdentitySnapshot, TenantRef};
use crate::error::{AppError, AppResult};
use crate::storage::{SessionStore, SESSION_KEYS, TENANT_KEY, TOKEN_KEY, USER_KEY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated(IdentitySnapshot),
    Refreshing,
    Expired,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Anonymous => "anonymous",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::Expired => "expired",
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, AppResult<String>>>;

#[derive(Debug, Default)]
struct Held {
    token: Option<String>,
    identity: Option<IdentitySnapshot>,
    tenant: Option<TenantRef>,
    /// Bumped on every login, logout and clear; a refresh that started under an
    /// older epoch must not touch the session.
    epoch: u64,
}

struct Inner {
    store: Arc<dyn SessionStore>,
    issuer: Arc<dyn Issuer>,
    expiry: ExpiryPolicy,
    held: RwLock<Held>,
    state: watch::Sender<SessionState>,
    refresh: Mutex<Option<RefreshFuture>>,
    pending_tenant: RwLock<Option<TenantRef>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.inner.state.borrow().name())
            .field("expiry", &self.inner.expiry)
            .finish()
    }
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, issuer: Arc<dyn Issuer>, expiry: ExpiryPolicy) -> Self {
        let (state, _) = watch::channel(SessionState::Anonymous);
        Self {
            inner: Arc::new(Inner {
                store,
                issuer,
                expiry,
                held: RwLock::new(Held::default()),
                state,
                refresh: Mutex::new(None),
                pending_tenant: RwLock::new(None),
            }),
        }
    }

    /// Rebuild in-memory state from the store. An expired token is kept (state
    /// `Expired`) so the next guarded call can refresh it; an unusable one is cleared.
    pub fn restore(&self) -> AppResult<SessionState> {
        let Some(token) = self.inner.store.get(TOKEN_KEY)? else {
            return Ok(self.state());
        };
        let identity = decode_claims(&token).ok().and_then(|c| IdentitySnapshot::from_claims(&c));
        let Some(identity) = identity else {
            warn!(target: "galley::session", "stored token is unusable, clearing session");
            self.inner.clear(None, false, "unusable stored token");
            return Ok(self.state());
        };
        let stored_tenant = self
            .inner
            .store
            .get(TENANT_KEY)?
            .and_then(|raw| serde_json::from_str::<TenantRef>(&raw).ok());
        let tenant = resolve_tenant(&identity, stored_tenant.as_ref(), None);
        info!(target: "galley::session", "restored session user={} tenant={:?}", identity.user_id, identity.tenant_id);
        self.inner.install(token, identity, tenant, None)?;
        Ok(self.state())
    }

    pub fn state(&self) -> SessionState {
        let published = self.inner.state.borrow().clone();
        match published {
            SessionState::Authenticated(_) => {
                let held = self.inner.held.read();
                self.inner.held_state(&held)
            }
            other => other,
        }
    }

    /// Watch state transitions, e.g. to time out a stalled `Refreshing`.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.usable_token().is_some()
    }

    pub fn identity(&self) -> Option<IdentitySnapshot> {
        if !self.is_authenticated() {
            return None;
        }
        self.inner.held.read().identity.clone()
    }

    pub fn tenant(&self) -> Option<TenantRef> {
        if !self.is_authenticated() {
            return None;
        }
        self.inner.held.read().tenant.clone()
    }

    /// Tenant chosen by the last company lookup, waiting for a login.
    pub fn pending_tenant(&self) -> Option<TenantRef> {
        self.inner.pending_tenant.read().clone()
    }

    /// Pre-authentication company lookup by email.
    pub async fn lookup_tenant(&self, email: &str) -> AppResult<TenantRef> {
        let email = validate_email(email)?;
        let profile = self.inner.issuer.tenant_for_email(&email).await?;
        let tenant = TenantRef::from(&profile);
        info!(target: "galley::session", "company lookup resolved tenant={} name={:?}", tenant.id, tenant.name);
        *self.inner.pending_tenant.write() = Some(tenant.clone());
        Ok(tenant)
    }

    pub async fn login(&self, credentials: &LoginRequest) -> AppResult<IdentitySnapshot> {
        let mut req = credentials.validated()?;
        let pending = self.pending_tenant();
        if req.tenant_id.is_none() {
            req.tenant_id = pending.as_ref().map(|t| t.id.clone());
        }
        let epoch = self.inner.begin_authenticating();
        let outcome = self.inner.issuer.login(&req).await;
        let identity = self.inner.finish_authenticating(epoch, outcome, pending.as_ref())?;
        info!(target: "galley::session", "login ok user={} tenant={:?}", identity.user_id, identity.tenant_id);
        self.name_tenant(epoch).await;
        Ok(identity)
    }

    pub async fn signup(&self, request: &SignupRequest) -> AppResult<IdentitySnapshot> {
        let req = request.validated()?;
        let epoch = self.inner.begin_authenticating();
        let outcome = self.inner.issuer.signup(&req).await;
        let identity = self.inner.finish_authenticating(epoch, outcome, None)?;
        info!(target: "galley::session", "signup ok user={} tenant={:?}", identity.user_id, identity.tenant_id);
        self.name_tenant(epoch).await;
        Ok(identity)
    }

    /// Fill in the tenant's display name when login only produced its id. Best effort.
    async fn name_tenant(&self, epoch: u64) {
        let Some(id) = self.inner.unnamed_tenant(epoch) else {
            return;
        };
        match self.inner.issuer.tenant_by_id(&id).await {
            Ok(profile) if profile.name.is_some() => self.inner.rename_tenant(epoch, TenantRef::from(&profile)),
            Ok(_) => {}
            Err(e) => debug!(target: "galley::session", "tenant {} name unavailable: {}", id, e),
        }
    }

    /// Tell the issuer (best effort) and clear local state no matter what it says.
    pub async fn logout(&self) {
        let token = self.inner.held.read().token.clone();
        self.inner.clear(None, false, "logout");
        *self.inner.pending_tenant.write() = None;
        if let Some(token) = token {
            if let Err(e) = self.inner.issuer.logout(&token).await {
                warn!(target: "galley::session", "remote logout failed (ignored): {}", e);
            }
        }
    }

    /// Run `call` with a fresh bearer token.
    ///
    /// A locally expired token is refreshed first. If `call` fails with an
    /// authentication rejection the session is cleared before the error is
    /// returned; any other error (including network failures) leaves the
    /// session alone.
    pub async fn guarded_call<T, F, Fut>(&self, call: F) -> AppResult<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let token = self.fresh_token().await?;
        match call(token.clone()).await {
            Err(e) if e.is_auth_rejection() => {
                warn!(target: "galley::session", "request rejected ({}), ending session", e.code_str());
                self.inner.reject(&token);
                Err(e)
            }
            other => other,
        }
    }

    /// Current token if usable, refreshing it when the local clock says it expired.
    pub async fn fresh_token(&self) -> AppResult<String> {
        if let Some(token) = self.inner.usable_token() {
            return Ok(token);
        }
        let has_token = self.inner.held.read().token.is_some();
        if !has_token && self.inner.refresh.lock().is_none() {
            return Err(AppError::auth("not_signed_in", "No active session"));
        }
        self.refresh_shared().await
    }

    async fn refresh_shared(&self) -> AppResult<String> {
        let fut = {
            let mut slot = self.inner.refresh.lock();
            match slot.as_ref() {
                Some(inflight) => {
                    debug!(target: "galley::session", "joining in-flight refresh");
                    inflight.clone()
                }
                None => {
                    // a refresh may have completed between the expiry check and taking the slot
                    if let Some(token) = self.inner.usable_token() {
                        return Ok(token);
                    }
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move { inner.run_refresh().await });
                    let fut: RefreshFuture = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(AppError::internal("refresh_task".to_string(), e.to_string())),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }
}

impl Inner {
    fn usable_token(&self) -> Option<String> {
        let authenticated = matches!(*self.state.borrow(), SessionState::Authenticated(_));
        if !authenticated {
            return None;
        }
        let held = self.held.read();
        let token = held.token.as_ref()?;
        let claims = decode_claims(token).ok()?;
        if self.expiry.is_expired(&claims) {
            return None;
        }
        Some(token.clone())
    }

    fn unnamed_tenant(&self, epoch: u64) -> Option<String> {
        let held = self.held.read();
        if held.epoch != epoch {
            return None;
        }
        let tenant = held.tenant.as_ref().filter(|t| t.name.is_none())?;
        Some(tenant.id.clone())
    }

    fn begin_authenticating(&self) -> u64 {
        let mut held = self.held.write();
        let had_session = held.token.is_some();
        let epoch = held.epoch + 1;
        *held = Held { epoch, ..Held::default() };
        if had_session {
            if let Err(e) = self.store.remove_many(&SESSION_KEYS) {
                warn!(target: "galley::session", "failed to clear previous session: {}", e);
            }
        }
        self.state.send_replace(SessionState::Authenticating);
        epoch
    }

    fn finish_authenticating(
        self: &Arc<Self>,
        epoch: u64,
        outcome: AppResult<IssuedToken>,
        pending: Option<&TenantRef>,
    ) -> AppResult<IdentitySnapshot> {
        let result = outcome.and_then(|issued| {
            let token = issued
                .token
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| AppError::auth("no_token", "The server did not issue a session token"))?;
            let claims = decode_claims(&token)
                .map_err(|e| AppError::auth("unusable_token".to_string(), e.to_string()))?;
            let mut identity = IdentitySnapshot::from_claims(&claims)
                .ok_or_else(|| AppError::auth("unusable_token", "Session token carries no user id"))?;
            if identity.tenant_id.is_none() {
                identity.tenant_id = issued.user().and_then(|u| u.tenant_id.clone());
            }
            let issued_tenant = issued.tenant().map(TenantRef::from);
            let tenant = resolve_tenant(&identity, issued_tenant.as_ref(), pending);
            Ok((token, identity, tenant))
        });

        match result {
            Ok((token, identity, tenant)) => {
                self.install(token, identity.clone(), tenant, Some(epoch))?;
                Ok(identity)
            }
            Err(e) => {
                warn!(target: "galley::session", "authentication failed: {}", e.code_str());
                let held = self.held.read();
                if held.epoch == epoch {
                    self.state.send_replace(SessionState::Anonymous);
                }
                Err(e)
            }
        }
    }

    /// Persist and adopt a new session in one step. With `expect_epoch`, a
    /// concurrent logout/login since the request started wins and nothing is written.
    fn install(
        self: &Arc<Self>,
        token: String,
        identity: IdentitySnapshot,
        tenant: Option<TenantRef>,
        expect_epoch: Option<u64>,
    ) -> AppResult<()> {
        let mut held = self.held.write();
        if let Some(e) = expect_epoch {
            if held.epoch != e {
                return Err(AppError::auth("session_superseded", "The session changed while the request was in flight"));
            }
        }
        let user_json = serde_json::to_string(&identity)?;
        let mut entries = vec![(TOKEN_KEY, token.clone()), (USER_KEY, user_json)];
        if let Some(t) = &tenant {
            entries.push((TENANT_KEY, serde_json::to_string(t)?));
        }
        if tenant.is_none() {
            self.store.remove(TENANT_KEY)?;
        }
        self.store.set_many(&entries)?;
        held.token = Some(token.clone());
        held.identity = Some(identity);
        held.tenant = tenant;
        let published = self.held_state(&held);
        if matches!(published, SessionState::Authenticated(_)) {
            self.watch_expiry(&token);
        } else {
            info!(target: "galley::session", "held token is already past its local expiry");
        }
        self.state.send_replace(published);
        Ok(())
    }

    /// What subscribers may see of the held session: the identity only while its token is usable.
    fn held_state(&self, held: &Held) -> SessionState {
        match (&held.token, &held.identity) {
            (Some(token), Some(identity)) if !self.expiry.token_expired(token) => SessionState::Authenticated(identity.clone()),
            (Some(_), _) => SessionState::Expired,
            (None, _) => SessionState::Anonymous,
        }
    }

    /// Flip the published state to `Expired` once `token` crosses its local expiry.
    fn watch_expiry(self: &Arc<Self>, token: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let now = now_secs();
        let Some(at) = decode_claims(token).ok().and_then(|c| self.expiry.expires_at(&c, now)) else {
            return;
        };
        let Ok(wait) = Duration::try_from_secs_f64((at.ceil() - now as f64).max(0.0)) else {
            return;
        };
        let wait = wait + Duration::from_millis(50);
        let inner = Arc::downgrade(self);
        let token = token.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(inner) = inner.upgrade() {
                inner.mark_expired(&token);
            }
        });
    }

    fn mark_expired(&self, token: &str) {
        let held = self.held.read();
        if held.token.as_deref() != Some(token) {
            return;
        }
        let authenticated = matches!(*self.state.borrow(), SessionState::Authenticated(_));
        if authenticated && self.expiry.token_expired(token) {
            debug!(target: "galley::session", "held token passed its local expiry");
            self.state.send_replace(SessionState::Expired);
        }
    }

    fn rename_tenant(&self, epoch: u64, tenant: TenantRef) {
        let mut held = self.held.write();
        let same = held.tenant.as_ref().map(|t| t.id == tenant.id).unwrap_or(false);
        if held.epoch != epoch || !same {
            return;
        }
        let stored = serde_json::to_string(&tenant)
            .map_err(AppError::from)
            .and_then(|json| self.store.set(TENANT_KEY, &json));
        if let Err(e) = stored {
            warn!(target: "galley::session", "failed to persist tenant name: {}", e);
            return;
        }
        held.tenant = Some(tenant);
    }

    /// Drop token, identity and tenant together. `only_if_token` restricts the clear
    /// to the case where the held token is still the one that was rejected; `expired`
    /// passes through `Expired` on the way to `Anonymous`.
    fn clear(&self, only_if_token: Option<&str>, expired: bool, reason: &str) -> bool {
        let mut held = self.held.write();
        if let Some(t) = only_if_token {
            if held.token.as_deref() != Some(t) {
                debug!(target: "galley::session", "ignoring {} for a token that was already replaced", reason);
                return false;
            }
        }
        let epoch = held.epoch + 1;
        let had_session = held.token.is_some();
        *held = Held { epoch, ..Held::default() };
        if expired && had_session {
            self.state.send_replace(SessionState::Expired);
        }
        if let Err(e) = self.store.remove_many(&SESSION_KEYS) {
            warn!(target: "galley::session", "failed to clear session storage: {}", e);
        }
        self.state.send_replace(SessionState::Anonymous);
        info!(target: "galley::session", "session cleared ({})", reason);
        true
    }

    fn reject(&self, token: &str) {
        self.clear(Some(token), true, "authentication rejected");
    }

    async fn run_refresh(self: Arc<Self>) -> AppResult<String> {
        let result = self.refresh_once().await;
        self.refresh.lock().take();
        result
    }

    async fn refresh_once(self: &Arc<Self>) -> AppResult<String> {
        let (prior, tenant, epoch) = {
            let held = self.held.read();
            let Some(prior) = held.token.clone() else {
                return Err(AppError::auth("not_signed_in", "No active session"));
            };
            // under the held guard: a login that began since must keep its Authenticating
            self.state.send_replace(SessionState::Refreshing);
            (prior, held.tenant.clone(), held.epoch)
        };
        info!(target: "galley::session", "token expired locally, refreshing");

        let outcome = self.issuer.refresh(Some(&prior)).await;

        let refreshed = match outcome {
            Ok(Some(token)) => self.adopt_refreshed(token, tenant, epoch),
            Ok(None) => Err(AppError::expired("refresh_failed", "Refresh did not return a token")),
            Err(e) if e.kind() == crate::error::ErrorKind::Network => {
                // says nothing about the credential; keep the session for a later retry
                warn!(target: "galley::session", "refresh unreachable: {}", e);
                let held = self.held.read();
                if held.epoch == epoch {
                    self.state.send_replace(self.held_state(&held));
                }
                return Err(e);
            }
            Err(e) => Err(AppError::expired("refresh_failed".to_string(), e.message().to_string())),
        };

        match refreshed {
            Ok(token) => {
                info!(target: "galley::session", "token refreshed");
                Ok(token)
            }
            Err(e) if e.code_str() == "session_superseded" => Err(e),
            Err(e) => {
                warn!(target: "galley::session", "refresh failed: {}", e);
                self.clear(Some(&prior), true, "refresh failed");
                Err(e)
            }
        }
    }

    fn adopt_refreshed(self: &Arc<Self>, token: String, previous_tenant: Option<TenantRef>, epoch: u64) -> AppResult<String> {
        let claims = decode_claims(&token).map_err(|e| AppError::expired("refresh_failed".to_string(), e.to_string()))?;
        if self.expiry.is_expired(&claims) {
            return Err(AppError::expired("refresh_failed", "Refreshed token is already expired"));
        }
        let identity = IdentitySnapshot::from_claims(&claims)
            .ok_or_else(|| AppError::expired("refresh_failed", "Refreshed token carries no user id"))?;
        let tenant = resolve_tenant(&identity, previous_tenant.as_ref(), None);
        self.install(token.clone(), identity, tenant, Some(epoch))?;
        Ok(token)
    }
}

/// Tenant for a new identity: the token's tenant claim decides the id, and a
/// known reference with the same id contributes its name.
fn resolve_tenant(identity: &IdentitySnapshot, known: Option<&TenantRef>, pending: Option<&TenantRef>) -> Option<TenantRef> {
    let named = |id: &str| {
        [known, pending]
            .into_iter()
            .flatten()
            .find(|t| t.id == id)
            .and_then(|t| t.name.clone())
    };
    match identity.tenant_id.as_deref() {
        Some(id) => Some(TenantRef { id: id.to_string(), name: named(id) }),
        None => known.or(pending).cloned(),
    }
}
