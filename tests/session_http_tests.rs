use std::net::TcpListener as StdListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use galley::allergen::Severity;
use galley::api::ApiClient;
use galley::config::Config;
use galley::error::ErrorKind;
use galley::identity::{now_secs, HttpIssuer, IdentitySnapshot, LoginRequest, SessionManager, SessionState, SignupRequest, TenantRef};
use galley::storage::{FileStore, SessionStore, TENANT_KEY, TOKEN_KEY, USER_KEY};

fn mint(claims: Value) -> String {
    let enc = |v: &Value| URL_SAFE_NO_PAD.encode(serde_json::to_vec(v).unwrap());
    format!("{}.{}.c2lnbmF0dXJl", enc(&json!({"alg": "HS256", "typ": "JWT"})), enc(&claims))
}

fn token(exp_offset: i64) -> String {
    mint(json!({"userId": "u1", "tenantId": "t1", "role": "manager", "exp": now_secs() + exp_offset}))
}

#[derive(Clone)]
struct Mock {
    login_exp_offset: i64,
    reject_calls: bool,
    refresh_rejects: bool,
    logout_fails: bool,
    refresh_calls: Arc<AtomicUsize>,
    api_calls: Arc<AtomicUsize>,
}

impl Mock {
    fn new(login_exp_offset: i64) -> Self {
        Self {
            login_exp_offset,
            reject_calls: false,
            refresh_rejects: false,
            logout_fails: false,
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            api_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn has_bearer(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer ") && v.len() > 7)
        .unwrap_or(false)
}

async fn login(State(m): State<Mock>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["password"] != "secret" {
        return (StatusCode::UNAUTHORIZED, Json(json!({"status": "fail", "message": "Invalid credentials"})));
    }
    let tok = token(m.login_exp_offset);
    let user = json!({"_id": "u1", "id": "u1", "email": body["email"], "tenantId": {"_id": "t1", "id": "t1", "name": "Acme Kitchens"}});
    (StatusCode::OK, Json(json!({"token": tok, "data": {"user": user}})))
}

async fn signup(State(m): State<Mock>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["email"] == "taken@acme.io" {
        return (StatusCode::BAD_REQUEST, Json(json!({"status": "fail", "message": "Email already registered"})));
    }
    if body["password"] != body["confirmPassword"] || body["subscriptionPlan"].as_str().is_none() {
        return (StatusCode::BAD_REQUEST, Json(json!({"status": "fail", "message": "Invalid signup"})));
    }
    let tok = token(m.login_exp_offset);
    (
        StatusCode::CREATED,
        Json(json!({"status": "success", "token": tok, "data": {
            "user": {"_id": "u1", "id": "u1", "email": body["email"], "firstName": body["firstName"], "tenantId": "t1"},
            "tenant": {"_id": "t1", "id": "t1", "name": body["companyName"], "subscriptionPlan": body["subscriptionPlan"]}
        }})),
    )
}

async fn tenant_for_email(Path(email): Path<String>) -> (StatusCode, Json<Value>) {
    if email == "chef@acme.io" {
        (StatusCode::OK, Json(json!({"status": "success", "data": {"tenant": {"_id": "t1", "name": "Acme Kitchens"}}})))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"status": "fail", "message": "No company found with this email"})))
    }
}

async fn tenant_by_id(Path(id): Path<String>) -> Json<Value> {
    Json(json!({"tenant": {"_id": id, "name": "Acme Kitchens", "subscriptionPlan": "basic"}}))
}

async fn refresh(State(m): State<Mock>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    m.refresh_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    if m.refresh_rejects || !has_bearer(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "Refresh token expired"})));
    }
    (StatusCode::OK, Json(json!({"status": "success", "token": token(3600)})))
}

async fn logout(State(m): State<Mock>) -> (StatusCode, Json<Value>) {
    if m.logout_fails {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"message": "boom"})));
    }
    (StatusCode::OK, Json(json!({"status": "success"})))
}

async fn allergens(State(m): State<Mock>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    m.api_calls.fetch_add(1, Ordering::SeqCst);
    if m.reject_calls || !has_bearer(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "jwt expired"})));
    }
    (
        StatusCode::OK,
        Json(json!({"status": "success", "data": {"allergens": [
            {"_id": "a1", "name": "Peanuts", "relatedIngredients": ["satay sauce"]},
            {"_id": "a2", "allergenName": "Celery", "desc": "mild digestive discomfort"},
            {"_id": "a3", "name": "Sulphites", "severity": "high"}
        ]}})),
    )
}

async fn check_ingredient(State(m): State<Mock>, headers: HeaderMap, Path(name): Path<String>) -> (StatusCode, Json<Value>) {
    m.api_calls.fetch_add(1, Ordering::SeqCst);
    if !has_bearer(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "not signed in"})));
    }
    let found: Vec<&str> = if name.contains("satay") { vec!["Peanuts"] } else { vec![] };
    (StatusCode::OK, Json(json!({"status": "success", "data": {"allergens": found}})))
}

async fn create_allergen(State(m): State<Mock>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    m.api_calls.fetch_add(1, Ordering::SeqCst);
    if !has_bearer(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "not signed in"})));
    }
    (StatusCode::CREATED, Json(json!({"status": "success", "data": {"allergen": {"_id": "a9", "name": body["name"]}}})))
}

async fn update_allergen(Path(id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({"status": "success", "data": {"allergen": {"_id": id, "name": body["name"]}}}))
}

async fn delete_allergen(headers: HeaderMap) -> StatusCode {
    if has_bearer(&headers) { StatusCode::NO_CONTENT } else { StatusCode::UNAUTHORIZED }
}

async fn me(State(m): State<Mock>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    m.api_calls.fetch_add(1, Ordering::SeqCst);
    if !has_bearer(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "not signed in"})));
    }
    (StatusCode::OK, Json(json!({"data": {"user": {"_id": "u1", "email": "chef@acme.io", "firstName": "Ada", "tenantId": "t1"}}})))
}

async fn start_issuer(mock: Mock) -> (JoinHandle<()>, String) {
    let app = Router::new()
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/signup", post(signup))
        .route("/api/v1/auth/tenant-for-email/{email}", get(tenant_for_email))
        .route("/api/v1/auth/tenant/{id}", get(tenant_by_id))
        .route("/api/v1/auth/refresh-token", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/auth/me", get(me))
        .route("/api/v1/allergens", get(allergens).post(create_allergen))
        .route("/api/v1/allergens/{id}", put(update_allergen).delete(delete_allergen))
        .route("/api/v1/allergens/check/{name}", get(check_ingredient))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("mock issuer error: {e:?}");
        }
    });
    (handle, format!("http://{addr}/api/v1"))
}

struct Guard(JoinHandle<()>);
impl Drop for Guard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Harness {
    session: SessionManager,
    api: ApiClient,
    store: Arc<FileStore>,
    cfg: Config,
}

fn harness(base: &str, session_file: &std::path::Path) -> Harness {
    let cfg = Config::default().with_api_base(base).unwrap();
    let store = Arc::new(FileStore::open(session_file).unwrap());
    let issuer = Arc::new(HttpIssuer::from_config(&cfg).unwrap());
    let session = SessionManager::new(store.clone(), issuer, cfg.expiry);
    session.restore().unwrap();
    let api = ApiClient::from_config(session.clone(), &cfg).unwrap();
    Harness { session, api, store, cfg }
}

fn assert_store_empty(store: &FileStore) {
    for k in [TOKEN_KEY, USER_KEY, TENANT_KEY] {
        assert_eq!(store.get(k).unwrap(), None, "{k} should be cleared");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lookup_login_and_fetch() {
    let mock = Mock::new(3600);
    let (srv, base) = start_issuer(mock.clone()).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));

    let tenant = h.session.lookup_tenant("Chef@Acme.io").await.unwrap();
    assert_eq!(tenant.label(), "Acme Kitchens");
    let identity = h.session.login(&LoginRequest::new("chef@acme.io", "secret")).await.unwrap();
    assert_eq!(identity.user_id, "u1");
    assert!(h.session.is_authenticated());

    let stored: IdentitySnapshot = serde_json::from_str(&h.store.get(USER_KEY).unwrap().unwrap()).unwrap();
    let stored_tenant: TenantRef = serde_json::from_str(&h.store.get(TENANT_KEY).unwrap().unwrap()).unwrap();
    assert_eq!(stored, identity);
    assert_eq!(stored_tenant, TenantRef { id: "t1".into(), name: Some("Acme Kitchens".into()) });

    let list = h.api.allergens().await.unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list[0].severity, Severity::High);
    assert_eq!(list[1].name, "Celery");
    assert_eq!(list[1].severity, Severity::Medium);
    assert_eq!(list[2].severity, Severity::High);

    let me = h.api.current_user().await.unwrap();
    assert_eq!(me.first_name.as_deref(), Some("Ada"));
    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_company_and_bad_password() {
    let (srv, base) = start_issuer(Mock::new(3600)).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));

    let err = h.session.lookup_tenant("nobody@nowhere.io").await.unwrap_err();
    assert_eq!(err.http_status(), Some(404));
    assert_eq!(err.message(), "No company found with this email");

    let err = h.session.login(&LoginRequest::new("chef@acme.io", "wrong")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(err.message(), "Invalid credentials");
    assert_eq!(h.session.state(), SessionState::Anonymous);
    assert_store_empty(&h.store);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_on_expired_token_refresh_once() {
    let mock = Mock::new(-120);
    let (srv, base) = start_issuer(mock.clone()).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));
    h.session.login(&LoginRequest::new("chef@acme.io", "secret").with_tenant("t1")).await.unwrap();
    let expired_token = h.store.get(TOKEN_KEY).unwrap();
    assert!(!h.session.is_authenticated());

    let calls: Vec<_> = (0..10).map(|_| h.api.allergens()).collect();
    let results = futures::future::join_all(calls).await;
    for r in &results {
        assert!(r.is_ok(), "{r:?}");
    }
    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.api_calls.load(Ordering::SeqCst), 10);
    assert!(h.session.is_authenticated());
    assert_ne!(h.store.get(TOKEN_KEY).unwrap(), expired_token);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_refresh_ends_session() {
    let mock = Mock { refresh_rejects: true, ..Mock::new(-120) };
    let (srv, base) = start_issuer(mock.clone()).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));
    h.session.login(&LoginRequest::new("chef@acme.io", "secret")).await.unwrap();

    let err = h.api.allergens().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
    assert_eq!(h.session.state(), SessionState::Anonymous);
    assert_store_empty(&h.store);
    assert_eq!(mock.api_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_response_clears_session_without_retry() {
    let mock = Mock { reject_calls: true, ..Mock::new(3600) };
    let (srv, base) = start_issuer(mock.clone()).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));
    h.session.login(&LoginRequest::new("chef@acme.io", "secret")).await.unwrap();

    let err = h.api.allergens().await.unwrap_err();
    assert_eq!(err.http_status(), Some(401));
    assert!(err.is_auth_rejection());
    assert!(!h.session.is_authenticated());
    assert_store_empty(&h.store);

    let err = h.api.allergens().await.unwrap_err();
    assert_eq!(err.code_str(), "not_signed_in");
    assert_eq!(mock.api_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logout_clears_when_server_fails() {
    let mock = Mock { logout_fails: true, ..Mock::new(3600) };
    let (srv, base) = start_issuer(mock).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("session.json");
    let h = harness(&base, &path);
    h.session.login(&LoginRequest::new("chef@acme.io", "secret")).await.unwrap();

    h.session.logout().await;
    assert_eq!(h.session.state(), SessionState::Anonymous);
    assert_store_empty(&h.store);
    assert_store_empty(&FileStore::open(&path).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_without_lookup_names_tenant_by_id() {
    let (srv, base) = start_issuer(Mock::new(3600)).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));
    h.session.login(&LoginRequest::new("chef@acme.io", "secret").with_tenant("t1")).await.unwrap();
    assert_eq!(h.session.tenant(), Some(TenantRef { id: "t1".into(), name: Some("Acme Kitchens".into()) }));
    assert!(h.store.get(TENANT_KEY).unwrap().unwrap().contains("Acme Kitchens"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn network_failure_leaves_session_alone() {
    let (srv, base) = start_issuer(Mock::new(3600)).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));
    h.session.login(&LoginRequest::new("chef@acme.io", "secret")).await.unwrap();
    let before = h.store.get(TOKEN_KEY).unwrap();

    let closed_port = {
        let l = StdListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    };
    let offline = h.cfg.clone().with_api_base(&format!("http://127.0.0.1:{closed_port}/api/v1")).unwrap();
    let api = ApiClient::from_config(h.session.clone(), &offline).unwrap();

    let err = api.allergens().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(h.session.is_authenticated());
    assert_eq!(h.store.get(TOKEN_KEY).unwrap(), before);
    assert!(h.store.get(USER_KEY).unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_survives_restart() {
    let mock = Mock::new(3600);
    let (srv, base) = start_issuer(mock.clone()).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("nested").join("session.json");
    {
        let h = harness(&base, &path);
        h.session.lookup_tenant("chef@acme.io").await.unwrap();
        h.session.login(&LoginRequest::new("chef@acme.io", "secret")).await.unwrap();
    }

    let h = harness(&base, &path);
    assert!(h.session.is_authenticated());
    assert_eq!(h.session.identity().map(|i| i.user_id), Some("u1".to_string()));
    assert_eq!(h.session.tenant().map(|t| t.label().to_string()), Some("Acme Kitchens".to_string()));
    assert_eq!(h.api.allergens().await.unwrap().len(), 3);
}

fn signup_request(email: &str) -> SignupRequest {
    SignupRequest {
        first_name: "Ada".into(),
        last_name: "Byron".into(),
        email: email.into(),
        password: "longenough".into(),
        confirm_password: "longenough".into(),
        company_name: "Bistro Ada".into(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signup_installs_session_with_company_name() {
    let (srv, base) = start_issuer(Mock::new(3600)).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));

    let identity = h.session.signup(&signup_request("Ada@Bistro.io")).await.unwrap();
    assert_eq!(identity.user_id, "u1");
    assert!(h.session.is_authenticated());
    assert_eq!(h.session.tenant(), Some(TenantRef { id: "t1".into(), name: Some("Bistro Ada".into()) }));
    let stored_tenant: TenantRef = serde_json::from_str(&h.store.get(TENANT_KEY).unwrap().unwrap()).unwrap();
    assert_eq!(stored_tenant.label(), "Bistro Ada");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signup_conflict_is_reported() {
    let (srv, base) = start_issuer(Mock::new(3600)).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));

    let err = h.session.signup(&signup_request("taken@acme.io")).await.unwrap_err();
    assert_eq!(err.http_status(), Some(400));
    assert_eq!(err.message(), "Email already registered");
    assert_eq!(h.session.state(), SessionState::Anonymous);
    assert_store_empty(&h.store);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingredient_check_and_writes() {
    let mock = Mock::new(3600);
    let (srv, base) = start_issuer(mock.clone()).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(&base, &tmp.path().join("session.json"));
    h.session.login(&LoginRequest::new("chef@acme.io", "secret")).await.unwrap();

    let check = h.api.check_ingredient("satay sauce").await.unwrap();
    assert_eq!(check.ingredient, "satay sauce");
    assert_eq!(check.allergens, vec!["Peanuts".to_string()]);
    assert!(h.api.check_ingredient("rice").await.unwrap().allergens.is_empty());

    let created: Value = h.api.post("allergens", &json!({"name": "Lupin"})).await.unwrap();
    assert_eq!(created, json!({"allergen": {"_id": "a9", "name": "Lupin"}}));
    let updated: Value = h.api.put("/allergens/a9", &json!({"name": "Lupin flour"})).await.unwrap();
    assert_eq!(updated["allergen"]["name"], "Lupin flour");
    let deleted: Value = h.api.delete("allergens/a9").await.unwrap();
    assert_eq!(deleted, Value::Null);
    assert_eq!(mock.api_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_token_on_disk_is_refreshed_after_restart() {
    let mock = Mock::new(-120);
    let (srv, base) = start_issuer(mock.clone()).await;
    let _g = Guard(srv);
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("session.json");
    {
        let h = harness(&base, &path);
        h.session.login(&LoginRequest::new("chef@acme.io", "secret")).await.unwrap();
    }

    let h = harness(&base, &path);
    assert_eq!(h.session.state(), SessionState::Expired);
    assert_eq!(h.session.identity(), None);
    assert_eq!(h.api.allergens().await.unwrap().len(), 3);
    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(h.session.state(), SessionState::Authenticated(_)));
}
