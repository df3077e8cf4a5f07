use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde_json::{json, Value};
use tower::ServiceExt;
use tower_cookies::Key;

use ynot::did::IdentityResolver;
use ynot::oauth::jwk;
use ynot::oauth::proxy::pds_authed_request;
use ynot::oauth::store::{MemoryStore, OAuthSession, SessionStore};
use ynot::oauth::token::ClientAuth;
use ynot::routes;
use ynot::security::SafeUrlGuard;
use ynot::state::{AppState, OAuthConfig, OAUTH_SCOPE};

const DID: &str = "did:plc:testaccount123";
const HANDLE: &str = "alice.test";

/// How the fixture PDS answers `com.atproto.server.getSession`.
#[derive(Clone, Copy, PartialEq)]
enum PdsMode {
    Ok,
    /// First call gets `401 invalid_token`; calls carrying the refreshed
    /// access token succeed.
    ExpireFirst,
    /// First call demands a DPoP nonce; the retry succeeds.
    NonceFirst,
}

struct FixtureState {
    base: String,
    par_calls: usize,
    token_calls: usize,
    refresh_calls: usize,
    pds_calls: usize,
    last_par_form: Option<HashMap<String, String>>,
    demand_par_nonce: bool,
    pds_mode: PdsMode,
}

type Fx = Arc<Mutex<FixtureState>>;

async fn protected_resource(State(fx): State<Fx>) -> Json<Value> {
    let base = fx.lock().unwrap().base.clone();
    Json(json!({ "authorization_servers": [base] }))
}

async fn authserver_metadata(State(fx): State<Fx>) -> Json<Value> {
    let base = fx.lock().unwrap().base.clone();
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "pushed_authorization_request_endpoint": format!("{base}/par"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none", "private_key_jwt"],
        "token_endpoint_auth_signing_alg_values_supported": ["ES256"],
        "scopes_supported": ["atproto", "transition:generic"],
        "authorization_response_iss_parameter_supported": true,
        "require_pushed_authorization_requests": true,
        "dpop_signing_alg_values_supported": ["ES256"],
        "client_id_metadata_document_supported": true,
    }))
}

async fn par_endpoint(
    State(fx): State<Fx>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    assert!(headers.contains_key("DPoP"), "PAR request must carry a DPoP proof");
    let form: HashMap<String, String> = serde_urlencoded::from_str(&body).unwrap();

    let mut fx = fx.lock().unwrap();
    fx.par_calls += 1;
    fx.last_par_form = Some(form);

    if fx.demand_par_nonce && fx.par_calls == 1 {
        return (
            StatusCode::BAD_REQUEST,
            [("DPoP-Nonce", "authserver-nonce-1")],
            Json(json!({ "error": "use_dpop_nonce" })),
        )
            .into_response();
    }

    (
        StatusCode::CREATED,
        Json(json!({
            "request_uri": "urn:ietf:params:oauth:request_uri:req-1",
            "expires_in": 60,
        })),
    )
        .into_response()
}

async fn token_endpoint(
    State(fx): State<Fx>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    assert!(headers.contains_key("DPoP"), "token request must carry a DPoP proof");
    let form: HashMap<String, String> = serde_urlencoded::from_str(&body).unwrap();

    let mut fx = fx.lock().unwrap();
    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {
            fx.token_calls += 1;
            assert!(form.contains_key("code_verifier"));
            assert!(form.contains_key("client_assertion"));
            Json(json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "sub": DID,
                "scope": OAUTH_SCOPE,
                "token_type": "DPoP",
                "expires_in": 3600,
            }))
            .into_response()
        }
        Some("refresh_token") => {
            fx.refresh_calls += 1;
            assert_eq!(form.get("refresh_token").unwrap(), "rt-1");
            Json(json!({
                "access_token": "at-2",
                "refresh_token": "rt-2",
                "sub": DID,
                "scope": OAUTH_SCOPE,
                "token_type": "DPoP",
                "expires_in": 3600,
            }))
            .into_response()
        }
        other => panic!("unexpected grant_type: {other:?}"),
    }
}

async fn resolve_handle() -> Json<Value> {
    Json(json!({ "did": DID }))
}

async fn plc_document(State(fx): State<Fx>, Path(did): Path<String>) -> Json<Value> {
    assert_eq!(did, DID);
    let base = fx.lock().unwrap().base.clone();
    Json(json!({
        "id": DID,
        "alsoKnownAs": [format!("at://{HANDLE}")],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": base,
        }],
    }))
}

async fn get_session(State(fx): State<Fx>, headers: HeaderMap) -> impl IntoResponse {
    assert!(headers.contains_key("DPoP"));
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(authorization.starts_with("DPoP "));

    let mut fx = fx.lock().unwrap();
    fx.pds_calls += 1;
    let first = fx.pds_calls == 1;

    match fx.pds_mode {
        PdsMode::ExpireFirst if authorization.ends_with("at-1") => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_token" })),
        )
            .into_response(),
        PdsMode::NonceFirst if first => (
            StatusCode::UNAUTHORIZED,
            [("DPoP-Nonce", "pds-nonce-1")],
            Json(json!({ "error": "use_dpop_nonce" })),
        )
            .into_response(),
        _ => Json(json!({ "did": DID, "handle": HANDLE })).into_response(),
    }
}

/// Spin up one server that plays authserver, PDS, PLC directory, and
/// AppView all at once.
async fn spawn_fixture(demand_par_nonce: bool, pds_mode: PdsMode) -> (String, Fx) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let fx: Fx = Arc::new(Mutex::new(FixtureState {
        base: base.clone(),
        par_calls: 0,
        token_calls: 0,
        refresh_calls: 0,
        pds_calls: 0,
        last_par_form: None,
        demand_par_nonce,
        pds_mode,
    }));

    let app = axum::Router::new()
        .route("/.well-known/oauth-protected-resource", get(protected_resource))
        .route("/.well-known/oauth-authorization-server", get(authserver_metadata))
        .route("/par", post(par_endpoint))
        .route("/token", post(token_endpoint))
        .route("/xrpc/com.atproto.identity.resolveHandle", get(resolve_handle))
        .route("/plc/:did", get(plc_document))
        .route("/xrpc/com.atproto.server.getSession", get(get_session))
        .with_state(fx.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base, fx)
}

fn test_state(base: &str) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let http = reqwest::Client::new();
    let guard = SafeUrlGuard::new(true);
    let signing_key = jwk::generate_key();
    let kid = jwk::key_id(&signing_key).unwrap();

    let state = AppState {
        store: store.clone(),
        http: http.clone(),
        guard,
        resolver: IdentityResolver::new(
            http,
            guard,
            base.to_string(),
            format!("{base}/plc"),
        ),
        oauth: OAuthConfig {
            signing_key,
            kid,
            scope: OAUTH_SCOPE.to_string(),
        },
        cookie_key: Key::generate(),
        domain: "ynot.test".to_string(),
        protocol: "https".to_string(),
    };
    (state, store)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn do_login(app: &axum::Router) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/oauth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({ "identifier": HANDLE }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap()
}

fn par_state(fx: &Fx) -> String {
    fx.lock()
        .unwrap()
        .last_par_form
        .as_ref()
        .unwrap()
        .get("state")
        .unwrap()
        .clone()
}

async fn do_callback(app: &axum::Router, base: &str, state_param: &str) -> axum::response::Response {
    let uri = format!(
        "/oauth/callback?{}",
        serde_urlencoded::to_string([
            ("state", state_param),
            ("iss", base),
            ("code", "authcode-1"),
        ])
        .unwrap()
    );
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

fn session_cookie(response: &axum::response::Response) -> String {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap())
        .find(|v| v.starts_with("ynot_session="))
        .expect("session cookie should be set")
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn login_pushes_authorization_request_with_one_nonce_retry() {
    let (base, fx) = spawn_fixture(true, PdsMode::Ok).await;
    let (state, _store) = test_state(&base);
    let app = routes::routes(state);

    let response = do_login(&app).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let redirect_url = body["redirect_url"].as_str().unwrap();
    assert!(redirect_url.starts_with(&format!("{base}/authorize?")));
    assert!(redirect_url.contains("request_uri="));

    // exactly one retry after the nonce demand
    let fx = fx.lock().unwrap();
    assert_eq!(fx.par_calls, 2);
    let form = fx.last_par_form.as_ref().unwrap();
    assert_eq!(form.get("login_hint").unwrap(), HANDLE);
    assert_eq!(form.get("scope").unwrap(), OAUTH_SCOPE);
    assert_eq!(form.get("code_challenge_method").unwrap(), "S256");
}

#[tokio::test]
async fn callback_establishes_session_and_consumes_request() {
    let (base, fx) = spawn_fixture(false, PdsMode::Ok).await;
    let (state, store) = test_state(&base);
    let app = routes::routes(state);

    assert_eq!(do_login(&app).await.status(), StatusCode::OK);
    let state_param = par_state(&fx);

    let response = do_callback(&app, &base, &state_param).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    session_cookie(&response);

    let session = store.get_session(DID).await.unwrap().unwrap();
    assert_eq!(session.access_token, "at-1");
    assert_eq!(session.refresh_token, "rt-1");
    assert_eq!(session.handle.as_deref(), Some(HANDLE));
    assert_eq!(session.authserver_issuer, base);
    assert_eq!(fx.lock().unwrap().token_calls, 1);
}

#[tokio::test]
async fn callback_replay_is_rejected() {
    let (base, fx) = spawn_fixture(false, PdsMode::Ok).await;
    let (state, _store) = test_state(&base);
    let app = routes::routes(state);

    assert_eq!(do_login(&app).await.status(), StatusCode::OK);
    let state_param = par_state(&fx);

    assert_eq!(
        do_callback(&app, &base, &state_param).await.status(),
        StatusCode::SEE_OTHER
    );

    // Same state again: the pending request is gone.
    let replay = do_callback(&app, &base, &state_param).await;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    let body = body_json(replay).await;
    assert_eq!(body["detail"], "Invalid state");

    // second token exchange never happened
    assert_eq!(fx.lock().unwrap().token_calls, 1);
}

#[tokio::test]
async fn callback_rejects_issuer_mismatch() {
    let (base, fx) = spawn_fixture(false, PdsMode::Ok).await;
    let (state, store) = test_state(&base);
    let app = routes::routes(state);

    assert_eq!(do_login(&app).await.status(), StatusCode::OK);
    let state_param = par_state(&fx);

    let response = do_callback(&app, "https://evil.example.com", &state_param).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(store.get_session(DID).await.unwrap().is_none());
    assert_eq!(fx.lock().unwrap().token_calls, 0);
}

#[tokio::test]
async fn second_login_for_same_account_conflicts() {
    let (base, fx) = spawn_fixture(false, PdsMode::Ok).await;
    let (state, _store) = test_state(&base);
    let app = routes::routes(state);

    assert_eq!(do_login(&app).await.status(), StatusCode::OK);
    let first_state = par_state(&fx);
    assert_eq!(
        do_callback(&app, &base, &first_state).await.status(),
        StatusCode::SEE_OTHER
    );

    assert_eq!(do_login(&app).await.status(), StatusCode::OK);
    let second_state = par_state(&fx);
    let conflict = do_callback(&app, &base, &second_state).await;
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn whoami_proxies_the_pds_answer() {
    let (base, fx) = spawn_fixture(false, PdsMode::Ok).await;
    let (state, _store) = test_state(&base);
    let app = routes::routes(state);

    assert_eq!(do_login(&app).await.status(), StatusCode::OK);
    let state_param = par_state(&fx);
    let callback = do_callback(&app, &base, &state_param).await;
    let cookie = session_cookie(&callback);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/oauth/whoami")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["did"], DID);
}

#[tokio::test]
async fn whoami_without_session_is_unauthorized() {
    let (base, _fx) = spawn_fixture(false, PdsMode::Ok).await;
    let (state, _store) = test_state(&base);
    let app = routes::routes(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/oauth/whoami")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

fn seeded_session(base: &str, dpop_key_pem: String) -> OAuthSession {
    OAuthSession {
        did: DID.to_string(),
        handle: Some(HANDLE.to_string()),
        pds_url: base.to_string(),
        authserver_issuer: base.to_string(),
        access_token: "at-1".to_string(),
        refresh_token: "rt-1".to_string(),
        dpop_authserver_nonce: String::new(),
        dpop_pds_nonce: String::new(),
        dpop_private_key: dpop_key_pem,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn expired_token_triggers_exactly_one_refresh_and_retry() {
    let (base, fx) = spawn_fixture(false, PdsMode::ExpireFirst).await;
    let (state, store) = test_state(&base);

    let dpop_key = jwk::generate_key();
    let session = seeded_session(&base, jwk::key_to_pem(&dpop_key).unwrap());
    store.create_session(session.clone()).await.unwrap();

    let client_id = state.client_id();
    let redirect_uri = state.redirect_uri();
    let auth = ClientAuth {
        client_id: &client_id,
        redirect_uri: &redirect_uri,
        key: &state.oauth.signing_key,
        kid: &state.oauth.kid,
    };

    let url = format!("{base}/xrpc/com.atproto.server.getSession");
    let resp = pds_authed_request(
        &state.http,
        &state.guard,
        store.as_ref(),
        &auth,
        &session,
        reqwest::Method::GET,
        &url,
        None,
    )
    .await
    .unwrap();

    assert_eq!(resp.status, reqwest::StatusCode::OK);
    {
        let fx = fx.lock().unwrap();
        assert_eq!(fx.pds_calls, 2, "one retry after the refresh");
        assert_eq!(fx.refresh_calls, 1);
    }

    // The refreshed tokens were persisted before the retry.
    let updated = store.get_session(DID).await.unwrap().unwrap();
    assert_eq!(updated.access_token, "at-2");
    assert_eq!(updated.refresh_token, "rt-2");
}

#[tokio::test]
async fn pds_nonce_demand_is_retried_once_and_persisted() {
    let (base, fx) = spawn_fixture(false, PdsMode::NonceFirst).await;
    let (state, store) = test_state(&base);

    let dpop_key = jwk::generate_key();
    let session = seeded_session(&base, jwk::key_to_pem(&dpop_key).unwrap());
    store.create_session(session.clone()).await.unwrap();

    let client_id = state.client_id();
    let redirect_uri = state.redirect_uri();
    let auth = ClientAuth {
        client_id: &client_id,
        redirect_uri: &redirect_uri,
        key: &state.oauth.signing_key,
        kid: &state.oauth.kid,
    };

    let url = format!("{base}/xrpc/com.atproto.server.getSession");
    let resp = pds_authed_request(
        &state.http,
        &state.guard,
        store.as_ref(),
        &auth,
        &session,
        reqwest::Method::GET,
        &url,
        None,
    )
    .await
    .unwrap();

    assert_eq!(resp.status, reqwest::StatusCode::OK);
    {
        let fx = fx.lock().unwrap();
        assert_eq!(fx.pds_calls, 2);
        assert_eq!(fx.refresh_calls, 0, "a nonce demand is not a refresh");
    }

    let updated = store.get_session(DID).await.unwrap().unwrap();
    assert_eq!(updated.dpop_pds_nonce, "pds-nonce-1");
}

#[tokio::test]
async fn logout_deletes_the_session() {
    let (base, fx) = spawn_fixture(false, PdsMode::Ok).await;
    let (state, store) = test_state(&base);
    let app = routes::routes(state);

    assert_eq!(do_login(&app).await.status(), StatusCode::OK);
    let state_param = par_state(&fx);
    let callback = do_callback(&app, &base, &state_param).await;
    let cookie = session_cookie(&callback);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/oauth/logout")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(store.get_session(DID).await.unwrap().is_none());
}

#[tokio::test]
async fn client_metadata_document_is_consistent() {
    let (base, _fx) = spawn_fixture(false, PdsMode::Ok).await;
    let (state, _store) = test_state(&base);
    let client_id = state.client_id();
    let app = routes::routes(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/client-metadata.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["client_id"], client_id.as_str());
    assert_eq!(body["token_endpoint_auth_method"], "private_key_jwt");
    assert_eq!(body["dpop_bound_access_tokens"], true);
    assert_eq!(body["scope"], OAUTH_SCOPE);
    assert!(body["jwks"]["keys"][0].get("d").is_none());
}
