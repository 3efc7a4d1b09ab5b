#![allow(clippy::expect_used, reason = "integration test - panics are the assertion mechanism")]
#![allow(clippy::unwrap_used, reason = "integration test - panics are the assertion mechanism")]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{EncodingKey, Header};
use portcullis_core::env::{GatewayEnv, InstancePosition};
use portcullis_core::server::build_gateway_router;
use portcullis_core::store::Datastore;
use portcullis_types::models::{
    ApiKey, ApiKeyRouteMatcher, ClientConfig, IpFiltering, JwtTokenLocation, JwtVerifier,
    SecComVersion, ServiceDescriptor, ServiceJwtVerifier, Target, TargetScheme,
};
use portcullis_types::AlgoSettings;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const SECCOM_SECRET: &str = "seccom-shared-secret";

fn target_for(server: &MockServer) -> Target {
    let addr = server.address();
    Target {
        host: format!("{}:{}", addr.ip(), addr.port()),
        scheme: TargetScheme::Http,
        ..Default::default()
    }
}

fn service(id: &str, targets: Vec<Target>) -> ServiceDescriptor {
    ServiceDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        subdomain: "api".to_string(),
        domain: "oto.tools".to_string(),
        exposed_domain_override: Some("127.0.0.1".to_string()),
        targets,
        ..Default::default()
    }
}

fn public_service(id: &str, targets: Vec<Target>) -> ServiceDescriptor {
    let mut svc = service(id, targets);
    svc.public_patterns = vec!["/.*".to_string()];
    svc
}

fn apikey(id: &str) -> ApiKey {
    ApiKey {
        client_id: id.to_string(),
        client_secret: format!("{id}-secret"),
        client_name: format!("{id}-name"),
        authorized_group: "default".to_string(),
        ..Default::default()
    }
}

async fn spawn_gateway(services: Vec<ServiceDescriptor>, keys: Vec<ApiKey>) -> SocketAddr {
    let store = Arc::new(Datastore::new());
    for svc in services {
        store.upsert_service(svc).await;
    }
    for key in keys {
        store.upsert_apikey(key).await;
    }
    let env = Arc::new(GatewayEnv::new(store, InstancePosition::default()));
    let app = build_gateway_router(env);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    addr
}

fn gateway_url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

async fn mock_200(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn api_key_tags_route_between_services_sharing_a_host() {
    let user_upstream = mock_200("users-service").await;
    let admin_upstream = mock_200("admin-service").await;
    let leveled_upstream = mock_200("leveled-service").await;

    let mut s1 = service("s1", vec![target_for(&user_upstream)]);
    s1.api_key_constraints.routing =
        ApiKeyRouteMatcher { one_tag_in: vec!["user".into()], ..Default::default() };
    let mut s2 = service("s2", vec![target_for(&admin_upstream)]);
    s2.api_key_constraints.routing =
        ApiKeyRouteMatcher { one_tag_in: vec!["admin".into()], ..Default::default() };
    let mut s3 = service("s3", vec![target_for(&leveled_upstream)]);
    s3.api_key_constraints.routing = ApiKeyRouteMatcher {
        all_meta_in: [
            ("level".to_string(), "2".to_string()),
            ("root".to_string(), "true".to_string()),
        ]
        .into(),
        ..Default::default()
    };

    let mut tagged = apikey("ck-tagged");
    tagged.tags = ["user".to_string(), "foo".to_string()].into_iter().collect();
    let mut leveled = apikey("ck-leveled");
    leveled.metadata = [
        ("level".to_string(), "2".to_string()),
        ("root".to_string(), "true".to_string()),
    ]
    .into();

    let addr = spawn_gateway(vec![s1, s2, s3], vec![tagged, leveled]).await;
    let client = reqwest::Client::new();

    let response = client
        .get(gateway_url(addr, "/resource"))
        .header("Otoroshi-Client-Id", "ck-tagged")
        .header("Otoroshi-Client-Secret", "ck-tagged-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "users-service");

    let response = client
        .get(gateway_url(addr, "/resource"))
        .header("Otoroshi-Client-Id", "ck-leveled")
        .header("Otoroshi-Client-Secret", "ck-leveled-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "leveled-service");

    assert_eq!(user_upstream.received_requests().await.unwrap().len(), 1);
    assert_eq!(admin_upstream.received_requests().await.unwrap().len(), 0);
    assert_eq!(leveled_upstream.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn weighted_round_robin_spreads_exactly_three_two_one() {
    let heavy = mock_200("heavy").await;
    let medium = mock_200("medium").await;
    let light = mock_200("light").await;

    let mut t_heavy = target_for(&heavy);
    t_heavy.weight = 3;
    let mut t_medium = target_for(&medium);
    t_medium.weight = 2;
    let t_light = target_for(&light);

    let svc = public_service("weighted", vec![t_heavy, t_medium, t_light]);
    let addr = spawn_gateway(vec![svc], vec![]).await;
    let client = reqwest::Client::new();

    for _ in 0..6 {
        let response = client.get(gateway_url(addr, "/ping")).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }

    assert_eq!(heavy.received_requests().await.unwrap().len(), 3);
    assert_eq!(medium.received_requests().await.unwrap().len(), 2);
    assert_eq!(light.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn call_timeout_fails_the_slow_target_then_serves_from_the_fast_one() {
    let slow = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(2_000)),
        )
        .mount(&slow)
        .await;
    let fast = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("fast")
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&fast)
        .await;

    let mut svc = public_service("timed", vec![target_for(&slow), target_for(&fast)]);
    svc.client_config = ClientConfig { call_timeout: 1_000, ..Default::default() };
    let addr = spawn_gateway(vec![svc], vec![]).await;
    let client = reqwest::Client::new();

    // round robin: first call lands on the slow target and times out
    let response = client.get(gateway_url(addr, "/data")).send().await.unwrap();
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "errors.upstream.timeout");

    // second call rotates to the fast target
    let response = client.get(gateway_url(addr, "/data")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "fast");
}

/// Upstream double that plays the secure-communication exchange: it reads the
/// state from the inbound challenge token and echoes it back in its own
/// signed token, declaring the configured lifetime.
struct StateEchoResponder {
    declared_lifetime: i64,
}

impl Respond for StateEchoResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let token = request
            .headers
            .get("Otoroshi-State")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let payload = token.split('.').nth(1).unwrap_or_default();
        let claims: serde_json::Value = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        let state = claims.get("state").and_then(|v| v.as_str()).unwrap_or_default();

        let iat = chrono::Utc::now().timestamp();
        let echo = jsonwebtoken::encode(
            &Header::new(jsonwebtoken::Algorithm::HS512),
            &json!({ "state-resp": state, "iat": iat, "exp": iat + self.declared_lifetime }),
            &EncodingKey::from_secret(SECCOM_SECRET.as_bytes()),
        )
        .unwrap();
        ResponseTemplate::new(200)
            .set_body_string("secured")
            .insert_header("Otoroshi-State-Resp", echo.as_str())
    }
}

async fn seccom_gateway(declared_lifetime: i64) -> (SocketAddr, MockServer) {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(StateEchoResponder { declared_lifetime })
        .mount(&upstream)
        .await;

    let mut svc = service("secured", vec![target_for(&upstream)]);
    svc.enforce_secure_communication = true;
    svc.sec_com_version = SecComVersion::V2;
    svc.sec_com_ttl = 10;
    svc.sec_com_settings = AlgoSettings::Hmac { size: 512, secret: SECCOM_SECRET.into() };
    let addr = spawn_gateway(vec![svc], vec![apikey("ck-sec")]).await;
    (addr, upstream)
}

#[tokio::test]
async fn secure_communication_v2_enforces_the_declared_ttl() {
    let client = reqwest::Client::new();

    // upstream declares exp = iat + 20s against a 10s ttl: rejected
    let (addr, _upstream) = seccom_gateway(20).await;
    let response = client
        .get(gateway_url(addr, "/x"))
        .header("Otoroshi-Client-Id", "ck-sec")
        .header("Otoroshi-Client-Secret", "ck-sec-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "errors.upstream.token.invalid");

    // a compliant upstream declaring exactly the ttl succeeds
    let (addr, _upstream) = seccom_gateway(10).await;
    let response = client
        .get(gateway_url(addr, "/x"))
        .header("Otoroshi-Client-Id", "ck-sec")
        .header("Otoroshi-Client-Secret", "ck-sec-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "secured");
}

#[tokio::test]
async fn strict_jwt_verifier_checks_array_claims() {
    let upstream = mock_200("verified").await;
    let mut svc = service("jwt-guarded", vec![target_for(&upstream)]);
    svc.jwt_verifier = Some(ServiceJwtVerifier::Local(JwtVerifier {
        strict: true,
        source: JwtTokenLocation::InHeader { name: "X-JWT-Token".into() },
        algo_settings: AlgoSettings::Hmac { size: 512, secret: "idp-secret".into() },
        verification_settings: portcullis_types::models::VerificationSettings {
            array_fields: [("roles".to_string(), "user".to_string())].into(),
            ..Default::default()
        },
        ..Default::default()
    }));
    let addr = spawn_gateway(vec![svc], vec![]).await;
    let client = reqwest::Client::new();

    let sign = |roles: serde_json::Value| {
        jsonwebtoken::encode(
            &Header::new(jsonwebtoken::Algorithm::HS512),
            &json!({ "sub": "u1", "roles": roles }),
            &EncodingKey::from_secret(b"idp-secret"),
        )
        .unwrap()
    };

    let response = client
        .get(gateway_url(addr, "/x"))
        .header("X-JWT-Token", sign(json!(["yo", "foo", "user"])))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "verified");

    let response = client
        .get(gateway_url(addr, "/x"))
        .header("X-JWT-Token", sign(json!(["yo", "foo", "admin"])))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "error.bad.token");
}

#[tokio::test]
async fn cidr_blacklist_blocks_the_covered_range() {
    let upstream = mock_200("open").await;
    let mut svc = public_service("filtered", vec![target_for(&upstream)]);
    svc.ip_filtering =
        IpFiltering { whitelist: vec![], blacklist: vec!["1.1.1.128/26".to_string()] };
    let addr = spawn_gateway(vec![svc], vec![]).await;
    let client = reqwest::Client::new();

    for (ip, expected) in
        [("1.1.1.128", 403), ("1.1.1.191", 403), ("1.1.1.192", 200)]
    {
        let response = client
            .get(gateway_url(addr, "/x"))
            .header("X-Forwarded-For", ip)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), expected, "ip {ip}");
    }
}

#[tokio::test]
async fn forwarding_sets_the_wire_contract_headers_and_tracking_cookie() {
    let upstream = mock_200("plain").await;
    let svc = public_service("contract", vec![target_for(&upstream)]);
    let addr = spawn_gateway(vec![svc], vec![]).await;

    let client = reqwest::Client::new();
    let response = client.get(gateway_url(addr, "/hello")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    // sticky tracking cookie minted on first contact
    let cookie = response
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .expect("tracking cookie missing");
    assert!(cookie.starts_with("otoroshi-tracking="));

    let seen = upstream.received_requests().await.unwrap();
    let forwarded = &seen[0];
    assert!(forwarded.headers.get("x-forwarded-for").is_some());
    assert_eq!(
        forwarded.headers.get("x-forwarded-host").and_then(|v| v.to_str().ok()),
        Some(format!("127.0.0.1:{}", addr.port()).as_str())
    );
    assert_eq!(
        forwarded.headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()),
        Some("http")
    );
}

#[tokio::test]
async fn request_bodies_stream_through_to_the_target() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(body_string("chunked payload"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&upstream)
        .await;

    let svc = public_service("ingest", vec![target_for(&upstream)]);
    let addr = spawn_gateway(vec![svc], vec![]).await;

    let client = reqwest::Client::new();
    let response = client
        .post(gateway_url(addr, "/ingest"))
        .body("chunked payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
}

#[tokio::test]
async fn unknown_hosts_get_the_service_not_found_shape() {
    let addr = spawn_gateway(vec![], vec![]).await;
    let client = reqwest::Client::new();
    let response = client.get(gateway_url(addr, "/x")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "errors.service.not.found");
}

#[tokio::test]
async fn quota_headers_and_429_on_exhaustion() {
    let upstream = mock_200("counted").await;
    let svc = service("quotaed", vec![target_for(&upstream)]);
    let mut key = apikey("ck-quota");
    key.daily_quota = 2;
    let addr = spawn_gateway(vec![svc], vec![key]).await;
    let client = reqwest::Client::new();

    let send = || {
        client
            .get(gateway_url(addr, "/x"))
            .header("Otoroshi-Client-Id", "ck-quota")
            .header("Otoroshi-Client-Secret", "ck-quota-secret")
            .send()
    };

    let first = send().await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(
        first.headers().get("Otoroshi-Daily-Calls-Remaining").and_then(|v| v.to_str().ok()),
        Some("1")
    );

    let second = send().await.unwrap();
    assert_eq!(second.status(), 200);

    let third = send().await.unwrap();
    assert_eq!(third.status(), 429);
    let body: serde_json::Value = third.json().await.unwrap();
    assert_eq!(body["error"], "errors.quota.exceeded");
}

#[tokio::test]
async fn metrics_endpoint_negotiates_formats() {
    let upstream = mock_200("traffic").await;
    let svc = public_service("observed", vec![target_for(&upstream)]);
    let addr = spawn_gateway(vec![svc], vec![]).await;
    let client = reqwest::Client::new();

    // generate a little traffic first
    for _ in 0..3 {
        client.get(gateway_url(addr, "/x")).send().await.unwrap();
    }

    let response = client
        .get(gateway_url(addr, "/.well-known/otoroshi/metrics?format=json"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["globalLiveStats"].is_object());
    assert!(body["perService"].is_array());

    let response = client
        .get(gateway_url(addr, "/.well-known/otoroshi/metrics?format=prometheus"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(gateway_url(addr, "/.well-known/otoroshi/metrics?format=old_json"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["calls"].as_u64().unwrap() >= 3);
}
