//! The axum inbound surface.
//!
//! Reserved `/.well-known/otoroshi/*` endpoints (metrics, login, logout,
//! health) are served on every host; everything else falls through to the
//! pipeline handler: route, gate, select, exchange, forward, stream, report.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::TryStreamExt;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use portcullis_types::error::GatewayError;
use portcullis_types::models::StatsView;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::env::GatewayEnv;
use crate::events::GatewayEvent;
use crate::forward::{self, headers::InboundMeta, ForwardRequest};
use crate::monitor::RequestLog;
use crate::gate::{self, ip_filter, AccessRequest, PRIVATE_APP_COOKIE_PREFIX};
use crate::router;
use crate::seccom::state_response_header_name;
use crate::stats::InFlightGuard;
use crate::store::CompiledService;

/// Sticky-balancing tracking cookie.
pub const TRACKING_COOKIE: &str = "otoroshi-tracking";
/// Tracking cookie lifetime: one year.
const TRACKING_COOKIE_MAX_AGE: u64 = 31_536_000;

/// Reserved paths served on any host.
const METRICS_PATH: &str = "/.well-known/otoroshi/metrics";
const LOGIN_PATH: &str = "/.well-known/otoroshi/login";
const LOGOUT_PATH: &str = "/.well-known/otoroshi/logout";
const HEALTH_PATH: &str = "/.well-known/otoroshi/health";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder. Idempotent.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        match builder.install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                // another recorder won the race (tests); render an empty scrape
                tracing::warn!("prometheus recorder already installed: {}", e);
                PrometheusBuilder::new().build_recorder().handle()
            }
        }
    })
}

/// Build the inbound router for one gateway instance.
pub fn build_gateway_router(env: Arc<GatewayEnv>) -> Router {
    init_metrics();
    Router::new()
        .route(METRICS_PATH, get(metrics_endpoint))
        .route(LOGIN_PATH, get(login_endpoint))
        .route(LOGOUT_PATH, get(logout_endpoint))
        .route(HEALTH_PATH, get(health_endpoint))
        .fallback(pipeline_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(env)
}

/// Periodic housekeeping: session sweep. Runs until the process stops.
pub async fn run_maintenance(env: Arc<GatewayEnv>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        env.sessions.sweep();
    }
}

// ---------------------------------------------------------------------------
// pipeline
// ---------------------------------------------------------------------------

async fn pipeline_handler(State(env): State<Arc<GatewayEnv>>, request: Request) -> Response {
    let started = Instant::now();
    let snapshot = env.view.current();

    let peer_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let method = request.method().as_str().to_uppercase();
    let path = request.uri().path().to_string();
    let raw_query = request.uri().query().map(str::to_string);

    let header_map = flatten_headers(request.headers());
    let cookies = parse_cookies(header_map.get("cookie").map(String::as_str).unwrap_or(""));
    let query = parse_query(raw_query.as_deref().unwrap_or(""));
    let client_ip =
        ip_filter::client_ip(&header_map, &peer_ip, snapshot.global.trust_x_forwarded_for);

    let Some(host) = header_map.get("host").cloned().or_else(|| {
        request.uri().host().map(str::to_string)
    }) else {
        return error_response(&GatewayError::ServiceNotFound { host: "<none>".to_string() });
    };

    // resolve the service; services sharing a host are disambiguated by the
    // api-key routing matchers
    let candidates = router::route_all(&snapshot, &host, &path);
    let Some(service) = choose_candidate(&snapshot, candidates, &AccessRequest {
        method: &method,
        path: &path,
        headers: &header_map,
        query: &query,
        cookies: &cookies,
        client_ip: &client_ip,
    }) else {
        let err = GatewayError::ServiceNotFound { host: router::normalize_host(&host) };
        env.events.publish(GatewayEvent::denied(None, &err, &client_ip));
        return error_response(&err);
    };
    let route_match = router::to_match(service, &path);
    let service = route_match.service.clone();
    let descriptor = service.descriptor.clone();

    let inbound_proto = header_map
        .get("x-forwarded-proto")
        .cloned()
        .unwrap_or_else(|| "http".to_string());
    if descriptor.force_https && inbound_proto != "https" {
        let location = format!(
            "https://{}{}{}",
            host,
            path,
            raw_query.as_deref().map(|q| format!("?{q}")).unwrap_or_default()
        );
        return redirect_response(&location, None);
    }

    let access = AccessRequest {
        method: &method,
        path: &path,
        headers: &header_map,
        query: &query,
        cookies: &cookies,
        client_ip: &client_ip,
    };
    let admission = match gate::run(
        &snapshot,
        &service,
        route_match.is_public,
        &access,
        &env.quotas,
        &env.sessions,
    ) {
        Ok(admission) => admission,
        Err(err) => {
            env.events.publish(GatewayEvent::denied(Some(&descriptor.id), &err, &client_ip));
            counter!(
                "portcullis_denied_total",
                "service" => descriptor.name.clone(),
                "error" => err.kind()
            )
            .increment(1);
            env.monitor
                .log_request(RequestLog {
                    at: Utc::now(),
                    service: Some(descriptor.id.clone()),
                    method: method.clone(),
                    path: path.clone(),
                    status: err.status(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    overhead_ms: started.elapsed().as_millis() as u64,
                    client_ip: client_ip.clone(),
                })
                .await;
            return error_response(&err);
        }
    };
    env.events.publish(GatewayEvent::CallAdmitted {
        service: descriptor.id.clone(),
        client_id: admission.apikey.as_ref().map(|k| k.client_id.clone()),
        at: Utc::now(),
    });

    // sticky tracking cookie: reuse or mint
    let (tracking_id, fresh_tracking) = match cookies.get(TRACKING_COOKIE) {
        Some(id) => (id.clone(), false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };

    let global_scope = env.stats.global();
    let service_scope = env.stats.service(&descriptor.id);
    let scopes = vec![global_scope.clone(), service_scope.clone()];
    let guard = InFlightGuard::enter(scopes.clone());

    // request body: GET/HEAD and empty bodies stay replayable (retryable)
    let body = {
        let has_body = !matches!(method.as_str(), "GET" | "HEAD" | "OPTIONS")
            && header_map
                .get("content-length")
                .and_then(|v| v.parse::<u64>().ok())
                .map(|len| len > 0)
                .unwrap_or_else(|| header_map.contains_key("transfer-encoding"));
        if has_body {
            let counting_scopes = scopes.clone();
            let stream = request.into_body().into_data_stream().inspect_ok(move |chunk| {
                for scope in &counting_scopes {
                    scope.add_data_in(chunk.len() as u64);
                }
            });
            Some(reqwest::Body::wrap_stream(stream))
        } else {
            None
        }
    };

    let reqwest_method = reqwest::Method::from_bytes(method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let forward_req = ForwardRequest {
        method: reqwest_method,
        inbound: InboundMeta {
            headers: &header_map,
            query: &query,
            client_ip: &client_ip,
            proto: &inbound_proto,
            host: &host,
        },
        remaining_path: &route_match.remaining_path,
        raw_query: raw_query.as_deref(),
        body,
        tracking_id: &tracking_id,
        is_public: route_match.is_public,
    };

    let forwarded = match forward::forward(&env, &service, &admission, forward_req).await {
        Ok(forwarded) => forwarded,
        Err(err) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            for scope in &scopes {
                scope.record_call(duration_ms, duration_ms);
            }
            counter!(
                "portcullis_requests_total",
                "service" => descriptor.name.clone(),
                "status" => err.status().to_string()
            )
            .increment(1);
            env.events.publish(GatewayEvent::denied(Some(&descriptor.id), &err, &client_ip));
            env.monitor
                .log_request(RequestLog {
                    at: Utc::now(),
                    service: Some(descriptor.id.clone()),
                    method: method.clone(),
                    path: path.clone(),
                    status: err.status(),
                    duration_ms,
                    overhead_ms: duration_ms,
                    client_ip: client_ip.clone(),
                })
                .await;
            return error_response(&err);
        }
    };

    // the status line is in: report the call now, stream the body after
    let status = forwarded.response.status().as_u16();
    let duration_ms = started.elapsed().as_millis() as u64;
    let overhead_ms = duration_ms.saturating_sub(forwarded.upstream_time_ms);
    for scope in &scopes {
        scope.record_call(duration_ms, overhead_ms);
    }
    counter!(
        "portcullis_requests_total",
        "service" => descriptor.name.clone(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("portcullis_request_duration_seconds", "service" => descriptor.name.clone())
        .record(duration_ms as f64 / 1_000.0);
    env.events.publish(GatewayEvent::CallFinished {
        service: descriptor.id.clone(),
        status,
        duration_ms,
        overhead_ms,
        at: Utc::now(),
    });
    env.monitor
        .log_request(RequestLog {
            at: Utc::now(),
            service: Some(descriptor.id.clone()),
            method: method.clone(),
            path: path.clone(),
            status,
            duration_ms,
            overhead_ms,
            client_ip: client_ip.clone(),
        })
        .await;

    let mut builder = Response::builder().status(status);
    let state_resp_header = state_response_header_name(&descriptor).to_ascii_lowercase();
    for (name, value) in forwarded.response.headers() {
        let lname = name.as_str().to_ascii_lowercase();
        if forward::headers::is_end_to_end(&lname) && lname != state_resp_header {
            builder = builder.header(name, value);
        }
    }
    if fresh_tracking {
        builder = builder.header(
            "set-cookie",
            format!(
                "{TRACKING_COOKIE}={tracking_id}; Max-Age={TRACKING_COOKIE_MAX_AGE}; Path=/"
            ),
        );
    }
    if let Some(remaining) = admission.remaining {
        builder = builder
            .header("Otoroshi-Daily-Calls-Remaining", remaining.remaining_daily)
            .header("Otoroshi-Monthly-Calls-Remaining", remaining.remaining_monthly);
    }

    let cfg = &descriptor.client_config;
    // the stream budget is measured from the winning attempt's dispatch, not
    // from inbound arrival
    let attempt_started = forwarded.started;
    let body_stream = forward::guarded_body_stream(
        forwarded.response,
        Duration::from_millis(cfg.idle_timeout),
        attempt_started + Duration::from_millis(cfg.call_and_stream_timeout),
        scopes,
        descriptor.id.clone(),
        guard,
    );

    match builder.body(Body::from_stream(body_stream)) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("failed to assemble client response: {}", e);
            error_response(&GatewayError::Internal { message: "response assembly".to_string() })
        }
    }
}

/// Pick the preferred candidate. With several services behind one host the
/// api-key routing matchers disambiguate; a key matching no constrained
/// candidate falls back to the preference order.
fn choose_candidate(
    snapshot: &crate::store::ConfigSnapshot,
    candidates: Vec<Arc<CompiledService>>,
    req: &AccessRequest<'_>,
) -> Option<Arc<CompiledService>> {
    if candidates.len() <= 1 {
        return candidates.into_iter().next();
    }
    if let Some(key) = gate::apikey::peek_client_id(snapshot, req) {
        if let Some(matching) = candidates
            .iter()
            .find(|svc| svc.descriptor.api_key_constraints.routing.matches(&key))
        {
            return Some(matching.clone());
        }
    }
    candidates.into_iter().next()
}

// ---------------------------------------------------------------------------
// reserved endpoints
// ---------------------------------------------------------------------------

async fn health_endpoint(State(env): State<Arc<GatewayEnv>>) -> Response {
    let snapshot = env.view.current();
    let body = json!({
        "status": "healthy",
        "snapshotVersion": snapshot.version,
        "inFlight": env.stats.global().in_flight(),
        "uptimeSecs": env.stats.uptime_secs(),
    });
    json_response(200, &body)
}

async fn metrics_endpoint(State(env): State<Arc<GatewayEnv>>, request: Request) -> Response {
    let snapshot = env.view.current();
    if !snapshot.global.metrics_enabled {
        return error_response(&GatewayError::ServiceNotFound { host: "metrics".to_string() });
    }

    let query = parse_query(request.uri().query().unwrap_or(""));
    if let Some(expected) = &snapshot.global.metrics_access_key {
        if query.get("access_key") != Some(expected) {
            return error_response(&GatewayError::AuthRequired {
                message: "bad metrics access key".to_string(),
            });
        }
    }

    let accept = request
        .headers()
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let format = negotiate_metrics_format(query.get("format").map(String::as_str), &accept);

    match format {
        MetricsFormat::Prometheus => {
            let rendered = init_metrics().render();
            match Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4")
                .body(Body::from(rendered))
            {
                Ok(response) => response,
                Err(_) => error_response(&GatewayError::Internal {
                    message: "metrics rendering".to_string(),
                }),
            }
        }
        MetricsFormat::Json => {
            let local = env.stats.global().view();
            let per_service: Vec<serde_json::Value> = env
                .stats
                .all_services()
                .into_iter()
                .map(|(id, counters)| json!({ "service": id, "stats": counters.view() }))
                .collect();
            let cluster: StatsView = if env.leader {
                env.cluster.aggregate(local)
            } else {
                local
            };
            let recent = env.monitor.get_logs(Some(20)).await;
            json_response(
                200,
                &json!({
                    "globalLiveStats": cluster,
                    "localLiveStats": local,
                    "perService": per_service,
                    "recentCalls": recent,
                }),
            )
        }
        MetricsFormat::OldJson => {
            let (calls, data_in, data_out) = env.stats.global().totals();
            let (duration, overhead) = env.stats.global().lifetime_averages();
            json_response(
                200,
                &json!({
                    "calls": calls,
                    "dataIn": data_in,
                    "dataOut": data_out,
                    "avgDuration": duration,
                    "avgOverhead": overhead,
                }),
            )
        }
    }
}

async fn login_endpoint(State(env): State<Arc<GatewayEnv>>, request: Request) -> Response {
    let query = parse_query(request.uri().query().unwrap_or(""));
    let (Some(session_id), Some(redirect_to)) =
        (query.get("sessionId"), query.get("redirectTo"))
    else {
        return error_response(&GatewayError::Internal {
            message: "sessionId and redirectTo are required".to_string(),
        });
    };
    if env.sessions.get(session_id).is_none() {
        return error_response(&GatewayError::AuthRequired {
            message: "unknown session".to_string(),
        });
    }

    let suffix = query.get("cp").cloned().unwrap_or_else(|| "default".to_string());
    let max_age = query
        .get("ma")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(86_400);
    let domain = query
        .get("host")
        .map(|h| format!("; Domain={h}"))
        .unwrap_or_default();
    let cookie = format!(
        "{PRIVATE_APP_COOKIE_PREFIX}{suffix}={session_id}; Max-Age={max_age}{domain}; Path=/; HttpOnly"
    );
    redirect_response(redirect_to, Some(cookie))
}

async fn logout_endpoint(State(env): State<Arc<GatewayEnv>>, request: Request) -> Response {
    let query = parse_query(request.uri().query().unwrap_or(""));
    let header_map = flatten_headers(request.headers());
    let cookies = parse_cookies(header_map.get("cookie").map(String::as_str).unwrap_or(""));

    let suffix = query.get("cp").cloned().unwrap_or_else(|| "default".to_string());
    let cookie_name = format!("{PRIVATE_APP_COOKIE_PREFIX}{suffix}");
    if let Some(session_id) = cookies.get(&cookie_name) {
        env.sessions.destroy(session_id);
    }
    let clear = format!("{cookie_name}=; Max-Age=0; Path=/; HttpOnly");
    let redirect_to = query.get("redirectTo").cloned().unwrap_or_else(|| "/".to_string());
    redirect_response(&redirect_to, Some(clear))
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricsFormat {
    Json,
    OldJson,
    Prometheus,
}

fn negotiate_metrics_format(query_format: Option<&str>, accept: &str) -> MetricsFormat {
    match query_format {
        Some("json") => return MetricsFormat::Json,
        Some("old_json") => return MetricsFormat::OldJson,
        Some("prometheus") => return MetricsFormat::Prometheus,
        _ => {}
    }
    if accept.contains("application/prometheus") {
        MetricsFormat::Prometheus
    } else {
        MetricsFormat::Json
    }
}

/// Lowercased single-value view of the inbound headers.
fn flatten_headers(headers: &axum::http::HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_ascii_lowercase())
                .or_insert_with(|| value.to_string());
        }
    }
    out
}

fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn json_response(status: u16, body: &serde_json::Value) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(bytes))
        .unwrap_or_default()
}

fn redirect_response(location: &str, set_cookie: Option<String>) -> Response {
    let mut builder = Response::builder().status(303).header("location", location);
    if let Some(cookie) = set_cookie {
        builder = builder.header("set-cookie", cookie);
    }
    builder.body(Body::empty()).unwrap_or_default()
}

/// Map a gateway error to its JSON response.
pub fn error_response(err: &GatewayError) -> Response {
    json_response(err.status(), &err.to_json())
}
