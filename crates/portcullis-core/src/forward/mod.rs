//! Upstream forwarding: target attempts, timeouts, streaming.
//!
//! One request becomes up to `clientConfig.retries` attempts, each against a
//! target not yet used by this request. An attempt covers target selection,
//! the secure-communication exchange, dispatch under `callTimeout`, and state
//! echo validation; retryable failures move on to the next target while the
//! per-request `globalTimeout` allows. Response bodies stream back under the
//! idle and call-and-stream deadlines without buffering.

pub mod client;
pub mod headers;

pub use client::UpstreamClients;

use crate::balancing::{eligible_targets, SelectionKeys};
use crate::env::GatewayEnv;
use crate::events::GatewayEvent;
use crate::gate::Admission;
use crate::seccom::{self, state_response_header_name, CallerIdentity, ExchangePhase};
use crate::stats::{InFlightGuard, LiveCounters};
use crate::store::CompiledService;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::Stream;
use futures::StreamExt;
use portcullis_types::error::{GatewayError, GatewayResult};
use portcullis_types::models::Target;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Everything the forwarding loop needs to know about the inbound request.
pub struct ForwardRequest<'a> {
    /// HTTP method
    pub method: reqwest::Method,
    /// Inbound metadata for header rewriting
    pub inbound: headers::InboundMeta<'a>,
    /// Path with the service root stripped
    pub remaining_path: &'a str,
    /// Raw query string, passed through untouched
    pub raw_query: Option<&'a str>,
    /// Request body; a present body disables retries (it streams once)
    pub body: Option<reqwest::Body>,
    /// Tracking-cookie value for sticky selection
    pub tracking_id: &'a str,
    /// Whether the request fell in the public partition
    pub is_public: bool,
}

/// A successful upstream attempt, ready to stream back.
pub struct ForwardedResponse {
    /// The upstream response (status, headers, body stream)
    pub response: reqwest::Response,
    /// The target that served it
    pub target: Target,
    /// Attempts spent (1 = first try)
    pub attempts: u32,
    /// Time the winning attempt spent waiting on the upstream, in ms
    pub upstream_time_ms: u64,
    /// When the winning attempt was dispatched. The call-and-stream budget
    /// is measured from here, not from inbound-request arrival, so earlier
    /// failed attempts never erode the winning attempt's stream window.
    pub started: Instant,
}

/// Run the attempt loop for one admitted request.
pub async fn forward(
    env: &GatewayEnv,
    service: &CompiledService,
    admission: &Admission,
    mut req: ForwardRequest<'_>,
) -> GatewayResult<ForwardedResponse> {
    let descriptor = &service.descriptor;
    let cfg = &descriptor.client_config;
    let deadline = Instant::now() + Duration::from_millis(cfg.global_timeout);

    let eligible = eligible_targets(&descriptor.targets, &env.position);
    if eligible.is_empty() {
        return Err(GatewayError::Internal {
            message: format!("service {} has no targets", descriptor.id),
        });
    }

    // a consumed body cannot be replayed against another target
    let max_attempts = if req.body.is_some() { 1 } else { cfg.retries.max(1) };

    let selection_keys =
        SelectionKeys { tracking_id: req.tracking_id, client_ip: req.inbound.client_ip };
    let mut used: HashSet<String> = HashSet::new();
    let mut last_error = GatewayError::UpstreamConnect { message: "no attempt made".to_string() };

    for attempt in 1..=max_attempts {
        if Instant::now() >= deadline {
            last_error =
                GatewayError::UpstreamTimeout { message: "global timeout exhausted".to_string() };
            break;
        }

        let remaining: Vec<Target> =
            eligible.iter().filter(|t| !used.contains(&t.key())).cloned().collect();
        let Some(target) = env.balancing.select(
            &descriptor.targets_load_balancing,
            &descriptor.id,
            &remaining,
            &selection_keys,
        ) else {
            break;
        };
        used.insert(target.key());

        match try_target(env, service, admission, &mut req, &target, deadline).await {
            Ok((response, upstream_time_ms, started)) => {
                return Ok(ForwardedResponse {
                    response,
                    target,
                    attempts: attempt,
                    upstream_time_ms,
                    started,
                });
            }
            Err(err) => {
                env.events.publish(GatewayEvent::UpstreamFailure {
                    service: descriptor.id.clone(),
                    target: target.key(),
                    error: err.kind().to_string(),
                    at: Utc::now(),
                });
                if !err.is_retryable() {
                    return Err(err);
                }
                tracing::debug!(
                    "service {}: attempt {}/{} against {} failed: {}",
                    descriptor.id,
                    attempt,
                    max_attempts,
                    target.key(),
                    err
                );
                last_error = err;
            }
        }
    }

    Err(last_error)
}

/// One attempt against one target.
async fn try_target(
    env: &GatewayEnv,
    service: &CompiledService,
    admission: &Admission,
    req: &mut ForwardRequest<'_>,
    target: &Target,
    deadline: Instant,
) -> GatewayResult<(reqwest::Response, u64, Instant)> {
    let descriptor = &service.descriptor;
    let cfg = &descriptor.client_config;

    let mut exchange = if descriptor.enforce_secure_communication && !req.is_public {
        let caller = CallerIdentity {
            apikey: admission.apikey.as_ref(),
            user: admission.user.as_ref(),
        };
        Some(seccom::issue_tokens(descriptor, &caller, Utc::now().timestamp())?)
    } else {
        None
    };

    let url = headers::build_target_url(target, req.remaining_path, req.raw_query);
    let header_map =
        headers::upstream_headers(descriptor, target, &req.inbound, admission, exchange.as_ref());

    let client = env.clients.client_for(target);
    let mut builder = client.request(req.method.clone(), &url).headers(header_map);
    if let Some(body) = req.body.take() {
        builder = builder.body(body);
    }

    if let Some(ref mut ex) = exchange {
        ex.advance(ExchangePhase::Sent);
    }

    let call_budget =
        Duration::from_millis(cfg.call_timeout).min(deadline.saturating_duration_since(Instant::now()));
    let started = Instant::now();

    let response = match tokio::time::timeout(call_budget, builder.send()).await {
        Err(_) => {
            if let Some(ref mut ex) = exchange {
                ex.advance(ExchangePhase::Timeout);
            }
            return Err(GatewayError::UpstreamTimeout {
                message: format!("no status line within {}ms", cfg.call_timeout),
            });
        }
        Ok(Err(e)) if e.is_timeout() => {
            return Err(GatewayError::UpstreamTimeout { message: e.to_string() })
        }
        Ok(Err(e)) if e.is_connect() => {
            return Err(GatewayError::UpstreamConnect { message: e.to_string() })
        }
        Ok(Err(e)) => return Err(GatewayError::UpstreamConnect { message: e.to_string() }),
        Ok(Ok(response)) => response,
    };

    let upstream_ms = started.elapsed().as_millis() as u64;
    env.balancing.record_response_time(&descriptor.id, &target.key(), upstream_ms as f64);

    if let Some(ref mut ex) = exchange {
        let echo = response
            .headers()
            .get(state_response_header_name(descriptor))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seccom::validate_state_response(
            descriptor,
            ex,
            echo.as_deref(),
            &env.replay,
            Utc::now().timestamp(),
        )?;
        ex.advance(ExchangePhase::Reported);
    }

    Ok((response, upstream_ms, started))
}

struct BodyStreamState {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    idle_timeout: Duration,
    stream_deadline: Instant,
    scopes: Vec<Arc<LiveCounters>>,
    service_id: String,
    _guard: InFlightGuard,
}

/// Wrap the upstream body with the idle and call-and-stream deadlines, byte
/// accounting and the in-flight guard.
///
/// When a deadline expires mid-body the stream simply ends: the status line
/// was already relayed, so the client observes a truncated body while the
/// call stays reported with its upstream status.
pub fn guarded_body_stream(
    response: reqwest::Response,
    idle_timeout: Duration,
    stream_deadline: Instant,
    scopes: Vec<Arc<LiveCounters>>,
    service_id: String,
    guard: InFlightGuard,
) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send {
    let state = BodyStreamState {
        inner: Box::pin(response.bytes_stream()),
        idle_timeout,
        stream_deadline,
        scopes,
        service_id,
        _guard: guard,
    };
    futures::stream::unfold(state, |mut state| async move {
        let now = Instant::now();
        if now >= state.stream_deadline {
            tracing::warn!(
                "service {}: call-and-stream timeout, truncating response body",
                state.service_id
            );
            return None;
        }
        let budget = state.idle_timeout.min(state.stream_deadline - now);
        match tokio::time::timeout(budget, state.inner.next()).await {
            Err(_) => {
                tracing::warn!(
                    "service {}: response body stalled, truncating",
                    state.service_id
                );
                None
            }
            Ok(None) => None,
            Ok(Some(Ok(chunk))) => {
                for scope in &state.scopes {
                    scope.add_data_out(chunk.len() as u64);
                }
                Some((Ok(chunk), state))
            }
            Ok(Some(Err(e))) => Some((Err(e), state)),
        }
    })
}
