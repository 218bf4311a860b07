use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use axum::Json;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::routing::{get, post};
use futures_util::StreamExt;
use llm_relay_core::classify::{UpstreamVerdict, classify_upstream_failure};
use llm_relay_core::queue::HeartbeatSettings;
use llm_relay_core::{
    Backend, Dispatch, EnqueueRequest, Identity, Key, KeyPool, Lane, PoolError, QueueTicket,
    RequestQueue, Service,
};
use reqwest::Client;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, info, instrument, warn};

mod auth;
mod failure;
mod retry;
mod stream;
mod upstream;

use self::auth::{Gatekeeper, StaticUserStore, UserInfo, UserStore};
use self::failure::{ProxyFailure, queue_rejection};
use self::retry::{apply_key_action, no_key_advice};
use self::stream::{
    SseSink, WaitOutcome, open_queued_stream, sse_channel, sse_response, wait_with_heartbeat,
};
use self::upstream::{
    ApproxTokenizer, InboundRequest, KeySigner, PassthroughTransformer, RequestTransformer,
    Tokenizer,
};
use crate::config::RelayConfig;

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;
const STICKY_HEADER: &str = "x-risu-tk";

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn hop_by_hop_connection_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all("connection").iter() {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            out.push(token.to_ascii_lowercase());
        }
    }
    out
}

/// Client headers that may be forwarded to a vendor. Client addressing never leaves the relay.
fn filter_request_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if matches!(
            name_lower.as_str(),
            "host" | "content-length" | "x-forwarded-for" | "x-real-ip" | STICKY_HEADER
        ) || is_hop_by_hop_header(&name_lower)
        {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        // The body is re-framed by the relay, so upstream length/encoding no longer apply.
        if is_hop_by_hop_header(&name_lower)
            || name_lower == "content-length"
            || name_lower == "content-encoding"
        {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Shared state behind every route: the key pool, its queue, and the collaborator seams.
#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    config: Arc<RelayConfig>,
    pool: Arc<KeyPool>,
    queue: RequestQueue,
    heartbeat: HeartbeatSettings,
    gatekeeper: Arc<Gatekeeper>,
    transformer: Arc<dyn RequestTransformer>,
    signer: Option<Arc<dyn KeySigner>>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl ProxyService {
    pub fn new(client: Client, config: Arc<RelayConfig>, pool: Arc<KeyPool>) -> Result<Self> {
        let queue = RequestQueue::new(pool.clone(), config.queue_settings()?);
        let heartbeat = config.heartbeat_settings()?;
        let users: Arc<dyn UserStore> = Arc::new(StaticUserStore::from_config(&config.users));
        let gatekeeper = Arc::new(Gatekeeper::new(
            config.gatekeeper,
            config.proxy_key.clone(),
            users,
        ));
        Ok(Self {
            client,
            config,
            pool,
            queue,
            heartbeat,
            gatekeeper,
            transformer: Arc::new(PassthroughTransformer),
            signer: None,
            tokenizer: Arc::new(ApproxTokenizer),
        })
    }

    pub fn with_signer(mut self, signer: Arc<dyn KeySigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn RequestTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `x-forwarded-for` is only trusted from a loopback peer (a local reverse proxy).
fn client_ip(parts: &Parts) -> String {
    let forwarded = || {
        header_str(&parts.headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    match peer {
        Some(ip) if ip.is_loopback() => forwarded().unwrap_or_else(|| ip.to_string()),
        Some(ip) => ip.to_string(),
        None => forwarded().unwrap_or_else(|| "unknown".to_string()),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Target {
    /// Set when the client used a `/proxy/{vendor}` prefix.
    vendor: Option<Service>,
    /// Vendor-relative path.
    path: String,
    model: String,
    streaming: bool,
}

/// Google puts the model and the streaming flag in the path:
/// `/v1beta/models/gemini-1.5-pro:streamGenerateContent`.
fn google_model_from_path(path: &str) -> Option<(String, bool)> {
    let (_, rest) = path.split_once("/models/")?;
    let (model, action) = rest.split_once(':')?;
    if model.is_empty() {
        return None;
    }
    Some((model.to_string(), action.starts_with("streamGenerateContent")))
}

fn parse_target(path: &str, body: &[u8]) -> Result<Target, ProxyFailure> {
    let (vendor, path) = match path.strip_prefix("/proxy/") {
        Some(rest) => {
            let (name, tail) = rest.split_once('/').unwrap_or((rest, ""));
            let vendor = Service::from_str(name).map_err(|e| {
                ProxyFailure::proxy(StatusCode::NOT_FOUND, "proxy_unknown_vendor", e)
            })?;
            (Some(vendor), format!("/{tail}"))
        }
        None => (None, path.to_string()),
    };

    if let Some((model, streaming)) = google_model_from_path(&path) {
        return Ok(Target {
            vendor,
            path,
            model,
            streaming,
        });
    }

    let json: Option<Value> = serde_json::from_slice(body).ok();
    let model = json
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ProxyFailure::proxy(
                StatusCode::BAD_REQUEST,
                "proxy_bad_request",
                "Request body must be JSON with a `model` field.",
            )
        })?
        .to_string();
    let streaming = json
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(Target {
        vendor,
        path,
        model,
        streaming,
    })
}

/// One client request as it moves through queue waits and upstream attempts.
struct RequestContext {
    proxy: ProxyService,
    inbound: InboundRequest,
    lane: Lane,
    service: Service,
    identity: Identity,
    client_ip: String,
    user: Option<UserInfo>,
}

enum DriveError {
    /// The client disconnected or stopped reading; nothing more can be sent.
    ClientGone,
    Failed(ProxyFailure),
}

impl From<ProxyFailure> for DriveError {
    fn from(failure: ProxyFailure) -> Self {
        DriveError::Failed(failure)
    }
}

enum AttemptError {
    /// The key was penalised and the request should go back in the queue.
    Retry,
    Fatal(ProxyFailure),
}

struct Upstream {
    response: reqwest::Response,
    key: Key,
}

impl RequestContext {
    fn enqueue_request(&self, retry_count: u32, start_time: Option<Instant>) -> EnqueueRequest {
        // Retries re-read the user so prompts spent by their other requests count.
        let budget = self.user.as_ref().and_then(|user| match retry_count {
            0 => user.budget(),
            _ => self
                .proxy
                .gatekeeper
                .users()
                .lookup(&user.token)
                .unwrap_or_else(|| user.clone())
                .budget(),
        });
        EnqueueRequest {
            identity: self.identity.clone(),
            lane: self.lane,
            model: self.inbound.model.clone(),
            streaming: self.inbound.streaming,
            retry_count,
            start_time,
            client_ip: self.client_ip.clone(),
            budget,
        }
    }

    /// Wait for dispatch, attempt, and re-enqueue until the request succeeds or fails for good.
    async fn drive(
        &self,
        mut ticket: QueueTicket,
        sink: Option<&SseSink>,
    ) -> Result<Upstream, DriveError> {
        let queue = &self.proxy.queue;
        loop {
            let dispatch = match sink {
                Some(sink) => {
                    match wait_with_heartbeat(&mut ticket, sink, &self.proxy.heartbeat, queue).await
                    {
                        WaitOutcome::Dispatched(dispatch) => dispatch,
                        WaitOutcome::ClientGone => {
                            debug!("client left while queued");
                            return Err(DriveError::ClientGone);
                        }
                        WaitOutcome::Stalled(reason) => {
                            warn!(identity = %self.identity, ?reason, "destroying stalled queued connection");
                            sink.abort(io::Error::other("client is not reading heartbeats"));
                            return Err(DriveError::ClientGone);
                        }
                    }
                }
                None => ticket.wait().await,
            };

            let (retry_count, start_time, queue_out_time) = match dispatch {
                Dispatch::Resume {
                    retry_count,
                    start_time,
                    queue_out_time,
                } => (retry_count, start_time, queue_out_time),
                Dispatch::Evicted { message } => {
                    return Err(ProxyFailure::proxy(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "proxy_queue_timeout",
                        message,
                    )
                    .into());
                }
            };

            match self.attempt(retry_count).await {
                Ok(upstream) => {
                    queue.record_wait(self.lane, start_time, queue_out_time);
                    return Ok(upstream);
                }
                Err(AttemptError::Fatal(failure)) => return Err(failure.into()),
                Err(AttemptError::Retry) => {
                    ticket = queue
                        .enqueue(self.enqueue_request(retry_count + 1, Some(start_time)))
                        .map_err(ProxyFailure::from)?;
                }
            }
        }
    }

    async fn attempt(&self, retry_count: u32) -> Result<Upstream, AttemptError> {
        let proxy = &self.proxy;
        let model = self.inbound.model.as_str();
        let fatal = |status: StatusCode, kind: &str, message: String| {
            AttemptError::Fatal(ProxyFailure::proxy(status, kind, message))
        };

        let key = match proxy.pool.get(model, true) {
            Ok(key) => key,
            Err(err @ PoolError::NoKeysAvailable { .. }) => {
                let advice = no_key_advice(proxy.pool.available(Some(self.service)));
                warn!(lane = %self.lane, retry_count, "no eligible key for request");
                return Err(fatal(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "proxy_no_keys_available",
                    format!("{err}. {advice}"),
                ));
            }
            Err(err) => {
                return Err(fatal(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "proxy_error",
                    err.to_string(),
                ));
            }
        };

        let base_url = proxy.config.base_url(self.service);
        let mut outbound = proxy
            .transformer
            .transform(&self.inbound, self.service, &key, &base_url)
            .map_err(|e| {
                fatal(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "proxy_transform_error",
                    format!("{e:#}"),
                )
            })?;
        if matches!(key.backend(), Backend::Aws { .. }) {
            let Some(signer) = proxy.signer.as_ref() else {
                return Err(fatal(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "proxy_signing_unavailable",
                    "This key needs request signing, but the relay has no signer configured."
                        .to_string(),
                ));
            };
            signer.sign(&mut outbound, &key).map_err(|e| {
                fatal(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "proxy_signing_error",
                    format!("{e:#}"),
                )
            })?;
        }

        debug!(key = key.id(), url = %outbound.url, retry_count, "sending upstream request");
        let resp = proxy
            .client
            .request(outbound.method, outbound.url)
            .headers(outbound.headers)
            .body(outbound.body)
            .send()
            .await
            .map_err(|e| {
                warn!(key = key.id(), service = %self.service, "upstream transport error: {e}");
                fatal(
                    StatusCode::BAD_GATEWAY,
                    "proxy_upstream_unreachable",
                    format!("Could not reach the {} API: {e}", self.service),
                )
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(Upstream {
                response: resp,
                key,
            });
        }

        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| {
            fatal(
                StatusCode::BAD_GATEWAY,
                "proxy_upstream_read_error",
                format!("Failed to read the {} error response: {e}", self.service),
            )
        })?;
        match classify_upstream_failure(self.service, model, status.as_u16(), &headers, &body) {
            UpstreamVerdict::Retry { action, reason } => {
                info!(
                    key = key.id(),
                    service = %self.service,
                    status = status.as_u16(),
                    reason,
                    retry_count,
                    "upstream refused the key; re-enqueueing"
                );
                apply_key_action(&proxy.pool, &key, action);
                Err(AttemptError::Retry)
            }
            UpstreamVerdict::Fatal { class, message } => {
                warn!(
                    key = key.id(),
                    service = %self.service,
                    status = status.as_u16(),
                    class = class.as_deref().unwrap_or("-"),
                    "upstream error forwarded to client"
                );
                Err(AttemptError::Fatal(ProxyFailure::upstream(
                    status,
                    class,
                    message,
                    self.service,
                )))
            }
        }
    }

    fn record_success(&self, key: &Key, headers: &HeaderMap) {
        let pool = &self.proxy.pool;
        if let Err(err) = pool.increment_prompt(key) {
            debug!(key = key.id(), "prompt count not recorded: {err}");
        }
        if let Err(err) = pool.update_rate_limits(key, headers) {
            debug!(key = key.id(), "rate limit headers not applied: {err}");
        }
        if let Some(user) = &self.user {
            self.proxy.gatekeeper.users().increment_prompt(&user.token);
        }
    }
}

async fn run_buffered(ctx: RequestContext, ticket: QueueTicket) -> Response<Body> {
    let Upstream { response, key } = match ctx.drive(ticket, None).await {
        Ok(upstream) => upstream,
        Err(DriveError::Failed(failure)) => return failure.into_response(),
        // Only heartbeat waits observe the client leaving; axum drops this future instead.
        Err(DriveError::ClientGone) => return Response::new(Body::empty()),
    };
    ctx.record_success(&key, response.headers());
    let status = response.status();
    let headers = filter_response_headers(response.headers());
    match response.bytes().await {
        Ok(bytes) => {
            let mut resp = Response::new(Body::from(bytes));
            *resp.status_mut() = status;
            *resp.headers_mut() = headers;
            resp
        }
        Err(err) => ProxyFailure::proxy(
            StatusCode::BAD_GATEWAY,
            "proxy_upstream_read_error",
            format!("Failed to read the {} response: {err}", ctx.service),
        )
        .into_response(),
    }
}

async fn run_streaming(ctx: RequestContext, ticket: QueueTicket, sink: SseSink) {
    let model = ctx.inbound.model.clone();
    let Upstream { response, key } = match ctx.drive(ticket, Some(&sink)).await {
        Ok(upstream) => upstream,
        Err(DriveError::ClientGone) => return,
        Err(DriveError::Failed(failure)) => {
            let _ = sink.write(failure.sse_frames(ctx.service, &model)).await;
            return;
        }
    };
    ctx.record_success(&key, response.headers());

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                if !sink.write(bytes).await {
                    debug!(key = key.id(), "client disconnected mid-stream");
                    return;
                }
            }
            Err(err) => {
                warn!(key = key.id(), service = %ctx.service, "upstream stream failed: {err}");
                let failure = ProxyFailure::proxy(
                    StatusCode::BAD_GATEWAY,
                    "proxy_stream_error",
                    format!("The upstream stream ended unexpectedly: {err}"),
                );
                let _ = sink.write(failure.sse_frames(ctx.service, &model)).await;
                return;
            }
        }
    }
}

#[instrument(
    skip_all,
    fields(
        request_id = %uuid::Uuid::new_v4(),
        model = tracing::field::Empty,
        lane = tracing::field::Empty,
        identity = tracing::field::Empty,
    )
)]
pub async fn handle_completion(proxy: ProxyService, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let client_ip = client_ip(&parts);
    let body = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(b) => b,
        Err(err) => {
            return ProxyFailure::proxy(
                StatusCode::BAD_REQUEST,
                "proxy_bad_request",
                format!("Failed to read request body: {err}"),
            )
            .into_response();
        }
    };

    let user = match proxy.gatekeeper.check(&parts.headers, parts.uri.query()) {
        Ok(user) => user,
        Err(failure) => return failure.into_response(),
    };
    let target = match parse_target(parts.uri.path(), &body) {
        Ok(t) => t,
        Err(failure) => return failure.into_response(),
    };
    let lane = match Lane::for_model(&target.model) {
        Ok(lane) => lane,
        Err(err) => {
            return ProxyFailure::proxy(
                StatusCode::BAD_REQUEST,
                "proxy_unknown_model",
                err.to_string(),
            )
            .into_response();
        }
    };
    let service = lane.service();
    if let Some(vendor) = target.vendor
        && vendor != service
    {
        return ProxyFailure::proxy(
            StatusCode::BAD_REQUEST,
            "proxy_vendor_mismatch",
            format!(
                "Model '{}' is served by {service}, not by the {vendor} endpoint.",
                target.model
            ),
        )
        .into_response();
    }
    if let Some(&limit) = proxy.config.max_context_tokens.get(&service) {
        let tokens = proxy.tokenizer.count_tokens(service, &body);
        if tokens > limit {
            return ProxyFailure::proxy(
                StatusCode::BAD_REQUEST,
                "proxy_context_too_large",
                format!("Prompt is {tokens} tokens; this proxy allows at most {limit} for {service}."),
            )
            .into_response();
        }
    }

    let identity = Identity::resolve(
        user.as_ref().map(|u| u.token.as_str()),
        header_str(&parts.headers, STICKY_HEADER),
        &client_ip,
        &proxy.config.shared_ips,
    );
    let span = Span::current();
    span.record("model", target.model.as_str());
    span.record("lane", lane.as_str());
    span.record("identity", tracing::field::display(&identity));

    let ctx = RequestContext {
        proxy: proxy.clone(),
        inbound: InboundRequest {
            method: parts.method,
            path: target.path,
            query: parts.uri.query().map(str::to_string),
            headers: filter_request_headers(&parts.headers),
            body,
            model: target.model,
            streaming: target.streaming,
        },
        lane,
        service,
        identity,
        client_ip,
        user,
    };

    let ticket = match proxy.queue.enqueue(ctx.enqueue_request(0, None)) {
        Ok(ticket) => ticket,
        Err(err) => {
            info!("request rejected at admission: {err}");
            return queue_rejection(err);
        }
    };

    if !ctx.inbound.streaming {
        return run_buffered(ctx, ticket).await;
    }
    let (sink, body) = sse_channel();
    open_queued_stream(&sink, &proxy.heartbeat, &proxy.queue);
    tokio::spawn(run_streaming(ctx, ticket, sink).instrument(span));
    sse_response(body)
}

pub fn router(proxy: ProxyService) -> Router {
    async fn health() -> &'static str {
        "ok"
    }

    async fn status(proxy: ProxyService) -> Json<Value> {
        let pool = &proxy.pool;
        let queue = &proxy.queue;
        let lanes: serde_json::Map<String, Value> = Lane::ALL
            .into_iter()
            .filter(|lane| !pool.store(lane.service()).is_empty())
            .map(|lane| {
                let body = json!({
                    "queued": queue.queue_length(Some(lane)),
                    "estimated_wait_ms": queue.estimated_wait(lane).as_millis() as u64,
                    "wait": queue.wait_stats(lane),
                });
                (lane.as_str().to_string(), body)
            })
            .collect();
        let keys: serde_json::Map<String, Value> = Service::ALL
            .into_iter()
            .filter(|svc| !pool.store(*svc).is_empty())
            .map(|svc| {
                let body = json!({
                    "total": pool.store(svc).len(),
                    "available": pool.available(Some(svc)),
                });
                (svc.as_str().to_string(), body)
            })
            .collect();
        Json(json!({
            "queue": {
                "mode": queue.settings().mode,
                "length": queue.queue_length(None),
                "load": queue.load(),
            },
            "lanes": lanes,
            "keys": keys,
            "any_unchecked": pool.any_unchecked(),
        }))
    }

    let p0 = proxy.clone();
    let p1 = proxy;

    Router::new()
        .route("/health", get(health))
        .route("/status", get(move || status(p0.clone())))
        .route(
            "/{*path}",
            post(move |req| handle_completion(p1.clone(), req)),
        )
}
