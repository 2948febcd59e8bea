//! Per-Connection Request Pipeline (§4.3): the read/dispatch/write/close
//! loop run once per accepted connection, and recursively once more per
//! MITM'd `CONNECT` tunnel (§4.4).

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use http::{HeaderValue, Method, Request, StatusCode, Uri};

use crate::{
    config::Proxy,
    connect,
    context::Context,
    error::{ProxyError, is_closable, is_other_closable},
    modifier::{Disposition, warn_header_value},
    roundtrip,
    session::Session,
    shutdown::ShutdownGuard,
    stream::{BoxedStream, force_close_requested},
    wire::{self, RecvBody, SendBody},
};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Runs the request loop over `stream` until the connection closes, the
/// proxy is shutting down, or a `CONNECT` tunnel is established (in which
/// case this function recurses internally and returns only once the
/// recursive pipeline does, per §4.4's "replaces, does not nest"
/// invariant).
pub(crate) async fn run(proxy: &Proxy, guard: &ShutdownGuard, session: Session, mut stream: BoxedStream) {
    let mut buf = BytesMut::new();

    loop {
        match run_one(proxy, guard, &session, &mut stream, &mut buf).await {
            Ok(true) => continue,
            Ok(false) => return,
            Err(err) => {
                tracing::debug!(session = session.id(), error = %err, "connection closing");
                return;
            }
        }
    }
}

/// Returns `Ok(true)` to keep looping on this connection, `Ok(false)` or an
/// error to close it. A `CONNECT` that establishes a tunnel always returns
/// `Ok(false)` (or propagates the tunnel's own error): by then
/// `connect::handle_connect` has already taken over `stream`.
async fn run_one(
    proxy: &Proxy,
    guard: &ShutdownGuard,
    session: &Session,
    stream: &mut BoxedStream,
    buf: &mut BytesMut,
) -> Result<bool, ProxyError> {
    let read_fut = wire::read_request(stream, buf);
    let mut cancelled = std::pin::pin!(guard.cancelled());
    let mut force_close = std::pin::pin!(force_close_requested(proxy.traffic_shaper.as_ref()));

    let maybe_req = tokio::select! {
        biased;
        _ = cancelled.as_mut() => return Ok(false),
        _ = force_close.as_mut() => return Err(ProxyError::Closed),
        result = tokio::time::timeout(proxy.timeout, read_fut) => {
            result.map_err(|_| ProxyError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))?
        }
    };

    let mut req = match maybe_req {
        Ok(Some(req)) => req,
        Ok(None) => return Ok(false),
        Err(err) if is_closable(&err) => return Err(ProxyError::Io(err)),
        Err(err) => {
            tracing::debug!(session = session.id(), error = %err, "non-closable read error, closing");
            return Ok(false);
        }
    };

    let scheme = if session.is_secure() { "https" } else { "http" };
    *req.uri_mut() = rewrite_scheme(req.uri(), scheme);
    copy_host_into_uri(&mut req);

    if let Some(auth) = &proxy.proxy_auth {
        if !auth.is_authorized(req.headers()) {
            let res = proxy_auth_challenge();
            write_response_classified(stream, &res, session).await?;
            return Ok(true);
        }
    }

    if req.method() == Method::CONNECT {
        let owned_stream = std::mem::replace(stream, Box::new(tokio::io::empty()));
        let leftover = std::mem::take(buf);
        return match connect::handle_connect(proxy, guard, session, owned_stream, leftover, req).await {
            Ok(()) => Ok(false),
            Err(err) => Err(err),
        };
    }

    strip_hop_by_hop(req.headers_mut());
    req.headers_mut().append(http::header::VIA, via_header_value());

    let stream_cell = Arc::new(Mutex::new(None));
    let mut ctx = Context::new(session.clone(), stream_cell);
    if let Some(info) = session.tls_info() {
        req.extensions_mut().insert(Arc::clone(&info));
        ctx.extensions.insert(info);
    }

    if let Disposition::Hijacked = run_request_modifier(proxy, &mut ctx, &mut req).await? {
        return Ok(false);
    }

    let mut res = match roundtrip::round_trip(&ctx, &req, proxy.dialer.as_ref(), proxy.downstream_proxy.as_ref()).await {
        Ok(res) => res,
        Err(err) => roundtrip::synthetic(StatusCode::BAD_GATEWAY, Some(warn_header_value(&err))),
    };

    if let Disposition::Hijacked = run_response_modifier(proxy, &mut ctx, &mut res).await? {
        return Ok(false);
    }

    strip_hop_by_hop(res.headers_mut());
    res.headers_mut().append(http::header::VIA, via_header_value());

    let closing = is_connection_close(req.headers()) || is_connection_close(res.headers()) || guard.is_cancelled();
    if closing {
        res.headers_mut()
            .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    }

    write_response_classified(stream, &res, session).await?;

    Ok(!closing)
}

/// Writes `res`, classifying a write/flush failure per §4.7 instead of
/// closing unconditionally: a closable error propagates and ends the
/// connection, anything else is logged and the loop keeps going.
async fn write_response_classified(
    stream: &mut BoxedStream,
    res: &http::Response<SendBody>,
    session: &Session,
) -> Result<(), ProxyError> {
    if let Err(err) = wire::write_response(stream, res).await {
        if is_other_closable(&err) {
            return Err(ProxyError::Io(err));
        }
        tracing::debug!(session = session.id(), error = %err, "non-closable write error, continuing");
    }
    Ok(())
}

async fn run_request_modifier(
    proxy: &Proxy,
    ctx: &mut Context,
    req: &mut Request<RecvBody>,
) -> Result<Disposition, ProxyError> {
    match proxy.request_modifier.modify_request(ctx, req).await {
        Ok(d) => Ok(d),
        Err(err) => {
            req.headers_mut()
                .insert(http::header::WARNING, warn_header_value(&err));
            tracing::warn!(error = %err, "request modifier error");
            Ok(Disposition::Continue)
        }
    }
}

async fn run_response_modifier(
    proxy: &Proxy,
    ctx: &mut Context,
    res: &mut http::Response<SendBody>,
) -> Result<Disposition, ProxyError> {
    match proxy.response_modifier.modify_response(ctx, res).await {
        Ok(d) => Ok(d),
        Err(err) => {
            res.headers_mut()
                .insert(http::header::WARNING, warn_header_value(&err));
            tracing::warn!(error = %err, "response modifier error");
            Ok(Disposition::Continue)
        }
    }
}

/// Forces the scheme to `scheme` (§4.3 step 4: "http unless the session is
/// secure, then https" — an unconditional rewrite, not a default-if-absent).
#[allow(clippy::expect_used)]
fn rewrite_scheme(uri: &Uri, scheme: &str) -> Uri {
    let mut parts = uri.clone().into_parts();
    if parts.authority.is_none() {
        return uri.clone();
    }
    parts.scheme = Some(scheme.parse().expect("static scheme is valid"));
    Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
}

fn copy_host_into_uri(req: &mut Request<RecvBody>) {
    if req.uri().authority().is_some() {
        return;
    }
    let Some(host) = req.headers().get(http::header::HOST).cloned() else {
        return;
    };
    let Ok(host_str) = host.to_str() else { return };
    let scheme = req.uri().scheme_str().unwrap_or("http").to_owned();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    if let Ok(rebuilt) = format!("{scheme}://{host_str}{path}").parse::<Uri>() {
        *req.uri_mut() = rebuilt;
    }
}

fn is_connection_close(headers: &http::HeaderMap) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .any(|v| v.as_bytes().eq_ignore_ascii_case(b"close"))
}

/// §10.5 hop-by-hop stripping: the static list plus anything the
/// `Connection` header itself names.
fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    let mut named: Vec<String> = Vec::new();
    for v in headers.get_all(http::header::CONNECTION) {
        if let Ok(s) = v.to_str() {
            named.extend(s.split(',').map(|part| part.trim().to_ascii_lowercase()));
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in named {
        if name == "close" || name.is_empty() {
            continue;
        }
        if let Ok(header_name) = http::HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(header_name);
        }
    }
}

fn via_header_value() -> HeaderValue {
    HeaderValue::from_static("1.1 waylay")
}

#[allow(clippy::expect_used)]
fn proxy_auth_challenge() -> http::Response<SendBody> {
    http::Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .header(http::header::PROXY_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"waylay\""))
        .body(SendBody::empty())
        .expect("static status and header always build")
}
