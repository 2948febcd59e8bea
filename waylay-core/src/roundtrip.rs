//! Round-Trip Delegator (§4.6): either synthesizes a response locally
//! (`skip_round_trip`) or dials the origin (or a configured downstream
//! proxy) and speaks HTTP/1 to it. HTTP/2 upgrade to the origin is never
//! attempted — this engine only ever originates HTTP/1.1 upstream.

use std::{future::Future, pin::Pin, time::Duration};

use bytes::BytesMut;
use http::{Request, Response, StatusCode, Uri};
use tokio::io::{AsyncWrite, BufReader};

use crate::{
    context::Context,
    error::{BoxError, ErrorContext, ErrorExt},
    stream::BoxedStream,
    wire::{self, RecvBody, SendBody},
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EXPECT_CONTINUE_TIMEOUT: Duration = Duration::from_secs(1);
/// §5 "Dial uses a 30-second timeout with a 30-second keep-alive."
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_KEEPALIVE: Duration = Duration::from_secs(30);

/// Opens a connection to an origin host, or to a configured downstream
/// proxy, returning a stream ready for HTTP/1 traffic. TLS is established
/// here (not by the caller) so the 10s handshake bound of §4.6 is
/// enforced in exactly one place.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, authority: &'a str, tls: bool) -> BoxFuture<'a, Result<BoxedStream, BoxError>>;
}

/// Plain TCP dialer with no TLS support; the production CLI wires a
/// `rustls`-backed implementation instead when origin TLS is needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, authority: &'a str, tls: bool) -> BoxFuture<'a, Result<BoxedStream, BoxError>> {
        Box::pin(async move {
            if tls {
                return Err("plain TcpDialer cannot originate TLS; configure a TLS-capable dialer".into());
            }
            let stream = tokio::time::timeout(DIAL_TIMEOUT, tokio::net::TcpStream::connect(authority))
                .await
                .map_err(|_| "dial timed out")?
                .context("dial origin")?;
            stream.set_nodelay(true).ok();
            let socket = socket2::SockRef::from(&stream);
            if let Err(err) = socket.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(DIAL_KEEPALIVE)) {
                tracing::debug!(error = %err, "failed to enable TCP keepalive on dialed socket");
            }
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Performs one HTTP/1 request/response cycle against whatever `dialer`
/// connects to.
pub(crate) async fn round_trip(
    ctx: &Context,
    req: &Request<RecvBody>,
    dialer: &dyn Dialer,
    downstream_proxy: Option<&Uri>,
) -> Result<Response<SendBody>, BoxError> {
    if ctx.skip_round_trip {
        return Ok(synthetic(StatusCode::OK, None));
    }

    let authority = origin_authority(req.uri(), downstream_proxy)?;
    let tls = downstream_proxy.is_none() && req.uri().scheme_str() == Some("https");

    let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, dialer.dial(&authority, tls))
        .await
        .map_err(|_| "tls handshake timed out")?
        .context("dial upstream")?;

    speak_http1(stream, req).await
}

async fn speak_http1(
    mut stream: BoxedStream,
    req: &Request<RecvBody>,
) -> Result<Response<SendBody>, BoxError> {
    let out_req = rebuild_for_wire(req);
    let expects_continue = out_req
        .headers()
        .get(http::header::EXPECT)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
        .unwrap_or(false);

    if expects_continue {
        write_head_only(&mut stream, &out_req).await?;
    } else {
        wire::write_request(&mut stream, &out_req).await?;
    }

    let mut buf = BytesMut::new();
    let mut reader = BufReader::new(stream);

    if expects_continue {
        let interim = tokio::time::timeout(EXPECT_CONTINUE_TIMEOUT, wire::read_response(&mut reader, &mut buf, req.method()))
            .await;
        match interim {
            Ok(Ok(res)) if res.status() == StatusCode::CONTINUE => {
                use tokio::io::AsyncWriteExt;
                reader.get_mut().write_all(&out_req.body().0).await?;
                reader.get_mut().flush().await?;
            }
            Ok(Ok(res)) => return Ok(res.map(RecvBody::into_send)),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                use tokio::io::AsyncWriteExt;
                reader.get_mut().write_all(&out_req.body().0).await?;
                reader.get_mut().flush().await?;
            }
        }
    }

    let res = wire::read_response(&mut reader, &mut buf, req.method()).await?;
    Ok(res.map(RecvBody::into_send))
}

async fn write_head_only<W: AsyncWrite + Unpin>(writer: &mut W, req: &Request<SendBody>) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (name, value) in req.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(value.to_str().unwrap_or_default());
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

#[allow(clippy::expect_used)]
fn rebuild_for_wire(req: &Request<RecvBody>) -> Request<SendBody> {
    let mut builder = Request::builder().method(req.method()).uri(req.uri()).version(req.version());
    *builder.headers_mut().expect("builder has no error yet") = req.headers().clone();
    builder
        .body(SendBody(req.body().0.clone()))
        .expect("cloned parts are always a valid request")
}

fn origin_authority(uri: &Uri, downstream_proxy: Option<&Uri>) -> Result<String, BoxError> {
    if let Some(proxy) = downstream_proxy {
        return proxy
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| "downstream proxy URL has no authority".into());
    }
    let authority = uri.authority().ok_or("request URI has no authority")?;
    if authority.port().is_some() {
        return Ok(authority.to_string());
    }
    let port = if uri.scheme_str() == Some("https") { 443 } else { 80 };
    Ok(format!("{}:{port}", authority.host()))
}

/// A `200 OK` or `502 Bad Gateway` response not obtained from any origin
/// (§4.6, §6 "Synthesized responses"), optionally carrying a `Warning`.
#[allow(clippy::expect_used)]
pub(crate) fn synthetic(status: StatusCode, warning: Option<http::HeaderValue>) -> Response<SendBody> {
    let mut builder = Response::builder().status(status);
    if let Some(w) = warning {
        builder = builder.header(http::header::WARNING, w);
    }
    builder
        .body(SendBody::empty())
        .expect("status and optional header always build")
}
