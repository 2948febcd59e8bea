//! CONNECT Handler: the MITM path (§4.4) and the blind-tunnel path (§4.5).

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use http::{Method, Request, Response, StatusCode, Uri};
use tokio::io::AsyncWriteExt;

use crate::{
    config::Proxy,
    context::Context,
    error::{BoxError, ProxyError},
    modifier::{Disposition, warn_header_value},
    pipeline,
    roundtrip,
    session::Session,
    shutdown::ShutdownGuard,
    stream::{BoxedStream, PeekStream, force_close_requested, sniff_prefix},
    wire::{self, RecvBody, SendBody},
};

const TLS_HANDSHAKE_RECORD_TYPE: u8 = 0x16;

/// Dispatches a parsed `CONNECT` request to the MITM or blind-tunnel path
/// depending on whether the proxy was built with a [`crate::mitm::TlsHostConfig`].
/// `buf` carries whatever bytes the request-head parser already pulled off
/// the wire past the `CONNECT` request's terminating CRLF (normally empty);
/// per §4.4's invariant, recursion into the pipeline replaces the outer
/// connection-read loop, it never returns control to it.
pub(crate) async fn handle_connect(
    proxy: &Proxy,
    guard: &ShutdownGuard,
    session: &Session,
    stream: BoxedStream,
    buf: BytesMut,
    req: Request<RecvBody>,
) -> Result<(), ProxyError> {
    let stream_cell = Arc::new(Mutex::new(Some(stream)));
    let mut ctx = Context::new(session.clone(), stream_cell.clone());
    let mut req = req;
    if let Some(info) = session.tls_info() {
        req.extensions_mut().insert(Arc::clone(&info));
        ctx.extensions.insert(info);
    }

    if let Disposition::Hijacked = run_request_modifier(proxy, &mut ctx, &mut req).await? {
        return Ok(());
    }

    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .ok_or(ProxyError::Closed)?;

    match &proxy.mitm {
        Some(_) => mitm_path(proxy, guard, &mut ctx, stream_cell, buf, &target, req.uri()).await,
        None => blind_path(proxy, &mut ctx, stream_cell, &target).await,
    }
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
            tracing::warn!(error = %err, "request modifier error on CONNECT");
            Ok(Disposition::Continue)
        }
    }
}

async fn run_response_modifier(
    proxy: &Proxy,
    ctx: &mut Context,
    res: &mut Response<SendBody>,
) -> Result<Disposition, ProxyError> {
    match proxy.response_modifier.modify_response(ctx, res).await {
        Ok(d) => Ok(d),
        Err(err) => {
            res.headers_mut()
                .insert(http::header::WARNING, warn_header_value(&err));
            tracing::warn!(error = %err, "response modifier error on CONNECT");
            Ok(Disposition::Continue)
        }
    }
}

async fn mitm_path(
    proxy: &Proxy,
    guard: &ShutdownGuard,
    ctx: &mut Context,
    stream_cell: Arc<Mutex<Option<BoxedStream>>>,
    mut buf: BytesMut,
    target_authority: &str,
    target_uri: &Uri,
) -> Result<(), ProxyError> {
    let mut ok = roundtrip::synthetic(StatusCode::OK, None);
    if let Disposition::Hijacked = run_response_modifier(proxy, ctx, &mut ok).await? {
        return Ok(());
    }

    let mut stream = match take_stream(&stream_cell) {
        Some(s) => s,
        None => return Ok(()),
    };
    wire::write_response(&mut stream, &ok)
        .await
        .map_err(ProxyError::Io)?;

    let peek = sniff_prefix(&mut stream, &mut buf).await.map_err(ProxyError::Io)?;

    let host = target_authority
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(target_authority)
        .to_owned();

    if peek.first().copied() == Some(TLS_HANDSHAKE_RECORD_TYPE) {
        let tls_config = mitm_server_config(proxy, &host).await?;
        let peeked = PeekStream::new(peek, stream);
        let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
        let tls_stream = match acceptor.accept(peeked).await {
            Ok(s) => s,
            Err(err) => {
                let err: BoxError = err.into();
                if let Some(mitm) = &proxy.mitm {
                    mitm.on_handshake_error.on_handshake_error(&host, &err);
                }
                return Err(ProxyError::Handshake(err));
            }
        };

        let alpn = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        if alpn.as_deref() == Some(b"h2") {
            if let Some(mitm) = &proxy.mitm {
                if let Some(h2) = &mitm.h2_proxy {
                    h2.serve(guard, Box::new(tls_stream), target_uri)
                        .await
                        .map_err(ProxyError::RoundTrip)?;
                    return Ok(());
                }
            }
            return Err(ProxyError::Closed);
        }

        ctx.session.mark_secure();
        ctx.session.set_tls_info(crate::mitm::TlsInfo {
            sni: host.clone(),
            alpn_protocol: alpn.clone(),
        });
        pipeline::run(proxy, guard, ctx.session.clone(), Box::new(tls_stream)).await;
        Ok(())
    } else {
        let peeked: BoxedStream = Box::new(PeekStream::new(peek, stream));
        pipeline::run(proxy, guard, ctx.session.clone(), peeked).await;
        Ok(())
    }
}

async fn mitm_server_config(
    proxy: &Proxy,
    host: &str,
) -> Result<Arc<rustls::ServerConfig>, ProxyError> {
    let mitm = proxy.mitm.as_ref().ok_or(ProxyError::Closed)?;
    mitm.tls_host_config
        .server_config_for_host(host)
        .await
        .map_err(ProxyError::Handshake)
}

fn take_stream(cell: &Arc<Mutex<Option<BoxedStream>>>) -> Option<BoxedStream> {
    cell.lock().unwrap_or_else(|e| e.into_inner()).take()
}

async fn blind_path(
    proxy: &Proxy,
    ctx: &mut Context,
    stream_cell: Arc<Mutex<Option<BoxedStream>>>,
    target: &str,
) -> Result<(), ProxyError> {
    let dial_result = dial_for_tunnel(proxy, target).await;

    let mut response = match &dial_result {
        Ok(_) => roundtrip::synthetic(StatusCode::OK, None),
        Err(err) => roundtrip::synthetic(StatusCode::BAD_GATEWAY, Some(warn_header_value(err))),
    };

    if let Disposition::Hijacked = run_response_modifier(proxy, ctx, &mut response).await? {
        return Ok(());
    }

    let mut client_stream = match take_stream(&stream_cell) {
        Some(s) => s,
        None => return Ok(()),
    };

    wire::write_response(&mut client_stream, &response)
        .await
        .map_err(ProxyError::Io)?;

    let mut origin_stream = match dial_result {
        Ok(s) => s,
        Err(_) => return Ok(()),
    };

    copy_bidirectional(proxy, &mut client_stream, &mut origin_stream).await;
    Ok(())
}

async fn dial_for_tunnel(proxy: &Proxy, target: &str) -> Result<BoxedStream, BoxError> {
    if let Some(downstream) = &proxy.downstream_proxy {
        let authority = downstream
            .authority()
            .map(|a| a.to_string())
            .ok_or("downstream proxy URL has no authority")?;
        let mut stream = proxy.dialer.dial(&authority, false).await?;
        let connect_line = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        stream.write_all(connect_line.as_bytes()).await?;
        stream.flush().await?;

        let mut buf = BytesMut::new();
        let res = wire::read_response(&mut stream, &mut buf, &Method::CONNECT).await?;
        if !res.status().is_success() {
            return Err(format!("downstream proxy refused CONNECT: {}", res.status()).into());
        }
        Ok(Box::new(PeekStream::new(buf.to_vec(), stream)))
    } else {
        proxy.dialer.dial(target, false).await
    }
}

async fn copy_bidirectional(proxy: &Proxy, client: &mut BoxedStream, origin: &mut BoxedStream) {
    let (mut client_r, mut client_w) = tokio::io::split(&mut *client);
    let (mut origin_r, mut origin_w) = tokio::io::split(&mut *origin);

    let to_origin = async {
        let result = tokio::io::copy(&mut client_r, &mut origin_w).await;
        let _ = origin_w.shutdown().await;
        result
    };
    let to_client = async {
        let result = tokio::io::copy(&mut origin_r, &mut client_w).await;
        let _ = client_w.shutdown().await;
        result
    };
    let copying = async {
        let (a, b) = tokio::join!(to_origin, to_client);
        if let Err(err) = a {
            tracing::debug!(error = %err, direction = "client->origin", "tunnel copy ended");
        }
        if let Err(err) = b {
            tracing::debug!(error = %err, direction = "origin->client", "tunnel copy ended");
        }
    };

    tokio::select! {
        biased;
        () = force_close_requested(proxy.traffic_shaper.as_ref()) => {
            tracing::debug!("traffic shaper forced tunnel close");
        }
        () = copying => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    fn sniff_is_tls(peek: &[u8]) -> bool {
        peek.first().copied() == Some(super::TLS_HANDSHAKE_RECORD_TYPE)
    }

    #[test]
    fn tls_record_byte_is_0x16() {
        assert!(sniff_is_tls(&[0x16, 0x03, 0x01]));
        assert!(!sniff_is_tls(&[b'G', b'E', b'T']));
        assert!(!sniff_is_tls(&[]));
    }
}
