//! External capabilities the CONNECT Handler's MITM path (§4.4) is built
//! against. Certificate minting, HTTP/2 framing and handshake-failure
//! reporting are all injected rather than implemented here — the engine
//! only needs the seam, exactly as the framework keeps TLS acceptor
//! configuration and HTTP/2 serving as pluggable layers rather than
//! hard-wiring a single implementation into its connection handling.

use std::{future::Future, pin::Pin, sync::Arc};

use http::Uri;
use rustls::ServerConfig;

use crate::{error::BoxError, shutdown::ShutdownGuard, stream::BoxedStream};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Mints (or looks up) a TLS server configuration for a given `CONNECT`
/// target host, used to terminate the inner TLS session (§4.4 step 6). A
/// production implementation backs this with a real intermediate CA; the
/// CLI binary ships a development-only self-signed one.
pub trait TlsHostConfig: Send + Sync {
    fn server_config_for_host<'a>(
        &'a self,
        host: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ServerConfig>, BoxError>>;
}

/// Invoked when the inner TLS handshake fails (§4.4 step 6, §7e). Never
/// itself fallible: this is a reporting sink, not a recovery path.
pub trait HandshakeErrorHook: Send + Sync {
    fn on_handshake_error(&self, host: &str, err: &BoxError);
}

/// The HTTP/2 delegate invoked once ALPN negotiates `"h2"` on a MITM'd
/// tunnel (§4.4 step 6, Design Note §9 "H2 delegation"). HTTP/2 framing
/// itself is out of scope for this engine; an implementation of this trait
/// owns the connection for its lifetime and reports its own completion.
pub trait H2Proxy: Send + Sync {
    fn serve<'a>(
        &'a self,
        shutdown: &'a ShutdownGuard,
        stream: BoxedStream,
        target: &'a Uri,
    ) -> BoxFuture<'a, Result<(), BoxError>>;
}

/// TLS state observable once a MITM'd `CONNECT` tunnel's inner handshake
/// completes (§4.3 step 3: "attach the TLS state to the request"). Recorded
/// on the [`crate::session::Session`] so every request recursed over the
/// same terminated tunnel sees it, and copied onto both the [`crate::
/// context::Context`] and the request's own extensions so a modifier can
/// read it either way.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub sni: String,
    pub alpn_protocol: Option<Vec<u8>>,
}

/// A [`HandshakeErrorHook`] that only logs via `tracing`, the default when
/// no hook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandshakeErrorHook;

impl HandshakeErrorHook for TracingHandshakeErrorHook {
    fn on_handshake_error(&self, host: &str, err: &BoxError) {
        tracing::warn!(host, error = %err, "mitm tls handshake failed");
    }
}
