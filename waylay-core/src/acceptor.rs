//! Connection Acceptor (§4.1): the listener loop. Runs as one task spawned
//! onto the [`Shutdown`] coordinator; each accepted connection is handed to
//! its own task running the [`crate::pipeline::run`] loop.

use std::{sync::Arc, time::Duration};

use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use crate::{backoff::AcceptBackoff, config::Proxy, session::Session, shutdown::ShutdownGuard};

/// 3 minutes, per §4.1's TCP keep-alive period.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(180);

/// Accepts connections on `listener` until the listener errors permanently
/// or `guard` is cancelled. Mirrors the shape of a plain `tokio::select!`
/// accept loop racing a cancellation future, the same pattern the
/// framework's own TCP server drives its `serve_graceful` call through,
/// just without the framework's `Service`-per-connection abstraction.
pub async fn serve(proxy: Arc<Proxy>, guard: ShutdownGuard, listener: TcpListener) {
    let mut backoff = AcceptBackoff::new();

    loop {
        if guard.is_cancelled() {
            return;
        }

        let accepted = tokio::select! {
            biased;
            _ = guard.cancelled() => return,
            result = listener.accept() => result,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => {
                backoff.reset();
                pair
            }
            Err(err) if is_temporary(&err) => {
                let delay = backoff.next_delay();
                tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "transient accept error, backing off");
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "permanent accept error, stopping acceptor");
                return;
            }
        };

        prepare_stream(&stream);

        // §5 "concurrent connections (0 = unbounded)": block the accept loop
        // on a permit rather than spawning unboundedly and rejecting later,
        // the same backpressure-at-the-gate shape as the framework's
        // `ConcurrentPolicy`.
        let permit = match &proxy.max_connections {
            Some(sem) => match Arc::clone(sem).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        let proxy = Arc::clone(&proxy);
        let conn_guard = guard.clone();
        let session = Session::new();
        let span = tracing::info_span!("connection", peer = %peer_addr, conn_id = session.id());
        guard.spawn_task(
            async move {
                crate::pipeline::run(&proxy, &conn_guard, session, Box::new(stream)).await;
                drop(permit);
            }
            .instrument(span),
        );
    }
}

/// TCP keep-alive (period per §4.1) plus SIGPIPE suppression on platforms
/// where a write to a peer that has already closed its read side otherwise
/// raises a process-fatal signal instead of returning `EPIPE`.
fn prepare_stream(stream: &TcpStream) {
    let socket = socket2::SockRef::from(stream);
    if let Err(err) = socket.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD)) {
        tracing::debug!(error = %err, "failed to enable TCP keepalive");
    }
    suppress_sigpipe();
}

#[cfg(unix)]
fn suppress_sigpipe() {
    // SAFETY: SIG_IGN is a valid disposition and this call has no other
    // preconditions; installing it is idempotent across repeated calls.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn suppress_sigpipe() {}

/// §4.1 "classified by the platform as temporary/retryable": the conditions
/// a real accept loop needs to survive rather than abort on.
fn is_temporary(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | WouldBlock | Interrupted
    )
}
