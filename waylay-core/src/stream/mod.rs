//! Stream abstractions shared by the pipeline and the `CONNECT` handler.

mod peek;
pub(crate) use peek::{PeekStream, sniff_prefix};

use std::{fmt, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};

/// Blanket bound for anything the engine can read from and write to once a
/// connection has been accepted: a plain TCP stream, a TLS stream, or a
/// [`PeekStream`] wrapping either. Boxing behind this trait is what lets the
/// `CONNECT` handler recurse into the request pipeline (§4.4) without the
/// recursive type blowing up — the alternative, a fully generic pipeline
/// parameterized over the concrete stream type, cannot express "the same
/// function, called again, now with a TLS stream on top of what used to be
/// the raw stream" without unbounded monomorphization.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> IoStream for T {}

/// A type-erased, owned duplex stream.
pub type BoxedStream = Box<dyn IoStream>;

/// A capability exposed by the traffic-shaping decorator described in
/// Design Note §9: the core never type-tests the stream it was handed, it
/// just asks this question at its suspension points.
pub trait TrafficShaper: Send + Sync + fmt::Debug {
    /// Whether the shaper wants this connection torn down right now,
    /// independent of any I/O outcome (§4.7's `ErrForceClose`).
    fn should_force_close(&self) -> bool;
}

const FORCE_CLOSE_POLL_PERIOD: Duration = Duration::from_millis(200);

/// Resolves once `shaper` reports a forced close, or never resolves if no
/// shaper is configured. Paired with `tokio::select!` against the shutdown
/// signal at every suspension point §5 names, the same shape
/// `ShutdownGuard::cancelled` uses.
pub(crate) async fn force_close_requested(shaper: Option<&Arc<dyn TrafficShaper>>) {
    match shaper {
        None => std::future::pending().await,
        Some(shaper) => {
            let mut interval = tokio::time::interval(FORCE_CLOSE_POLL_PERIOD);
            loop {
                interval.tick().await;
                if shaper.should_force_close() {
                    return;
                }
            }
        }
    }
}
