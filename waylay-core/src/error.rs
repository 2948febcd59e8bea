//! Error taxonomy for the proxy engine.
//!
//! Three kinds of failure are tracked separately because the pipeline treats
//! them differently: modifier errors are recoverable (§7a), round-trip/dial
//! errors become a synthetic `502` (§7b), and I/O errors are classified as
//! closable or not (§4.7, §7c) to decide whether the connection tears down.

use std::fmt;

pub use rama_error::BoxError;
pub(crate) use rama_error::{ErrorContext, ErrorExt};

/// Errors surfaced by the proxy engine at points where there is no further
/// local recovery and the caller (the per-connection task) must act on them.
#[derive(Debug)]
pub enum ProxyError {
    /// The request or response modifier returned an error. Never fatal to
    /// the pipeline; carried here only so it can be logged and turned into
    /// a `Warning` header by the caller.
    Modifier {
        stage: ModifierStage,
        source: BoxError,
    },
    /// The upstream round-trip (or, for blind tunnels, the dial) failed.
    RoundTrip(BoxError),
    /// A TLS handshake failed while terminating a MITM'd `CONNECT` tunnel.
    Handshake(BoxError),
    /// An I/O error that the classifier (§4.7) has determined requires the
    /// connection to close.
    Io(std::io::Error),
    /// The internal sentinel meaning "tear this connection down now"; raised
    /// when no other variant applies but the pipeline must still stop.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierStage {
    Request,
    Response,
}

impl fmt::Display for ModifierStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modifier { stage, source } => write!(f, "{stage} modifier error: {source}"),
            Self::RoundTrip(err) => write!(f, "round-trip error: {err}"),
            Self::Handshake(err) => write!(f, "tls handshake error: {err}"),
            Self::Io(err) => write!(f, "closable i/o error: {err}"),
            Self::Closed => f.write_str("connection closed"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Modifier { source, .. } | Self::RoundTrip(source) | Self::Handshake(source) => {
                Some(source.as_ref())
            }
            Self::Io(err) => Some(err),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// §4.7 "Closable": the minimal set that must trigger a connection teardown
/// before any write has been attempted.
pub(crate) fn is_closable(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        TimedOut | UnexpectedEof | BrokenPipe | ConnectionReset | ConnectionAborted
    )
}

/// §4.7 "Other-closable": the broader set discovered after attempting a
/// write, or while copying a blind tunnel. Per Design Note §9's open
/// question, this narrows the source taxonomy's defensive over-inclusion
/// (e.g. filesystem-only sentinels like `ErrExist`/`ErrPermission`) down to
/// the network, end-of-stream and timeout classes that can actually occur on
/// a proxied connection, without changing observable behavior.
pub(crate) fn is_other_closable(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    if is_closable(err) {
        return true;
    }
    matches!(
        err.kind(),
        NotConnected | AddrNotAvailable | ConnectionRefused | InvalidInput | WouldBlock
    )
}

/// The traffic-shaper's force-close sentinel (§4.7, §9). The shaper layer
/// is an external collaborator; the engine only needs to recognize this one
/// error so it can react the same way it reacts to any other closable I/O
/// error.
#[derive(Debug)]
pub struct ForceClose;

impl fmt::Display for ForceClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("traffic shaper requested a forced close")
    }
}

impl std::error::Error for ForceClose {}
