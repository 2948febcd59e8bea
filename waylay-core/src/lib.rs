//! An intercepting HTTP/HTTPS forward proxy engine: accept loop, per-connection
//! request pipeline, `CONNECT`/MITM state machine, and the session/context
//! lifecycle spanning many requests on one connection. Certificate minting,
//! HTTP/2 serving and traffic-shaping are injected capabilities, not
//! implemented here — see [`mitm`] and [`roundtrip::Dialer`].

mod acceptor;
mod backoff;
mod config;
mod connect;
mod context;
mod error;
mod mitm;
mod modifier;
mod pipeline;
mod roundtrip;
mod session;
mod shutdown;
mod stream;
mod wire;

pub use acceptor::serve;
pub use config::{MitmConfig, Proxy, ProxyAuth, ProxyBuilder};
pub use context::Context;
pub use error::{BoxError, ForceClose, ModifierStage, ProxyError};
pub use mitm::{H2Proxy, HandshakeErrorHook, TlsHostConfig, TlsInfo, TracingHandshakeErrorHook};
pub use modifier::{Disposition, NoopModifier, RequestModifier, ResponseModifier};
pub use roundtrip::{Dialer, TcpDialer};
pub use session::Session;
pub use shutdown::{Shutdown, ShutdownGuard, WeakShutdownGuard, default_signal};
pub use stream::{BoxedStream, IoStream, TrafficShaper};
pub use wire::{BODY_LIMIT, RecvBody, SendBody};
