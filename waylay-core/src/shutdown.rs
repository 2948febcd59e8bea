//! Shutdown Coordinator (§4.2). A thin re-export of the framework's own
//! graceful-shutdown crate, exactly as the framework's core crate does for
//! its own `Shutdown`/`ShutdownGuard` types — there is no reason to
//! hand-roll a broadcast-plus-waitgroup pair when this crate already
//! solves it generically.

#[doc(inline)]
pub use ::tokio_graceful::{Shutdown, ShutdownGuard, WeakShutdownGuard, default_signal};
