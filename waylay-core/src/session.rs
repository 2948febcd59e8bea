//! §3 "Session": per-connection state that survives across every request
//! handled on one client connection, including the inner TLS session that
//! appears after a MITM'd `CONNECT`.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::mitm::TlsInfo;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: u64,
    /// Monotonic: once a connection is known to be TLS, it never reverts.
    secure: AtomicBool,
    /// Monotonic: once a modifier has taken the stream, the pipeline must
    /// never touch it again.
    hijacked: AtomicBool,
    /// Set once, right after the MITM path's inner TLS handshake completes.
    tls_info: Mutex<Option<Arc<TlsInfo>>>,
}

impl Session {
    /// A fresh session for a newly accepted connection.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                secure: AtomicBool::new(false),
                hijacked: AtomicBool::new(false),
                tls_info: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Marks the session secure. Idempotent; never clears the flag back.
    pub fn mark_secure(&self) {
        self.inner.secure.store(true, Ordering::Release);
    }

    pub fn is_secure(&self) -> bool {
        self.inner.secure.load(Ordering::Acquire)
    }

    /// Attempts the one-way transition to hijacked. Returns `true` the first
    /// time it is called for this session, `false` on every call after
    /// (including concurrent callers racing the same transition).
    pub fn try_hijack(&self) -> bool {
        self.inner
            .hijacked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_hijacked(&self) -> bool {
        self.inner.hijacked.load(Ordering::Acquire)
    }

    /// Records the inner TLS state once the MITM path's handshake completes
    /// (§4.3 step 3), visible to every request recursed over this session
    /// from then on.
    pub fn set_tls_info(&self, info: TlsInfo) {
        *self.inner.tls_info.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(info));
    }

    pub fn tls_info(&self) -> Option<Arc<TlsInfo>> {
        self.inner.tls_info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
