//! §3 "Proxy" and §10.5 ambient knobs: the long-lived, builder-constructed
//! engine configuration. Mutated only via the builder before [`crate::serve`]
//! is called, then treated as immutable for the lifetime of the server —
//! the same contract the framework's own `Service` stacks assume once built.

use std::{sync::Arc, time::Duration};

use http::{HeaderMap, Uri};

use crate::{
    mitm::{H2Proxy, HandshakeErrorHook, TlsHostConfig, TracingHandshakeErrorHook},
    modifier::{NoopModifier, RequestModifier, ResponseModifier},
    roundtrip::{Dialer, TcpDialer},
    stream::TrafficShaper,
};

/// §5 "the per-request deadline default is five minutes".
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// §4.4's external collaborators, bundled together because they only make
/// sense as a group: no certificate capability means no MITM at all, so the
/// absence of a whole [`MitmConfig`] (rather than three separately optional
/// fields) is what `CONNECT Handler` branches on (§4.4 vs §4.5).
pub struct MitmConfig {
    pub tls_host_config: Arc<dyn TlsHostConfig>,
    pub on_handshake_error: Arc<dyn HandshakeErrorHook>,
    pub h2_proxy: Option<Arc<dyn H2Proxy>>,
}

impl MitmConfig {
    pub fn new(tls_host_config: Arc<dyn TlsHostConfig>) -> Self {
        Self {
            tls_host_config,
            on_handshake_error: Arc::new(TracingHandshakeErrorHook),
            h2_proxy: None,
        }
    }

    pub fn with_h2_proxy(mut self, h2_proxy: Arc<dyn H2Proxy>) -> Self {
        self.h2_proxy = Some(h2_proxy);
        self
    }

    pub fn with_handshake_error_hook(mut self, hook: Arc<dyn HandshakeErrorHook>) -> Self {
        self.on_handshake_error = hook;
        self
    }
}

/// §10.5 "Proxy-Authorization": an opt-in Basic-auth gate. Absent by
/// default, matching the Non-goal that the core never forces client
/// authentication on by itself.
pub struct ProxyAuth {
    credentials: Vec<(String, String)>,
}

impl ProxyAuth {
    pub fn new() -> Self {
        Self { credentials: Vec::new() }
    }

    pub fn with_credential(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials.push((username.into(), password.into()));
        self
    }

    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get(http::header::PROXY_AUTHORIZATION) else {
            return false;
        };
        let Ok(value) = value.to_str() else { return false };
        let Some(encoded) = value.strip_prefix("Basic ") else { return false };
        let Ok(decoded) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else { return false };
        let Some((user, pass)) = decoded.split_once(':') else { return false };
        self.credentials
            .iter()
            .any(|(u, p)| u == user && p == pass)
    }
}

impl Default for ProxyAuth {
    fn default() -> Self {
        Self::new()
    }
}

/// The long-lived engine, shared (behind whatever ownership the caller
/// picks, typically `Arc`) across every accepted connection. Construct via
/// [`ProxyBuilder`].
pub struct Proxy {
    pub mitm: Option<MitmConfig>,
    pub request_modifier: Arc<dyn RequestModifier>,
    pub response_modifier: Arc<dyn ResponseModifier>,
    pub dialer: Arc<dyn Dialer>,
    pub downstream_proxy: Option<Uri>,
    pub timeout: Duration,
    pub proxy_auth: Option<ProxyAuth>,
    /// §5, §10.3 "concurrent connections (0 = unbounded)": mirrors the
    /// framework's own `ConcurrentPolicy`/`UnlimitedPolicy` choice, just
    /// collapsed to a single `Option` since the acceptor only ever needs to
    /// ask "is there a permit" rather than pick between policy types.
    pub max_connections: Option<Arc<tokio::sync::Semaphore>>,
    /// The injected traffic-shaping capability (§9, out of scope to
    /// implement here). Consulted at every suspension point §5 names; absent
    /// by default, matching the Non-goal that shaping is never built into
    /// the core itself.
    pub traffic_shaper: Option<Arc<dyn TrafficShaper>>,
}

impl Proxy {
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::default()
    }
}

/// Builder for [`Proxy`] (§3: "created by a builder, mutated only via
/// setters before `Serve` begins").
pub struct ProxyBuilder {
    mitm: Option<MitmConfig>,
    request_modifier: Arc<dyn RequestModifier>,
    response_modifier: Arc<dyn ResponseModifier>,
    dialer: Arc<dyn Dialer>,
    downstream_proxy: Option<Uri>,
    timeout: Duration,
    proxy_auth: Option<ProxyAuth>,
    max_connections: Option<Arc<tokio::sync::Semaphore>>,
    traffic_shaper: Option<Arc<dyn TrafficShaper>>,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self {
            mitm: None,
            request_modifier: Arc::new(NoopModifier),
            response_modifier: Arc::new(NoopModifier),
            dialer: Arc::new(TcpDialer),
            downstream_proxy: None,
            timeout: DEFAULT_TIMEOUT,
            proxy_auth: None,
            max_connections: None,
            traffic_shaper: None,
        }
    }
}

impl ProxyBuilder {
    pub fn mitm(mut self, mitm: MitmConfig) -> Self {
        self.mitm = Some(mitm);
        self
    }

    pub fn request_modifier(mut self, modifier: Arc<dyn RequestModifier>) -> Self {
        self.request_modifier = modifier;
        self
    }

    pub fn response_modifier(mut self, modifier: Arc<dyn ResponseModifier>) -> Self {
        self.response_modifier = modifier;
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn downstream_proxy(mut self, uri: Uri) -> Self {
        self.downstream_proxy = Some(uri);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn proxy_auth(mut self, auth: ProxyAuth) -> Self {
        self.proxy_auth = Some(auth);
        self
    }

    /// Cap the number of connections accepted at once. `0` (or never
    /// calling this) means unbounded, matching `UnlimitedPolicy`.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = if max == 0 {
            None
        } else {
            Some(Arc::new(tokio::sync::Semaphore::new(max)))
        };
        self
    }

    /// Have the engine consult an external traffic-shaping capability at
    /// every suspension point (§5, §9): absent by default.
    pub fn traffic_shaper(mut self, shaper: Arc<dyn TrafficShaper>) -> Self {
        self.traffic_shaper = Some(shaper);
        self
    }

    pub fn build(self) -> Proxy {
        Proxy {
            mitm: self.mitm,
            request_modifier: self.request_modifier,
            response_modifier: self.response_modifier,
            dialer: self.dialer,
            downstream_proxy: self.downstream_proxy,
            timeout: self.timeout,
            proxy_auth: self.proxy_auth,
            max_connections: self.max_connections,
            traffic_shaper: self.traffic_shaper,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn proxy_auth_accepts_matching_basic_credential() {
        let auth = ProxyAuth::new().with_credential("alice", "hunter2");
        let mut headers = HeaderMap::new();
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"alice:hunter2");
        headers.insert(
            http::header::PROXY_AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        assert!(auth.is_authorized(&headers));
    }

    #[test]
    fn proxy_auth_rejects_missing_or_wrong_credential() {
        let auth = ProxyAuth::new().with_credential("alice", "hunter2");
        assert!(!auth.is_authorized(&HeaderMap::new()));

        let mut headers = HeaderMap::new();
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"alice:wrong");
        headers.insert(
            http::header::PROXY_AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        assert!(!auth.is_authorized(&headers));
    }

    #[test]
    fn default_builder_has_no_mitm_or_auth() {
        let proxy = Proxy::builder().build();
        assert!(proxy.mitm.is_none());
        assert!(proxy.proxy_auth.is_none());
        assert_eq!(proxy.timeout, DEFAULT_TIMEOUT);
    }
}
