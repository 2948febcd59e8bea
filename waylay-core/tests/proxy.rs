//! End-to-end scenarios driving [`waylay_core::serve`] over a real loopback
//! socket, the same way the unit tests in `src/` exercise individual pieces
//! in isolation. Each test opens a raw TCP client against an ephemeral
//! listener and speaks HTTP/1.1 by hand, since the point is to observe
//! exactly what goes out on the wire.

#![allow(clippy::unwrap_used)]

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use http::Request;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use waylay_core::{
    BoxError, BoxedStream, Context, Dialer, Disposition, MitmConfig, Proxy, RecvBody,
    RequestModifier, Shutdown, TlsHostConfig,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A [`Dialer`] that never touches the network: it hands back one half of an
/// in-memory duplex pipe and serves a canned response (or a canned failure)
/// on the other half, standing in for a real origin server.
struct StubDialer {
    response: Vec<u8>,
    fail: bool,
}

impl Dialer for StubDialer {
    fn dial<'a>(&'a self, _authority: &'a str, _tls: bool) -> BoxFuture<'a, Result<BoxedStream, BoxError>> {
        Box::pin(async move {
            if self.fail {
                return Err("connection refused".into());
            }
            let (mut origin, client) = tokio::io::duplex(8 * 1024);
            let response = self.response.clone();
            tokio::spawn(async move {
                let mut discard = [0u8; 4096];
                let _ = origin.read(&mut discard).await;
                let _ = origin.write_all(&response).await;
                let _ = origin.shutdown().await;
            });
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

/// Starts `proxy` on an ephemeral loopback port under a [`Shutdown`] that
/// never fires on its own (the signal future is `pending`), returning the
/// bound address. The acceptor task is abandoned at the end of the test
/// process along with everything else tokio's test runtime tears down.
async fn spawn_proxy(proxy: Proxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = Arc::new(proxy);

    let shutdown = Shutdown::new(std::future::pending());
    shutdown.spawn_task_fn(move |guard| async move {
        waylay_core::serve(proxy, guard, listener).await;
    });
    // Dropping `Shutdown` would start tearing the acceptor down for a value
    // this function no longer has a binding for; forgetting it keeps the
    // acceptor alive for the rest of the test process instead.
    std::mem::forget(shutdown);

    addr
}

async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    out
}

fn status_line(raw: &[u8]) -> &str {
    let text = std::str::from_utf8(raw).unwrap();
    text.lines().next().unwrap_or("")
}

#[tokio::test]
async fn plain_get_round_trips_through_stub_origin() {
    let dialer = StubDialer {
        response: b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".to_vec(),
        fail: false,
    };
    let proxy = Proxy::builder().dialer(Arc::new(dialer)).build();
    let addr = spawn_proxy(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://example.test/hello HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let raw = read_all(&mut client).await;
    assert_eq!(status_line(&raw), "HTTP/1.1 200 OK");
    assert!(std::str::from_utf8(&raw).unwrap().ends_with("hello"));
    assert!(
        std::str::from_utf8(&raw).unwrap().contains("via: 1.1 waylay")
            || std::str::from_utf8(&raw).unwrap().contains("Via: 1.1 waylay")
    );
}

struct SkipRoundTrip;

impl RequestModifier for SkipRoundTrip {
    fn modify_request<'a>(
        &'a self,
        ctx: &'a mut Context,
        _req: &'a mut Request<RecvBody>,
    ) -> BoxFuture<'a, Result<Disposition, BoxError>> {
        Box::pin(async move {
            ctx.skip_round_trip = true;
            Ok(Disposition::Continue)
        })
    }
}

#[tokio::test]
async fn request_modifier_can_skip_the_round_trip() {
    // A dialer that panics if ever dialed proves the round-trip delegator
    // really did short-circuit on `skip_round_trip` rather than contacting
    // an origin regardless.
    struct PanicIfDialed;
    impl Dialer for PanicIfDialed {
        fn dial<'a>(&'a self, _authority: &'a str, _tls: bool) -> BoxFuture<'a, Result<BoxedStream, BoxError>> {
            Box::pin(async { panic!("dialer should never be called when skip_round_trip is set") })
        }
    }

    let proxy = Proxy::builder()
        .dialer(Arc::new(PanicIfDialed))
        .request_modifier(Arc::new(SkipRoundTrip))
        .build();
    let addr = spawn_proxy(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let raw = read_all(&mut client).await;
    assert_eq!(status_line(&raw), "HTTP/1.1 200 OK");
}

#[tokio::test]
async fn dial_failure_becomes_a_bad_gateway_with_warning() {
    let proxy = Proxy::builder()
        .dialer(Arc::new(StubDialer {
            response: Vec::new(),
            fail: true,
        }))
        .build();
    let addr = spawn_proxy(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let raw = read_all(&mut client).await;
    let text = std::str::from_utf8(&raw).unwrap();
    assert_eq!(status_line(&raw), "HTTP/1.1 502 Bad Gateway");
    assert!(text.to_ascii_lowercase().contains("warning:"));
}

#[tokio::test]
async fn blind_connect_tunnels_bytes_both_ways() {
    // No MitmConfig on this proxy, so CONNECT takes the blind-tunnel path;
    // the dialer hands back one half of a duplex pipe standing in for the
    // origin TCP connection the tunnel would otherwise open for real.
    struct TunnelDialer;
    impl Dialer for TunnelDialer {
        fn dial<'a>(&'a self, _authority: &'a str, _tls: bool) -> BoxFuture<'a, Result<BoxedStream, BoxError>> {
            Box::pin(async move {
                let (mut origin, client) = tokio::io::duplex(8 * 1024);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    if let Ok(n) = origin.read(&mut buf).await {
                        let _ = origin.write_all(&buf[..n]).await;
                    }
                });
                Ok(Box::new(client) as BoxedStream)
            })
        }
    }

    let proxy = Proxy::builder().dialer(Arc::new(TunnelDialer)).build();
    let addr = spawn_proxy(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .unwrap();

    let mut head = [0u8; 64];
    let n = client.read(&mut head).await.unwrap();
    assert!(std::str::from_utf8(&head[..n]).unwrap().starts_with("HTTP/1.1 200"));

    client.write_all(b"ping-through-tunnel").await.unwrap();
    let mut echoed = [0u8; 64];
    let n = client.read(&mut echoed).await.unwrap();
    assert_eq!(&echoed[..n], b"ping-through-tunnel");
}

/// A development-style `TlsHostConfig` minting one self-signed leaf per
/// host, mirroring the CLI's demo certificate authority closely enough to
/// exercise the same MITM path without depending on the `waylay-cli` crate.
struct TestCertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: rcgen::KeyPair,
    leaves: Mutex<std::collections::HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl TestCertificateAuthority {
    fn generate() -> (Self, rustls_pki_types::CertificateDer<'static>) {
        let mut ca_params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        ca_params.distinguished_name.push(rcgen::DnType::CommonName, "waylay test CA");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let ca_der = rustls_pki_types::CertificateDer::from(ca_cert.der().to_vec());

        (
            Self {
                ca_cert,
                ca_key,
                leaves: Mutex::new(std::collections::HashMap::new()),
            },
            ca_der,
        )
    }
}

impl TlsHostConfig for TestCertificateAuthority {
    fn server_config_for_host<'a>(
        &'a self,
        host: &'a str,
    ) -> BoxFuture<'a, Result<Arc<rustls::ServerConfig>, BoxError>> {
        Box::pin(async move {
            if let Some(cached) = self.leaves.lock().unwrap().get(host) {
                return Ok(Arc::clone(cached));
            }
            let mut ee_params = rcgen::CertificateParams::new(vec![host.to_string()]).unwrap();
            ee_params.is_ca = rcgen::IsCa::NoCa;
            let ee_key = rcgen::KeyPair::generate().unwrap();
            let ee_cert = ee_params.signed_by(&ee_key, &self.ca_cert, &self.ca_key).unwrap();

            let cert_der = rustls_pki_types::CertificateDer::from(ee_cert.der().to_vec());
            let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(
                rustls_pki_types::PrivatePkcs8KeyDer::from(ee_key.serialize_der()),
            );
            let config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der], key_der)
                .map_err(|e| Box::new(e) as BoxError)?;
            let config = Arc::new(config);
            self.leaves.lock().unwrap().insert(host.to_string(), Arc::clone(&config));
            Ok(config)
        })
    }
}

#[tokio::test]
async fn mitm_connect_terminates_tls_and_proxies_the_inner_request() {
    let (ca, ca_der) = TestCertificateAuthority::generate();

    let dialer = StubDialer {
        response: b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok".to_vec(),
        fail: false,
    };

    let proxy = Proxy::builder()
        .dialer(Arc::new(dialer))
        .mitm(MitmConfig::new(Arc::new(ca)))
        .build();
    let addr = spawn_proxy(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .unwrap();

    let mut head = [0u8; 64];
    let n = client.read(&mut head).await.unwrap();
    assert!(std::str::from_utf8(&head[..n]).unwrap().starts_with("HTTP/1.1 200"));

    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_der).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = rustls_pki_types::ServerName::try_from("example.test").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();

    tls.write_all(b"GET / HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    tls.read_to_end(&mut raw).await.unwrap();
    let text = std::str::from_utf8(&raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("ok"));
}

#[tokio::test]
async fn graceful_shutdown_waits_for_in_flight_connections() {
    let dialer = StubDialer {
        response: b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
        fail: false,
    };
    let proxy = Arc::new(Proxy::builder().dialer(Arc::new(dialer)).build());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown = Shutdown::new(async {
        let _ = rx.await;
    });
    shutdown.spawn_task_fn(move |guard| async move {
        waylay_core::serve(proxy, guard, listener).await;
    });

    // An idle connection that never sends a request: the acceptor has
    // already accepted it by the time we signal shutdown below.
    let _idle = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), shutdown.shutdown_with_limit(Duration::from_secs(1))).await;
    assert!(result.is_ok(), "shutdown must complete once the idle connection's read times out or is dropped");
}
