//! A development-only demo certificate authority implementing the
//! [`TlsHostConfig`] capability (§10.3). Mints a self-signed root once at
//! startup, then a fresh leaf certificate per distinct `CONNECT` host the
//! first time it is seen, cached afterwards. This is explicitly a
//! convenience for local testing and interactive use, not a production CA:
//! the root key lives only in process memory and is never persisted.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
};

use rcgen::{Certificate, CertificateParams, DnType, KeyPair};
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use waylay_core::{BoxError, TlsHostConfig};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct DemoCertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl DemoCertificateAuthority {
    pub fn generate() -> Result<Self, BoxError> {
        let mut ca_params = CertificateParams::new(Vec::new())?;
        ca_params.distinguished_name.push(DnType::CommonName, "waylay demo CA");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let ca_key = KeyPair::generate()?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        Ok(Self {
            ca_cert,
            ca_key,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The root certificate, DER-encoded, so callers can print or export it
    /// for the operator to trust in a test client.
    pub fn root_certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.ca_cert.der().to_vec())
    }

    fn mint(&self, host: &str) -> Result<Arc<ServerConfig>, BoxError> {
        let mut ee_params = CertificateParams::new(vec![host.to_string()])?;
        ee_params.is_ca = rcgen::IsCa::NoCa;
        ee_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let ee_key = KeyPair::generate()?;
        let ee_cert = ee_params.signed_by(&ee_key, &self.ca_cert, &self.ca_key)?;

        let cert_der = CertificateDer::from(ee_cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(ee_key.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ServerConfig>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TlsHostConfig for DemoCertificateAuthority {
    fn server_config_for_host<'a>(
        &'a self,
        host: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ServerConfig>, BoxError>> {
        Box::pin(async move {
            if let Some(cached) = self.cache().get(host) {
                return Ok(Arc::clone(cached));
            }
            let config = self.mint(host)?;
            self.cache().insert(host.to_string(), Arc::clone(&config));
            Ok(config)
        })
    }
}
