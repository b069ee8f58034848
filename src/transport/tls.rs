// SPDX-License-Identifier: Apache-2.0

//! TLS material resolution and engine construction.
//!
//! Material is looked up in this order, first match wins:
//! 1. `tessera.ssl.keyStore` (two-way; trust store defaults to the key store)
//! 2. `tessera.ssl.trustStore` alone (one-way)
//! 3. generic `SSL_KEY_STORE` / `SSL_CERT_FILE` (platform default engine)
//! 4. bundled stores in the resource directory
//! 5. the platform default engine with built-in roots
//!
//! A trust store of `NONE` selects anonymous mode: the peer certificate is
//! not verified. Stores are PEM files; a key store holds the certificate
//! chain followed by its private key.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

use tessera_core::{EngineError, EngineResult};

use crate::observability::Sensitive;

pub const KEY_STORE: &str = "tessera.ssl.keyStore";
pub const KEY_STORE_PASSWORD: &str = "tessera.ssl.keyStorePassword";
pub const KEY_PASSWORD: &str = "tessera.ssl.keyPassword";
pub const KEY_STORE_TYPE: &str = "tessera.ssl.keyStoreType";
pub const TRUST_STORE: &str = "tessera.ssl.trustStore";
pub const TRUST_STORE_PASSWORD: &str = "tessera.ssl.trustStorePassword";
pub const PROTOCOL: &str = "tessera.ssl.protocol";
pub const ALGORITHM: &str = "tessera.ssl.algorithm";

pub const GENERIC_KEY_STORE: &str = "SSL_KEY_STORE";
pub const GENERIC_KEY_STORE_PASSWORD: &str = "SSL_KEY_STORE_PASSWORD";
pub const GENERIC_TRUST_STORE: &str = "SSL_CERT_FILE";
pub const GENERIC_TRUST_STORE_PASSWORD: &str = "SSL_TRUST_STORE_PASSWORD";

pub const DEFAULT_KEY_STORE_RESOURCE: &str = "tessera.keystore.pem";
pub const DEFAULT_TRUST_STORE_RESOURCE: &str = "tessera.truststore.pem";
pub const DEFAULT_STORE_PASSWORD: &str = "changeit";
pub const DEFAULT_PROTOCOL: &str = "TLS";
pub const DEFAULT_STORE_TYPE: &str = "PEM";

/// Trust store value that selects anonymous (unverified) mode.
pub const ANONYMOUS_TRUST_STORE: &str = "NONE";

const GENERIC_KEYS: &[&str] = &[
    GENERIC_KEY_STORE,
    GENERIC_KEY_STORE_PASSWORD,
    GENERIC_TRUST_STORE,
    GENERIC_TRUST_STORE_PASSWORD,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// No peer verification.
    Anonymous,
    /// Peer certificate verified against the trust store.
    OneWay,
    /// Both sides present certificates.
    TwoWay,
    /// Two-way with the key store doubling as the trust store.
    Symmetric,
    /// Built-in roots plus whatever generic material was supplied.
    PlatformDefault,
}

/// Which precedence level produced the material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialSource {
    EngineProperties,
    PlatformProperties,
    BundledDefaults,
    Platform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSpec {
    pub path: PathBuf,
    /// Carried for store types that are encrypted; PEM stores ignore it.
    pub password: Option<Sensitive<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub mode: TlsMode,
    pub source: MaterialSource,
    pub key_store: Option<StoreSpec>,
    pub key_password: Option<Sensitive<String>>,
    pub trust_store: Option<StoreSpec>,
    pub protocol: String,
    pub store_type: String,
    pub algorithm: Option<String>,
}

/// Overlays the generic platform variables from `lookup` under `props`;
/// explicit properties win.
pub fn merge_platform_properties<F>(props: &HashMap<String, String>, lookup: F) -> HashMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = props.clone();
    for key in GENERIC_KEYS {
        if !merged.contains_key(*key) {
            if let Some(value) = lookup(key) {
                merged.insert(key.to_string(), value);
            }
        }
    }
    merged
}

fn property<'a>(props: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    props.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn secret(value: Option<&str>) -> Option<Sensitive<String>> {
    value.map(|v| Sensitive::new(v.to_string()))
}

fn is_anonymous(value: &str) -> bool {
    value.eq_ignore_ascii_case(ANONYMOUS_TRUST_STORE)
}

/// Resolves TLS material from properties and the bundled resource directory.
pub fn resolve_tls_material(
    props: &HashMap<String, String>,
    resource_dir: Option<&Path>,
) -> EngineResult<TlsMaterial> {
    let store_type = property(props, KEY_STORE_TYPE).unwrap_or(DEFAULT_STORE_TYPE);
    if !store_type.eq_ignore_ascii_case(DEFAULT_STORE_TYPE) {
        return Err(EngineError::transport_setup(format!(
            "unsupported store type {store_type}; only PEM stores are supported"
        )));
    }

    let material = |mode, source, key_store, trust_store| TlsMaterial {
        mode,
        source,
        key_store,
        key_password: secret(property(props, KEY_PASSWORD)),
        trust_store,
        protocol: property(props, PROTOCOL).unwrap_or(DEFAULT_PROTOCOL).to_string(),
        store_type: DEFAULT_STORE_TYPE.to_string(),
        algorithm: property(props, ALGORITHM).map(str::to_string),
    };
    let store = |path: &str, password: Option<&str>| StoreSpec {
        path: PathBuf::from(path),
        password: secret(password),
    };

    let key_password = property(props, KEY_STORE_PASSWORD);
    let engine_key = property(props, KEY_STORE).map(|path| store(path, key_password));
    let engine_trust = property(props, TRUST_STORE);

    if engine_trust.is_some_and(is_anonymous) {
        return Ok(material(TlsMode::Anonymous, MaterialSource::EngineProperties, engine_key, None));
    }
    if let Some(key) = engine_key {
        let trust_password = property(props, TRUST_STORE_PASSWORD).or(key_password);
        let trust = match engine_trust {
            Some(path) => store(path, trust_password),
            None => StoreSpec {
                path: key.path.clone(),
                password: secret(trust_password),
            },
        };
        return Ok(material(
            TlsMode::TwoWay,
            MaterialSource::EngineProperties,
            Some(key),
            Some(trust),
        ));
    }
    if let Some(path) = engine_trust {
        let trust = store(path, property(props, TRUST_STORE_PASSWORD));
        return Ok(material(
            TlsMode::OneWay,
            MaterialSource::EngineProperties,
            None,
            Some(trust),
        ));
    }

    let generic_key = property(props, GENERIC_KEY_STORE)
        .map(|path| store(path, property(props, GENERIC_KEY_STORE_PASSWORD)));
    let generic_trust = property(props, GENERIC_TRUST_STORE);
    if generic_trust.is_some_and(is_anonymous) {
        return Ok(material(
            TlsMode::Anonymous,
            MaterialSource::PlatformProperties,
            generic_key,
            None,
        ));
    }
    if generic_key.is_some() || generic_trust.is_some() {
        let trust = generic_trust.map(|path| store(path, property(props, GENERIC_TRUST_STORE_PASSWORD)));
        return Ok(material(
            TlsMode::PlatformDefault,
            MaterialSource::PlatformProperties,
            generic_key,
            trust,
        ));
    }

    if let Some(dir) = resource_dir {
        let bundled = |name: &str| {
            let path = dir.join(name);
            path.is_file().then_some(path)
        };
        let default_password = |key: &str| {
            Some(Sensitive::new(
                property(props, key).unwrap_or(DEFAULT_STORE_PASSWORD).to_string(),
            ))
        };
        let key = bundled(DEFAULT_KEY_STORE_RESOURCE).map(|path| StoreSpec {
            path,
            password: default_password(KEY_STORE_PASSWORD),
        });
        let trust = bundled(DEFAULT_TRUST_STORE_RESOURCE).map(|path| StoreSpec {
            path,
            password: default_password(TRUST_STORE_PASSWORD),
        });
        let resolved = match (key, trust) {
            (Some(key), Some(trust)) => Some((TlsMode::TwoWay, Some(key), Some(trust))),
            (None, Some(trust)) => Some((TlsMode::OneWay, None, Some(trust))),
            (Some(key), None) => {
                let trust = key.clone();
                Some((TlsMode::Symmetric, Some(key), Some(trust)))
            }
            (None, None) => None,
        };
        if let Some((mode, key, trust)) = resolved {
            return Ok(material(mode, MaterialSource::BundledDefaults, key, trust));
        }
    }

    Ok(material(TlsMode::PlatformDefault, MaterialSource::Platform, None, None))
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(protocol: &str) -> EngineResult<&'static [&'static SupportedProtocolVersion]> {
    match protocol.to_ascii_uppercase().as_str() {
        "TLS" | "SSL" => Ok(rustls::ALL_VERSIONS),
        "TLSV1.2" => Ok(TLS12_ONLY),
        "TLSV1.3" => Ok(TLS13_ONLY),
        other => Err(EngineError::transport_setup(format!(
            "unsupported TLS protocol {other}"
        ))),
    }
}

fn read_store(store: &StoreSpec) -> EngineResult<Vec<u8>> {
    fs::read(&store.path).map_err(|e| {
        EngineError::transport_setup(format!("cannot read store {}: {e}", store.path.display()))
    })
}

fn load_certs(store: &StoreSpec, pem: &[u8]) -> EngineResult<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| {
            EngineError::transport_setup(format!(
                "read certificates from {} failed: {e}",
                store.path.display()
            ))
        })?;
    if certs.is_empty() {
        return Err(EngineError::transport_setup(format!(
            "{} contains no certificates",
            store.path.display()
        )));
    }
    Ok(certs)
}

fn load_identity(store: &StoreSpec) -> EngineResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let pem = read_store(store)?;
    let certs = load_certs(store, &pem)?;
    let key = rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| {
            EngineError::transport_setup(format!(
                "read private key from {} failed: {e}",
                store.path.display()
            ))
        })?
        .ok_or_else(|| {
            EngineError::transport_setup(format!(
                "{} contains no private key",
                store.path.display()
            ))
        })?;
    Ok((certs, key))
}

fn load_roots(store: &StoreSpec) -> EngineResult<RootCertStore> {
    let pem = read_store(store)?;
    let mut roots = RootCertStore::empty();
    for cert in load_certs(store, &pem)? {
        roots
            .add(cert)
            .map_err(|e| EngineError::transport_setup(format!("add trusted certificate failed: {e}")))?;
    }
    Ok(roots)
}

fn platform_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Accepts any server certificate. Only reachable through an explicit
/// `NONE` trust store.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds the client-side engine for the resolved material.
pub fn build_client_engine(material: &TlsMaterial) -> EngineResult<TlsConnector> {
    let versions = protocol_versions(&material.protocol)?;
    let builder = ClientConfig::builder_with_protocol_versions(versions);

    let config = if material.mode == TlsMode::Anonymous {
        warn!("Anonymous TLS selected; server certificates will not be verified");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                provider: Arc::new(rustls::crypto::ring::default_provider()),
            }))
            .with_no_client_auth()
    } else {
        let roots = match &material.trust_store {
            Some(store) => load_roots(store)?,
            None => platform_roots(),
        };
        let builder = builder.with_root_certificates(roots);
        match &material.key_store {
            Some(store) => {
                let (chain, key) = load_identity(store)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| EngineError::transport_setup(format!("client certificate rejected: {e}")))?
            }
            None => builder.with_no_client_auth(),
        }
    };

    info!(mode = ?material.mode, source = ?material.source, "Client TLS engine ready");
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Builds the listener-side engine. Requires a key store; client
/// certificates are verified in two-way and symmetric modes.
pub fn build_server_engine(material: &TlsMaterial) -> EngineResult<TlsAcceptor> {
    let key_store = material.key_store.as_ref().ok_or_else(|| {
        EngineError::transport_setup(
            "server TLS requires a key store with a certificate and private key",
        )
    })?;
    let (chain, key) = load_identity(key_store)?;
    let versions = protocol_versions(&material.protocol)?;
    let builder = ServerConfig::builder_with_protocol_versions(versions);

    let builder = match (material.mode, &material.trust_store) {
        (TlsMode::TwoWay | TlsMode::Symmetric, Some(trust)) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(trust)?))
                .build()
                .map_err(|e| EngineError::transport_setup(format!("build client verifier failed: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        _ => builder.with_no_client_auth(),
    };
    let config = builder
        .with_single_cert(chain, key)
        .map_err(|e| EngineError::transport_setup(format!("server certificate rejected: {e}")))?;

    info!(mode = ?material.mode, source = ?material.source, "Server TLS engine ready");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn engine_key_store_means_two_way_with_shared_trust() {
        let material = resolve_tls_material(
            &props(&[(KEY_STORE, "/etc/tessera/key.pem"), (KEY_STORE_PASSWORD, "pw")]),
            None,
        )
        .unwrap();
        assert_eq!(material.mode, TlsMode::TwoWay);
        assert_eq!(material.source, MaterialSource::EngineProperties);
        let trust = material.trust_store.unwrap();
        assert_eq!(trust.path, PathBuf::from("/etc/tessera/key.pem"));
        assert_eq!(trust.password.unwrap().expose(), "pw");
    }

    #[test]
    fn engine_trust_store_alone_is_one_way() {
        let material = resolve_tls_material(
            &props(&[
                (TRUST_STORE, "/etc/tessera/ca.pem"),
                (PROTOCOL, "TLSv1.2"),
                (GENERIC_KEY_STORE, "/ignored.pem"),
            ]),
            None,
        )
        .unwrap();
        assert_eq!(material.mode, TlsMode::OneWay);
        assert_eq!(material.protocol, "TLSv1.2");
        assert!(material.key_store.is_none());
    }

    #[test]
    fn none_trust_store_is_anonymous() {
        let material =
            resolve_tls_material(&props(&[(TRUST_STORE, "none")]), None).unwrap();
        assert_eq!(material.mode, TlsMode::Anonymous);
        build_client_engine(&material).unwrap();
    }

    #[test]
    fn generic_properties_use_platform_engine() {
        let merged = merge_platform_properties(&HashMap::new(), |key| {
            (key == GENERIC_TRUST_STORE).then(|| "/etc/ssl/ca.pem".to_string())
        });
        let material = resolve_tls_material(&merged, None).unwrap();
        assert_eq!(material.mode, TlsMode::PlatformDefault);
        assert_eq!(material.source, MaterialSource::PlatformProperties);
    }

    #[test]
    fn bundled_defaults_pick_mode_from_present_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_KEY_STORE_RESOURCE), "").unwrap();

        let material = resolve_tls_material(&HashMap::new(), Some(dir.path())).unwrap();
        assert_eq!(material.mode, TlsMode::Symmetric);
        assert_eq!(material.source, MaterialSource::BundledDefaults);
        assert_eq!(
            material.key_store.unwrap().password.unwrap().expose(),
            DEFAULT_STORE_PASSWORD
        );

        fs::write(dir.path().join(DEFAULT_TRUST_STORE_RESOURCE), "").unwrap();
        let material = resolve_tls_material(&HashMap::new(), Some(dir.path())).unwrap();
        assert_eq!(material.mode, TlsMode::TwoWay);

        fs::remove_file(dir.path().join(DEFAULT_KEY_STORE_RESOURCE)).unwrap();
        let material = resolve_tls_material(&HashMap::new(), Some(dir.path())).unwrap();
        assert_eq!(material.mode, TlsMode::OneWay);
    }

    #[test]
    fn nothing_configured_falls_back_to_platform_default() {
        let dir = tempfile::tempdir().unwrap();
        let material = resolve_tls_material(&HashMap::new(), Some(dir.path())).unwrap();
        assert_eq!(material.mode, TlsMode::PlatformDefault);
        assert_eq!(material.source, MaterialSource::Platform);
        build_client_engine(&material).unwrap();
    }

    #[test]
    fn setup_failures_are_reported() {
        let err = resolve_tls_material(&props(&[(KEY_STORE_TYPE, "JKS")]), None).unwrap_err();
        assert!(matches!(err, EngineError::TransportSetupFailure { .. }));

        let material =
            resolve_tls_material(&props(&[(PROTOCOL, "SSLv3")]), None).unwrap();
        assert!(matches!(
            build_client_engine(&material),
            Err(EngineError::TransportSetupFailure { .. })
        ));

        let material = resolve_tls_material(&props(&[(TRUST_STORE, "NONE")]), None).unwrap();
        assert!(matches!(
            build_server_engine(&material),
            Err(EngineError::TransportSetupFailure { .. })
        ));

        let material =
            resolve_tls_material(&props(&[(TRUST_STORE, "/does/not/exist.pem")]), None).unwrap();
        assert!(matches!(
            build_client_engine(&material),
            Err(EngineError::TransportSetupFailure { .. })
        ));
    }
}
