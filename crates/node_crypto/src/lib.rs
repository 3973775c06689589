//! Node identity, mTLS configuration, and CA helpers.
//!
//! A node's canonical name is the subject common name of its certificate.
//! `DevCa` mints a throwaway CA for local development; production deployments
//! load externally issued material through [`provision::load_external`].

pub mod provision;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub use provision::{load_external, load_or_generate, ExternalMaterial, ProvisionOptions};

const CA_COMMON_NAME: &str = "NodeMesh Dev CA";
const ORGANIZATION: &str = "NodeMesh";
const CA_VALIDITY_DAYS: i64 = 3650;
const NODE_VALIDITY_DAYS: i64 = 365;
/// SANs every issued node certificate carries in addition to its own id.
const DEFAULT_SANS: &[&str] = &["localhost", "127.0.0.1"];

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no certificate found in {0}")]
    NoCertificate(&'static str),
    #[error("no private key found in {0}")]
    NoPrivateKey(&'static str),
    #[error("certificate subject has no common name")]
    MissingCommonName,
    #[error("certificate subject {found:?} does not match node id {expected:?}")]
    SubjectMismatch { expected: String, found: String },
    #[error("certificate for {subject} is not trusted by the CA: {reason}")]
    Untrusted { subject: String, reason: String },
    #[error("certificate for {subject} lacks required subject alternative name {san}")]
    MissingSan { subject: String, san: String },
    #[error("CA certificate present but CA key {0} is missing; refusing to issue node certificate")]
    MissingCaKey(PathBuf),
    #[error("CA key present but CA certificate {0} is missing; refusing to replace the CA")]
    MissingCaCert(PathBuf),
}

/// A node's certificate and private key, PEM encoded.
#[derive(Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl NodeIdentity {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert_pem)
    }
}

/// A dev CA bundle: cert, key, and the rcgen objects needed to sign more certs.
pub struct DevCa {
    pub cert_pem: String,
    pub key_pem: String,
    key_pair: KeyPair,
    params: CertificateParams,
}

impl DevCa {
    /// Generate a new self-signed dev CA.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().context("generate CA key pair")?;
        let cert = params
            .clone()
            .self_signed(&key_pair)
            .context("self-sign CA cert")?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            key_pair,
            params,
        })
    }

    /// Load an existing CA from its certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let params = CertificateParams::from_ca_cert_pem(cert_pem).context("parse CA cert")?;
        let key_pair = KeyPair::from_pem(key_pem).context("parse CA key")?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            key_pair,
            params,
        })
    }

    /// Issue a node certificate signed by this CA with subject CN = `node_id`.
    pub fn generate_node_cert(&self, node_id: &str) -> Result<NodeIdentity> {
        let ca_cert = self
            .params
            .clone()
            .self_signed(&self.key_pair)
            .context("rebuild CA cert for signing")?;

        let mut sans = vec![node_id.to_string()];
        sans.extend(
            DEFAULT_SANS
                .iter()
                .filter(|s| **s != node_id)
                .map(|s| s.to_string()),
        );
        let mut params = CertificateParams::new(sans).context("create node cert params")?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_id);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params, NODE_VALIDITY_DAYS);

        let node_key = KeyPair::generate().context("generate node key pair")?;
        let node_cert = params
            .signed_by(&node_key, &ca_cert, &self.key_pair)
            .context("sign node cert")?;

        Ok(NodeIdentity {
            node_id: node_id.to_string(),
            cert_pem: node_cert.pem(),
            key_pem: node_key.serialize_pem(),
        })
    }
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(days);
}

/// Hex SHA-256 of the PEM text, for log lines.
pub fn fingerprint(cert_pem: &str) -> String {
    hex::encode(Sha256::digest(cert_pem.as_bytes()))
}

/// Subject common name of a DER certificate.
pub fn common_name_from_der(der: &CertificateDer<'_>) -> Result<String> {
    let params = CertificateParams::from_ca_cert_der(der).context("parse certificate")?;
    let value = params
        .distinguished_name
        .get(&DnType::CommonName)
        .ok_or(IdentityError::MissingCommonName)?;
    let name = match value {
        DnValue::Utf8String(s) => s.clone(),
        DnValue::PrintableString(s) => s.as_str().to_string(),
        DnValue::Ia5String(s) => s.as_str().to_string(),
        _ => return Err(IdentityError::MissingCommonName.into()),
    };
    if name.is_empty() {
        return Err(IdentityError::MissingCommonName.into());
    }
    Ok(name)
}

/// Subject common name of the first certificate in a PEM bundle.
pub fn common_name(cert_pem: &str) -> Result<String> {
    let certs = parse_certs(cert_pem, "certificate")?;
    common_name_from_der(&certs[0])
}

/// DNS and IP subject alternative names of the first certificate in a PEM bundle.
pub fn subject_alt_names(cert_pem: &str) -> Result<Vec<String>> {
    let certs = parse_certs(cert_pem, "certificate")?;
    let params = CertificateParams::from_ca_cert_der(&certs[0]).context("parse certificate")?;
    Ok(params
        .subject_alt_names
        .iter()
        .filter_map(|san| match san {
            SanType::DnsName(name) => Some(name.as_str().to_string()),
            SanType::IpAddress(ip) => Some(ip.to_string()),
            _ => None,
        })
        .collect())
}

/// Immutable mTLS material for one node, shared by every connection it makes or accepts.
pub struct TransportIdentity {
    node_id: String,
    cert_pem: String,
    ca_cert_pem: String,
    server_config: Arc<rustls::ServerConfig>,
    client_config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TransportIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportIdentity")
            .field("node_id", &self.node_id)
            .field("fingerprint", &fingerprint(&self.cert_pem))
            .finish_non_exhaustive()
    }
}

impl TransportIdentity {
    /// Validate `identity` against the CA and build both TLS configs.
    ///
    /// The node id is taken from the certificate subject, never from the caller.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        ca_cert_pem: &str,
        required_sans: &[String],
    ) -> Result<Self> {
        let node_id = common_name(cert_pem)?;
        verify_node_cert(&node_id, cert_pem, ca_cert_pem, required_sans)?;

        let server_config = build_server_config(cert_pem, key_pem, ca_cert_pem)
            .context("build server TLS config")?;
        let client_config = build_client_config(cert_pem, key_pem, ca_cert_pem)
            .context("build client TLS config")?;

        Ok(Self {
            node_id,
            cert_pem: cert_pem.to_string(),
            ca_cert_pem: ca_cert_pem.to_string(),
            server_config: Arc::new(server_config),
            client_config: Arc::new(client_config),
        })
    }

    pub fn from_identity(
        identity: &NodeIdentity,
        ca_cert_pem: &str,
        required_sans: &[String],
    ) -> Result<Self> {
        let this = Self::from_pem(
            &identity.cert_pem,
            &identity.key_pem,
            ca_cert_pem,
            required_sans,
        )?;
        if this.node_id != identity.node_id {
            return Err(IdentityError::SubjectMismatch {
                expected: identity.node_id.clone(),
                found: this.node_id,
            }
            .into());
        }
        Ok(this)
    }

    /// Canonical name: the certificate subject CN.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Requires and verifies client certificates; TLS 1.3 only.
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        self.server_config.clone()
    }

    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.client_config.clone()
    }

    /// Name the server certificate must carry when dialling `peer_id`.
    pub fn server_name_for(&self, peer_id: &str) -> Result<ServerName<'static>> {
        ServerName::try_from(peer_id.to_string())
            .map_err(|e| anyhow::anyhow!("invalid peer name {peer_id:?}: {e}"))
    }
}

/// Check that `cert_pem` chains to `ca_cert_pem` and carries every required SAN.
pub fn verify_node_cert(
    subject: &str,
    cert_pem: &str,
    ca_cert_pem: &str,
    required_sans: &[String],
) -> Result<()> {
    ensure_crypto_provider();
    let certs = parse_certs(cert_pem, "node certificate")?;
    let roots = root_store(ca_cert_pem)?;
    let verifier = rustls::server::WebPkiClientVerifier::builder(roots.into())
        .build()
        .context("build certificate verifier")?;
    verifier
        .verify_client_cert(&certs[0], &certs[1..], UnixTime::now())
        .map_err(|e| IdentityError::Untrusted {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

    if !required_sans.is_empty() {
        let present = subject_alt_names(cert_pem)?;
        if let Some(missing) = required_sans.iter().find(|san| !present.contains(san)) {
            return Err(IdentityError::MissingSan {
                subject: subject.to_string(),
                san: missing.clone(),
            }
            .into());
        }
    }
    Ok(())
}

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn parse_certs(pem: &str, what: &'static str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parse {what}"))?;
    if certs.is_empty() {
        return Err(IdentityError::NoCertificate(what).into());
    }
    Ok(certs)
}

fn parse_key(pem: &str, what: &'static str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .with_context(|| format!("parse {what}"))?
        .ok_or_else(|| IdentityError::NoPrivateKey(what).into())
}

fn root_store(ca_cert_pem: &str) -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in parse_certs(ca_cert_pem, "CA certificate")? {
        root_store.add(cert).context("add CA to root store")?;
    }
    Ok(root_store)
}

/// Build a rustls ServerConfig for mTLS.
pub fn build_server_config(
    cert_pem: &str,
    key_pem: &str,
    ca_cert_pem: &str,
) -> Result<rustls::ServerConfig> {
    ensure_crypto_provider();
    let certs = parse_certs(cert_pem, "server certificate")?;
    let key = parse_key(key_pem, "server key")?;

    let client_verifier = rustls::server::WebPkiClientVerifier::builder(root_store(ca_cert_pem)?.into())
        .build()
        .context("build client verifier")?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .context("build server config")?;

    Ok(config)
}

/// Build a rustls ClientConfig for mTLS.
pub fn build_client_config(
    cert_pem: &str,
    key_pem: &str,
    ca_cert_pem: &str,
) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();
    let certs = parse_certs(cert_pem, "client certificate")?;
    let key = parse_key(key_pem, "client key")?;

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(root_store(ca_cert_pem)?)
        .with_client_auth_cert(certs, key)
        .context("build client config")?;

    Ok(config)
}
