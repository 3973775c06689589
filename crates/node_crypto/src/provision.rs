//! Identity provisioning from a certificate directory or external material.
//!
//! Directory layout:
//!
//! ```text
//! ca-cert.pem  ca-key.pem  <node_id>-cert.pem  <node_id>-key.pem
//! ```
//!
//! Key files are written owner read/write only.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{common_name, DevCa, IdentityError, NodeIdentity, TransportIdentity};

pub const CA_CERT_FILE: &str = "ca-cert.pem";
pub const CA_KEY_FILE: &str = "ca-key.pem";

pub fn node_cert_file(node_id: &str) -> String {
    format!("{node_id}-cert.pem")
}

pub fn node_key_file(node_id: &str) -> String {
    format!("{node_id}-key.pem")
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    /// SANs the node certificate must carry. Empty disables the check.
    pub required_sans: Vec<String>,
}

/// Load the node identity from `cert_dir`, generating whatever is missing.
///
/// A CA is created only when neither `ca-cert.pem` nor `ca-key.pem` exists.
pub fn load_or_generate(
    node_id: &str,
    cert_dir: &Path,
    options: &ProvisionOptions,
) -> Result<TransportIdentity> {
    let ca_cert_path = cert_dir.join(CA_CERT_FILE);
    let cert_path = cert_dir.join(node_cert_file(node_id));
    let key_path = cert_dir.join(node_key_file(node_id));

    if cert_path.exists() && key_path.exists() && ca_cert_path.exists() {
        let material = ExternalMaterial::from_files(&cert_path, &key_path, &ca_cert_path)?;
        let subject = common_name(&material.cert_pem)?;
        if subject != node_id {
            return Err(IdentityError::SubjectMismatch {
                expected: node_id.to_string(),
                found: subject,
            }
            .into());
        }
        let identity = load_external(&material, options)?;
        info!(
            "loaded identity {} from {}",
            identity.node_id(),
            cert_dir.display()
        );
        return Ok(identity);
    }

    if cert_path.exists() != key_path.exists() {
        warn!(
            "incomplete node certificate for {node_id} in {}; issuing a new one",
            cert_dir.display()
        );
    }

    fs::create_dir_all(cert_dir)
        .with_context(|| format!("create cert dir {}", cert_dir.display()))?;
    let ca = load_or_create_ca(cert_dir)?;
    let identity = ca
        .generate_node_cert(node_id)
        .context("issue node certificate")?;
    write_identity(&identity, cert_dir)?;
    info!(
        "issued certificate for {node_id} (fingerprint {})",
        &identity.fingerprint()[..16]
    );

    TransportIdentity::from_identity(&identity, &ca.cert_pem, &options.required_sans)
}

fn load_or_create_ca(cert_dir: &Path) -> Result<DevCa> {
    let cert_path = cert_dir.join(CA_CERT_FILE);
    let key_path = cert_dir.join(CA_KEY_FILE);

    match (cert_path.exists(), key_path.exists()) {
        (true, true) => {
            let cert_pem = read_pem(&cert_path)?;
            let key_pem = read_pem(&key_path)?;
            DevCa::from_pem(&cert_pem, &key_pem)
        }
        (true, false) => Err(IdentityError::MissingCaKey(key_path).into()),
        (false, true) => Err(IdentityError::MissingCaCert(cert_path).into()),
        (false, false) => {
            let ca = DevCa::generate().context("generate dev CA")?;
            write_public(&cert_path, &ca.cert_pem)?;
            write_private(&key_path, &ca.key_pem)?;
            warn!(
                "generated a development CA in {}; do not use it across trust domains",
                cert_dir.display()
            );
            Ok(ca)
        }
    }
}

/// Certificate material supplied from outside: files, or PEM text the caller
/// sourced from its environment.
#[derive(Clone)]
pub struct ExternalMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_cert_pem: String,
}

impl ExternalMaterial {
    pub fn from_files(cert: &Path, key: &Path, ca_cert: &Path) -> Result<Self> {
        Ok(Self {
            cert_pem: read_pem(cert)?,
            key_pem: read_pem(key)?,
            ca_cert_pem: read_pem(ca_cert)?,
        })
    }
}

/// Validate externally supplied material. Never generates a CA.
pub fn load_external(
    material: &ExternalMaterial,
    options: &ProvisionOptions,
) -> Result<TransportIdentity> {
    TransportIdentity::from_pem(
        &material.cert_pem,
        &material.key_pem,
        &material.ca_cert_pem,
        &options.required_sans,
    )
}

/// Write cert and key to `<node_id>-cert.pem` / `<node_id>-key.pem` in `dir`.
pub fn write_identity(identity: &NodeIdentity, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)?;
    let cert_path = dir.join(node_cert_file(&identity.node_id));
    let key_path = dir.join(node_key_file(&identity.node_id));
    write_public(&cert_path, &identity.cert_pem)?;
    write_private(&key_path, &identity.key_pem)?;
    Ok((cert_path, key_path))
}

fn read_pem(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn write_public(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", path.display()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    let mut file =
        fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", path.display()))
}
