//! Root certificate for the interception proxy.
//!
//! Browsers routed through the proxy must trust this root so that vendor
//! hosts can be intercepted. Leaf certificates are minted per host by
//! hudsucker's `RcgenAuthority` from the key and certificate kept here.

use crate::error::ShimError;
use crate::Result;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::info;

const CERT_FILE: &str = "bom-shim-ca.pem";
const KEY_FILE: &str = "bom-shim-ca.key";
const VALIDITY_DAYS: i64 = 365 * 5;

pub struct CertificateAuthority {
    cert: Certificate,
    cert_path: PathBuf,
}

fn cert_error(action: &str, e: rcgen::Error) -> ShimError {
    ShimError::Certificate(format!("Failed to {}: {}", action, e))
}

fn root_params(key_pair: KeyPair) -> CertificateParams {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "BOM Shim Interception Root");
    dn.push(DnType::OrganizationName, "bom-shim");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_after = params.not_before + Duration::days(VALIDITY_DAYS);
    params.key_pair = Some(key_pair);
    params
}

impl CertificateAuthority {
    /// Load the root from `dir`, generating and persisting one on first use.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        let fresh_key = !key_path.exists();
        let key_pair = if !fresh_key {
            let key_pem = fs::read_to_string(&key_path)?;
            KeyPair::from_pem(&key_pem).map_err(|e| cert_error("parse root key", e))?
        } else {
            fs::create_dir_all(dir)?;
            let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
                .map_err(|e| cert_error("generate root key", e))?;
            fs::write(&key_path, key_pair.serialize_pem())?;
            info!("Generated new interception root key at {}", key_path.display());
            key_pair
        };

        // rcgen cannot sign with a parsed certificate, so the root is rebuilt
        // from the persisted key; the public key and subject stay the same.
        let cert = Certificate::from_params(root_params(key_pair))
            .map_err(|e| cert_error("build root certificate", e))?;

        // A new key invalidates any certificate left on disk.
        if fresh_key || !cert_path.exists() {
            let pem = cert
                .serialize_pem()
                .map_err(|e| cert_error("serialize root certificate", e))?;
            fs::write(&cert_path, pem)?;
            info!("Wrote interception root to {}", cert_path.display());
        }

        Ok(Self { cert, cert_path })
    }

    /// Where the PEM certificate users must trust lives.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn cert_pem(&self) -> Result<String> {
        self.cert
            .serialize_pem()
            .map_err(|e| cert_error("serialize root certificate", e))
    }

    pub fn cert_der(&self) -> Result<Vec<u8>> {
        self.cert
            .serialize_der()
            .map_err(|e| cert_error("serialize root certificate", e))
    }

    pub fn key_der(&self) -> Vec<u8> {
        self.cert.serialize_private_key_der()
    }
}
