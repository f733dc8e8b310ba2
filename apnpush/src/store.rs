//! Where certificates and keys come from.
//!
//! [CertificateStore] is the seam between the credential resolver and the
//! platform's certificate storage. [OpensslStore] keeps identities in
//! memory, loaded from PEM files or imported from PKCS#12 bundles.
use std::fmt;
use std::fs;
use std::path::Path;

use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use apnpush_common::errors::{ApnsErrorKind, Result};

use crate::credential::Credential;

/// A certificate together with the private key that belongs to it
#[derive(Clone, Default)]
pub struct Identity {
    certificate: Option<X509>,
    private_key: Option<PKey<Private>>,
    chain: Vec<X509>,
}

impl Identity {
    pub fn new(certificate: Option<X509>, private_key: Option<PKey<Private>>) -> Self {
        Self {
            certificate,
            private_key,
            chain: vec![],
        }
    }

    pub fn with_chain(mut self, chain: Vec<X509>) -> Self {
        self.chain = chain;
        self
    }

    /// Intermediates shipped alongside the certificate
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("has_certificate", &self.certificate.is_some())
            .field("has_key", &self.private_key.is_some())
            .field("chain", &self.chain.len())
            .finish()
    }
}

pub trait CertificateStore {
    /// Every certificate in the store, push capable or not
    fn list_candidate_certificates(&self) -> Result<Vec<Credential>>;

    /// The identity's certificate, without its key
    fn certificate_for_identity(&self, identity: &Identity) -> Result<Credential>;

    fn private_key_for_identity(&self, identity: &Identity) -> Result<PKey<Private>>;

    /// Decode a PKCS#12 bundle into its identities
    fn import_pkcs12(&self, data: &[u8], password: &str) -> Result<Vec<Identity>>;
}

#[derive(Clone, Default)]
pub struct OpensslStore {
    identities: Vec<Identity>,
}

impl OpensslStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: Vec<Identity>) -> Self {
        Self { identities }
    }

    /// Load every certificate and private key from the `.pem`, `.crt` and
    /// `.key` files of a directory. Keys are paired with the certificate
    /// whose public key they match; unpaired certificates are kept without one.
    pub fn from_pem_dir(dir: &Path) -> Result<Self> {
        let search_err = |e: std::io::Error| {
            ApnsErrorKind::KeychainCopyMatching(format!("{}: {e}", dir.display()))
        };
        let mut paths: Vec<_> = fs::read_dir(dir)
            .map_err(search_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("pem" | "crt" | "key")
                )
            })
            .collect();
        paths.sort();

        let mut certificates = vec![];
        let mut keys = vec![];
        for path in paths {
            let pem = fs::read(&path).map_err(search_err)?;
            match X509::stack_from_pem(&pem) {
                Ok(found) => certificates.extend(found),
                Err(e) => trace!("No certificates in {}: {e}", path.display()),
            }
            if let Ok(key) = PKey::private_key_from_pem(&pem) {
                keys.push(key);
            }
        }
        debug!(
            "Loaded {} certificates and {} keys from {}",
            certificates.len(),
            keys.len(),
            dir.display()
        );

        let identities = certificates
            .into_iter()
            .map(|certificate| {
                let key = keys.iter().find(|key| matches_key(&certificate, key)).cloned();
                Identity::new(Some(certificate), key)
            })
            .collect();
        Ok(Self { identities })
    }

    /// Find the stored identity for a certificate
    pub fn identity_for_certificate(&self, credential: &Credential) -> Result<Identity> {
        let wanted = credential
            .certificate()
            .to_der()
            .map_err(|e| ApnsErrorKind::KeychainCopyMatching(e.to_string()))?;
        let identity = self
            .identities
            .iter()
            .find(|identity| {
                identity
                    .certificate
                    .as_ref()
                    .and_then(|cert| cert.to_der().ok())
                    .map_or(false, |der| der == wanted)
            })
            .ok_or(ApnsErrorKind::KeychainCreateIdentity)?;
        if identity.private_key.is_none() {
            return Err(ApnsErrorKind::KeychainItemNotFound.into());
        }
        Ok(identity.clone())
    }
}

fn matches_key(certificate: &X509, key: &PKey<Private>) -> bool {
    certificate
        .public_key()
        .map_or(false, |public| public.public_eq(key))
}

/// Map a failed PKCS#12 parse onto its kind from the OpenSSL reasons
fn pkcs12_error_kind(reasons: &str, password: &str) -> ApnsErrorKind {
    let reasons = reasons.to_ascii_lowercase();
    if reasons.contains("mac verify failure") || reasons.contains("mac verify error") {
        if password.is_empty() {
            ApnsErrorKind::Pkcs12PasswordRequired
        } else {
            ApnsErrorKind::Pkcs12Password
        }
    } else if reasons.contains("decrypt") || reasons.contains("pbe") {
        ApnsErrorKind::Pkcs12AuthFailed
    } else {
        ApnsErrorKind::Pkcs12Import(reasons)
    }
}

impl CertificateStore for OpensslStore {
    fn list_candidate_certificates(&self) -> Result<Vec<Credential>> {
        Ok(self
            .identities
            .iter()
            .filter_map(|identity| identity.certificate.clone())
            .map(Credential::new)
            .collect())
    }

    fn certificate_for_identity(&self, identity: &Identity) -> Result<Credential> {
        identity
            .certificate
            .clone()
            .map(Credential::new)
            .ok_or_else(|| ApnsErrorKind::IdentityCopyCertificate.into())
    }

    fn private_key_for_identity(&self, identity: &Identity) -> Result<PKey<Private>> {
        identity
            .private_key
            .clone()
            .ok_or_else(|| ApnsErrorKind::IdentityCopyPrivateKey.into())
    }

    fn import_pkcs12(&self, data: &[u8], password: &str) -> Result<Vec<Identity>> {
        let pkcs12 =
            Pkcs12::from_der(data).map_err(|e| ApnsErrorKind::Pkcs12Decode(e.to_string()))?;
        let parsed = pkcs12.parse2(password).map_err(|e| {
            let reasons: Vec<&str> = e.errors().iter().filter_map(|e| e.reason()).collect();
            pkcs12_error_kind(&reasons.join(", "), password)
        })?;
        if parsed.cert.is_none() && parsed.pkey.is_none() {
            return Ok(vec![]);
        }
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();
        Ok(vec![Identity::new(parsed.cert, parsed.pkey).with_chain(chain)])
    }
}
