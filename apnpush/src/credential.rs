//! Push certificates: what they are good for, and loading them.
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use openssl::asn1::Asn1Time;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::{X509Ref, X509};

use apnpush_common::errors::{ApnsErrorKind, Result};

use crate::environment::{Environment, EnvironmentCapability};
use crate::store::CertificateStore;

/// The kind of push certificate, read off the certificate's subject
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CertificateClass {
    None,
    IosDevelopment,
    IosProduction,
    MacDevelopment,
    MacProduction,
    Simplified,
    WebProduction,
    VoipServices,
    WatchKitServices,
    Passes,
    Unknown,
}

/// Subject prefixes in match order. The first hit wins.
const CLASS_PREFIXES: &[(&str, CertificateClass)] = &[
    (
        "Apple Development IOS Push Services: ",
        CertificateClass::IosDevelopment,
    ),
    (
        "Apple Production IOS Push Services: ",
        CertificateClass::IosProduction,
    ),
    (
        "Apple Development Mac Push Services: ",
        CertificateClass::MacDevelopment,
    ),
    (
        "Apple Production Mac Push Services: ",
        CertificateClass::MacProduction,
    ),
    ("Apple Push Services: ", CertificateClass::Simplified),
    ("Website Push ID: ", CertificateClass::WebProduction),
    ("VoIP Services: ", CertificateClass::VoipServices),
    ("WatchKit Services: ", CertificateClass::WatchKitServices),
    ("Pass Type ID: ", CertificateClass::Passes),
];

impl CertificateClass {
    /// Split a subject summary into its class and display name
    pub fn classify(summary: &str) -> (CertificateClass, &str) {
        if summary.is_empty() {
            return (CertificateClass::None, summary);
        }
        CLASS_PREFIXES
            .iter()
            .find_map(|(prefix, class)| summary.strip_prefix(prefix).map(|name| (*class, name)))
            .unwrap_or((CertificateClass::Unknown, summary))
    }

    pub fn environment_capability(self) -> EnvironmentCapability {
        match self {
            CertificateClass::IosDevelopment | CertificateClass::MacDevelopment => {
                EnvironmentCapability::SandboxOnly
            }
            CertificateClass::IosProduction | CertificateClass::MacProduction => {
                EnvironmentCapability::ProductionOnly
            }
            CertificateClass::Simplified
            | CertificateClass::WebProduction
            | CertificateClass::VoipServices
            | CertificateClass::WatchKitServices
            | CertificateClass::Passes => EnvironmentCapability::Either,
            CertificateClass::None | CertificateClass::Unknown => EnvironmentCapability::None,
        }
    }

    pub fn is_push_capable(self) -> bool {
        !matches!(self, CertificateClass::None | CertificateClass::Unknown)
    }
}

impl fmt::Display for CertificateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CertificateClass::None => "none",
            CertificateClass::IosDevelopment | CertificateClass::IosProduction => "iOS",
            CertificateClass::MacDevelopment | CertificateClass::MacProduction => "macOS",
            CertificateClass::Simplified => "All",
            CertificateClass::WebProduction => "Website",
            CertificateClass::VoipServices => "VoIP",
            CertificateClass::WatchKitServices => "WatchKit",
            CertificateClass::Passes => "Pass",
            CertificateClass::Unknown => "unknown",
        })
    }
}

/// A client certificate, optionally with its private key and intermediates.
///
/// Only a credential with a key can be used to connect.
#[derive(Clone)]
pub struct Credential {
    certificate: X509,
    private_key: Option<PKey<Private>>,
    chain: Vec<X509>,
}

/// What [Credential::inspect] found
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialReport {
    pub subject_summary: String,
    pub has_key: bool,
    pub key_bits: Option<u32>,
    pub der_len: usize,
}

impl Credential {
    pub fn new(certificate: X509) -> Self {
        Self {
            certificate,
            private_key: None,
            chain: vec![],
        }
    }

    pub fn with_private_key(mut self, private_key: PKey<Private>) -> Self {
        self.private_key = Some(private_key);
        self
    }

    pub fn with_chain(mut self, chain: Vec<X509>) -> Self {
        self.chain = chain;
        self
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    pub fn private_key(&self) -> Result<&PKeyRef<Private>> {
        self.private_key
            .as_deref()
            .ok_or_else(|| ApnsErrorKind::IdentityCopyPrivateKey.into())
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// The subject's common name, or its first entry when there is none
    pub fn subject_summary(&self) -> String {
        let name = self.certificate.subject_name();
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .or_else(|| name.entries().next())
            .and_then(|entry| std::str::from_utf8(entry.data().as_slice()).ok())
            .map(str::to_owned)
            .unwrap_or_default()
    }

    pub fn certificate_class(&self) -> CertificateClass {
        CertificateClass::classify(&self.subject_summary()).0
    }

    /// The summary with its class prefix stripped, usually the bundle id
    pub fn display_name(&self) -> String {
        let summary = self.subject_summary();
        CertificateClass::classify(&summary).1.to_owned()
    }

    pub fn environment_capability(&self) -> EnvironmentCapability {
        self.certificate_class().environment_capability()
    }

    pub fn is_push_capable(&self) -> bool {
        self.certificate_class().is_push_capable()
    }

    /// When the certificate stops being valid
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        let epoch = Asn1Time::from_unix(0).ok()?;
        let diff = epoch.diff(self.certificate.not_after()).ok()?;
        let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
        Utc.timestamp_opt(secs, 0).single()
    }

    /// Key under which token lists for this certificate are kept:
    /// `"<name>"` for production, `"<name>-sandbox"` for sandbox.
    pub fn config_key(&self, environment: Environment) -> String {
        match environment {
            Environment::Sandbox => format!("{}-sandbox", self.display_name()),
            _ => self.display_name(),
        }
    }

    pub fn inspect(&self) -> CredentialReport {
        CredentialReport {
            subject_summary: self.subject_summary(),
            has_key: self.private_key.is_some(),
            key_bits: self.private_key.as_ref().map(|key| key.bits()),
            der_len: self.certificate.to_der().map(|der| der.len()).unwrap_or(0),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.subject_summary())
            .field("has_key", &self.private_key.is_some())
            .field("chain", &self.chain.len())
            .finish()
    }
}

pub fn certificate_class(credential: &Credential) -> CertificateClass {
    credential.certificate_class()
}

pub fn environment_capability(class: CertificateClass) -> EnvironmentCapability {
    class.environment_capability()
}

pub fn is_push_capable(credential: &Credential) -> bool {
    credential.is_push_capable()
}

/// Pick the concrete environment to connect to.
///
/// `Auto` follows what the certificate supports. A certificate that is not
/// a push certificate is refused outright.
pub fn resolve_environment(
    credential: &Credential,
    requested: Environment,
) -> Result<Environment> {
    let capability = credential.environment_capability();
    match capability.resolve(requested) {
        environment @ (Environment::Sandbox | Environment::Production)
            if capability != EnvironmentCapability::None =>
        {
            if !capability.supports(environment) {
                warn!(
                    "Certificate supports {}, connecting to {} anyway",
                    capability, environment
                );
            }
            Ok(environment)
        }
        _ => Err(ApnsErrorKind::CertificateNotPushCapable(credential.subject_summary()).into()),
    }
}

/// All push capable identities in a PKCS#12 bundle, each with its key
pub fn load_from_pkcs12(
    store: &dyn CertificateStore,
    data: &[u8],
    password: &str,
) -> Result<Vec<Credential>> {
    if data.is_empty() {
        return Err(ApnsErrorKind::Pkcs12EmptyData.into());
    }
    let mut credentials = vec![];
    for identity in store.import_pkcs12(data, password)? {
        let credential = store.certificate_for_identity(&identity)?;
        if !credential.is_push_capable() {
            debug!("Skipping non push certificate: {}", credential.subject_summary());
            continue;
        }
        let key = store.private_key_for_identity(&identity)?;
        credentials.push(
            credential
                .with_private_key(key)
                .with_chain(identity.chain().to_vec()),
        );
    }
    Ok(credentials)
}

/// The one push capable identity in a PKCS#12 bundle
pub fn load_single_from_pkcs12(
    store: &dyn CertificateStore,
    data: &[u8],
    password: &str,
) -> Result<Credential> {
    let mut credentials = load_from_pkcs12(store, data, password)?;
    match credentials.len() {
        0 => Err(ApnsErrorKind::Pkcs12NoItems.into()),
        1 => Ok(credentials.remove(0)),
        _ => Err(ApnsErrorKind::Pkcs12MultipleItems.into()),
    }
}

/// The store's push certificates, sorted by summary
pub fn push_certificates(store: &dyn CertificateStore) -> Result<Vec<Credential>> {
    let mut certificates: Vec<Credential> = store
        .list_candidate_certificates()?
        .into_iter()
        .filter(Credential::is_push_capable)
        .collect();
    certificates.sort_by_cached_key(Credential::subject_summary);
    Ok(certificates)
}
