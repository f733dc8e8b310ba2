//! Error handling for apnpush
//!
//! Every failure surfaced by the push transport is an [ApnsError]: a typed
//! [ApnsErrorKind] plus the backtrace captured where it was raised. Kinds that
//! wrap a lower level failure (an OS error, an OpenSSL error stack) carry its
//! text as a reason string so that errors stay `Clone` and can be handed to
//! an observer as well as returned to the caller.

use std::fmt::{self, Display};

use backtrace::Backtrace;
use thiserror::Error;

/// apnpush error, a kind plus where it happened
#[derive(Debug, Clone)]
pub struct ApnsError {
    pub kind: ApnsErrorKind,
    pub backtrace: Box<Backtrace>,
}

impl ApnsError {
    /// The APNs status byte, if this error came from a gateway error response
    pub fn apn_status(&self) -> Option<u8> {
        self.kind.apn_status()
    }
}

// Print out the error and backtrace, including source errors
impl Display for ApnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}\nBacktrace: \n{:?}", self.kind, self.backtrace)?;

        // Go down the chain of errors
        let mut error: &dyn std::error::Error = &self.kind;
        while let Some(source) = error.source() {
            write!(f, "\n\nCaused by: {source}")?;
            error = source;
        }

        Ok(())
    }
}

impl std::error::Error for ApnsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

// Forward From impls to ApnsError from ApnsErrorKind. Because From is reflexive,
// this impl also takes care of From<ApnsErrorKind>.
impl<T> From<T> for ApnsError
where
    ApnsErrorKind: From<T>,
{
    fn from(item: T) -> Self {
        ApnsError {
            kind: ApnsErrorKind::from(item),
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApnsErrorKind {
    // Socket
    #[error("Socket cannot be created ({0})")]
    SocketCreate(String),
    #[error("Socket connecting failed ({0})")]
    SocketConnect(String),
    #[error("Socket host cannot be resolved ({0})")]
    SocketResolveHostName(String),
    #[error("Socket file control failed ({0})")]
    SocketFileControl(String),
    #[error("Socket options cannot be set ({0})")]
    SocketOptions(String),

    // TLS setup
    #[error("SSL context cannot be created ({0})")]
    SslContext(String),
    #[error("SSL callbacks cannot be set ({0})")]
    SslIOFuncs(String),
    #[error("SSL connection cannot be set ({0})")]
    SslConnection(String),
    #[error("SSL peer domain name cannot be set ({0})")]
    SslPeerDomainName(String),
    #[error("SSL certificate cannot be set ({0})")]
    SslCertificate(String),

    // TLS handshake
    #[error("SSL handshake timeout")]
    SslHandshakeTimeout,
    #[error("SSL handshake dropped by server ({0})")]
    SslDroppedByServer(String),
    #[error("SSL handshake authentication failed ({0})")]
    SslAuthFailed(String),
    #[error("SSL handshake root not a known anchor ({0})")]
    SslHandshakeUnknownRootCert(String),
    #[error("SSL handshake chain not verifiable to root ({0})")]
    SslHandshakeNoRootCert(String),
    #[error("SSL handshake expired certificates ({0})")]
    SslHandshakeCertExpired(String),
    #[error("SSL handshake invalid certificate chain ({0})")]
    SslHandshakeXCertChainInvalid(String),
    #[error("SSL handshake expecting client cert ({0})")]
    SslHandshakeClientCertRequested(String),
    #[error("SSL handshake auth interrupted")]
    SslHandshakeServerAuthCompleted,
    #[error("SSL handshake certificate expired ({0})")]
    SslHandshakePeerCertExpired(String),
    #[error("SSL handshake certificate revoked ({0})")]
    SslHandshakePeerCertRevoked(String),
    #[error("SSL handshake certificate unknown ({0})")]
    SslHandshakePeerCertUnknown(String),
    #[error("SSL handshake internal error ({0})")]
    SslHandshakeInternalError(String),
    #[error("SSL handshake in dark wake")]
    SslInDarkWake,
    #[error("SSL handshake connection closed via error ({0})")]
    SslHandshakeClosedAbort(String),
    #[error("SSL handshake failed ({0})")]
    SslHandshakeFail(String),

    // I/O
    #[error("Read connection dropped by server ({0})")]
    ReadDroppedByServer(String),
    #[error("Read connection error ({0})")]
    ReadClosedAbort(String),
    #[error("Read connection closed")]
    ReadClosedGraceful,
    #[error("Read failed ({0})")]
    ReadFail(String),
    #[error("Write connection dropped by server ({0})")]
    WriteDroppedByServer(String),
    #[error("Write connection error ({0})")]
    WriteClosedAbort(String),
    #[error("Write connection closed")]
    WriteClosedGraceful,
    #[error("Write failed ({0})")]
    WriteFail(String),

    // Protocol
    #[error("Push response command unknown ({0})")]
    PushResponseCommand(u8),
    #[error("Push not fully sent ({written} of {expected} bytes)")]
    PushWriteFail { written: usize, expected: usize },
    #[error("Push reconnect requires connection")]
    PushNotConnected,
    #[error("Feedback data length unexpected ({read} of {expected} bytes)")]
    FeedbackLength { read: usize, expected: usize },
    #[error("Feedback token length unexpected ({0})")]
    FeedbackTokenLength(u16),

    // APNs status codes
    #[error("APN processing error")]
    ApnProcessing,
    #[error("APN missing device token")]
    ApnMissingDeviceToken,
    #[error("APN missing topic")]
    ApnMissingTopic,
    #[error("APN missing payload")]
    ApnMissingPayload,
    #[error("APN invalid token size")]
    ApnInvalidTokenSize,
    #[error("APN invalid topic size")]
    ApnInvalidTopicSize,
    #[error("APN invalid payload size")]
    ApnInvalidPayloadSize,
    #[error("APN invalid token")]
    ApnInvalidTokenContent,
    #[error("APN shutdown")]
    ApnShutdown,
    #[error("APN unknown error code ({0})")]
    ApnUnknownErrorCode(u8),

    // Credential / identity
    #[error("Identity does not contain certificate")]
    IdentityCopyCertificate,
    #[error("Identity does not contain private key")]
    IdentityCopyPrivateKey,
    #[error("PKCS12 data cannot be imported ({0})")]
    Pkcs12Import(String),
    #[error("PKCS12 data is empty")]
    Pkcs12EmptyData,
    #[error("PKCS12 data cannot be read or is malformed ({0})")]
    Pkcs12Decode(String),
    #[error("PKCS12 data password incorrect")]
    Pkcs12AuthFailed,
    #[error("PKCS12 data wrong password")]
    Pkcs12Password,
    #[error("PKCS12 data password required")]
    Pkcs12PasswordRequired,
    #[error("PKCS12 data contains no identities")]
    Pkcs12NoItems,
    #[error("PKCS12 data contains multiple identities")]
    Pkcs12MultipleItems,
    #[error("Keychain cannot be searched ({0})")]
    KeychainCopyMatching(String),
    #[error("Keychain does not contain private key")]
    KeychainItemNotFound,
    #[error("Keychain does not contain certificate")]
    KeychainCreateIdentity,
    #[error("Certificate is not a push certificate ({0})")]
    CertificateNotPushCapable(String),
}

impl ApnsErrorKind {
    /// Map the status byte of a gateway error response onto its kind
    pub fn from_apn_status(status: u8) -> Self {
        match status {
            1 => Self::ApnProcessing,
            2 => Self::ApnMissingDeviceToken,
            3 => Self::ApnMissingTopic,
            4 => Self::ApnMissingPayload,
            5 => Self::ApnInvalidTokenSize,
            6 => Self::ApnInvalidTopicSize,
            7 => Self::ApnInvalidPayloadSize,
            8 => Self::ApnInvalidTokenContent,
            10 => Self::ApnShutdown,
            other => Self::ApnUnknownErrorCode(other),
        }
    }

    /// The gateway status byte this kind was decoded from
    pub fn apn_status(&self) -> Option<u8> {
        match self {
            Self::ApnProcessing => Some(1),
            Self::ApnMissingDeviceToken => Some(2),
            Self::ApnMissingTopic => Some(3),
            Self::ApnMissingPayload => Some(4),
            Self::ApnInvalidTokenSize => Some(5),
            Self::ApnInvalidTopicSize => Some(6),
            Self::ApnInvalidPayloadSize => Some(7),
            Self::ApnInvalidTokenContent => Some(8),
            Self::ApnShutdown => Some(10),
            Self::ApnUnknownErrorCode(status) => Some(*status),
            _ => None,
        }
    }

    /// Did the peer go away (as opposed to rejecting what we sent)?
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::ReadDroppedByServer(_)
                | Self::ReadClosedAbort(_)
                | Self::ReadClosedGraceful
                | Self::WriteDroppedByServer(_)
                | Self::WriteClosedAbort(_)
                | Self::WriteClosedGraceful
                | Self::PushNotConnected
        )
    }
}

/// Errors that can be reported to sentry
pub trait ReportableError: std::error::Error {
    /// Like [std::error::Error::source] but returns [ReportableError]s
    fn reportable_source(&self) -> Option<&(dyn ReportableError + 'static)> {
        None
    }

    /// Return a `Backtrace` for this Error if one was captured
    fn backtrace(&self) -> Option<&Backtrace>;

    /// Whether this error is reported to Sentry
    fn is_sentry_event(&self) -> bool;

    /// Experimental: return key value pairs for Sentry Event's extra data
    fn extras(&self) -> Vec<(&str, String)> {
        vec![]
    }
}

impl ReportableError for ApnsError {
    fn backtrace(&self) -> Option<&Backtrace> {
        Some(&self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        // Gateway rejections and closed connections are the remote end doing
        // its job; only local setup failures are worth an event.
        !(self.kind.apn_status().is_some()
            || self.kind.is_connection_lost()
            || matches!(
                self.kind,
                ApnsErrorKind::SslHandshakeTimeout
                    | ApnsErrorKind::SocketConnect(_)
                    | ApnsErrorKind::SocketResolveHostName(_)
                    | ApnsErrorKind::Pkcs12Password
                    | ApnsErrorKind::Pkcs12PasswordRequired
                    | ApnsErrorKind::Pkcs12AuthFailed
            ))
    }

    fn extras(&self) -> Vec<(&str, String)> {
        match self.kind.apn_status() {
            Some(status) => vec![("apn_status", status.to_string())],
            None => vec![],
        }
    }
}

pub type Result<T> = std::result::Result<T, ApnsError>;
