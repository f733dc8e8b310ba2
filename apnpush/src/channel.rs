//! A TLS connection to one APNs host over a non-blocking TCP socket.
//!
//! The channel never blocks indefinitely: connecting and the handshake share
//! one wall clock budget, reads return whatever is buffered, and writes give
//! up after `write_timeout`. Every failure maps onto an [ApnsErrorKind].
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use openssl::ssl::{self, ErrorCode, Ssl, SslConnector, SslMethod, SslStream, SslVerifyMode};

use apnpush_common::errors::{ApnsErrorKind, Result};

use crate::credential::Credential;
use crate::settings::ApnsSettings;

const BACKOFF_START: Duration = Duration::from_millis(1);
const BACKOFF_MAX: Duration = Duration::from_millis(64);

/// EMFILE and ENFILE: out of descriptors, the socket never existed
const OUT_OF_DESCRIPTORS: [i32; 2] = [24, 23];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    SocketConnecting,
    TlsHandshaking,
    Connected,
}

#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub verify_peer: bool,
    pub ca_file: Option<PathBuf>,
}

impl From<&ApnsSettings> for ChannelOptions {
    fn from(settings: &ApnsSettings) -> Self {
        Self {
            handshake_timeout: settings.handshake_timeout,
            write_timeout: settings.write_timeout,
            verify_peer: settings.verify_peer,
            ca_file: settings.ca_file.clone(),
        }
    }
}

pub struct TlsChannel {
    host: String,
    port: u16,
    credential: Credential,
    options: ChannelOptions,
    state: ChannelState,
    stream: Option<SslStream<TcpStream>>,
}

impl TlsChannel {
    pub fn new(host: &str, port: u16, credential: Credential, options: ChannelOptions) -> Self {
        Self {
            host: host.to_owned(),
            port,
            credential,
            options,
            state: ChannelState::Disconnected,
            stream: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// (Re)establish the connection. An existing connection is dropped first;
    /// on failure nothing of the attempt is kept.
    pub fn connect(&mut self) -> Result<()> {
        self.disconnect();
        debug!("Connecting"; "host" => &self.host, "port" => self.port);
        match self.establish() {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ChannelState::Connected;
                info!("Connected"; "host" => &self.host, "port" => self.port);
                Ok(())
            }
            Err(e) => {
                warn!("Connection failed: {}", e.kind; "host" => &self.host);
                self.state = ChannelState::Disconnected;
                Err(e)
            }
        }
    }

    fn establish(&mut self) -> Result<SslStream<TcpStream>> {
        let deadline = Instant::now() + self.options.handshake_timeout;
        self.state = ChannelState::SocketConnecting;
        let socket = self.connect_socket(deadline)?;
        self.state = ChannelState::TlsHandshaking;
        let stream = self.tls_stream(socket)?;
        handshake(stream, deadline)
    }

    fn connect_socket(&self, deadline: Instant) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ApnsErrorKind::SocketResolveHostName(format!("{}: {e}", self.host)))?
            .collect();
        if addrs.is_empty() {
            return Err(ApnsErrorKind::SocketResolveHostName(format!(
                "{}: no addresses",
                self.host
            ))
            .into());
        }

        let mut last_err = None;
        let mut socket = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(s) => {
                    socket = Some(s);
                    break;
                }
                Err(e) => {
                    trace!("Connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        let socket = match (socket, last_err) {
            (Some(socket), _) => socket,
            (None, Some(e)) => return Err(connect_error(e).into()),
            (None, None) => return Err(ApnsErrorKind::SslHandshakeTimeout.into()),
        };

        socket
            .set_nonblocking(true)
            .map_err(|e| ApnsErrorKind::SocketFileControl(e.to_string()))?;
        // std writes with MSG_NOSIGNAL, so a dead peer is an error, not SIGPIPE
        socket
            .set_nodelay(true)
            .map_err(|e| ApnsErrorKind::SocketOptions(e.to_string()))?;
        Ok(socket)
    }

    fn tls_stream(&self, socket: TcpStream) -> Result<SslStream<TcpStream>> {
        let context_err = |e: openssl::error::ErrorStack| ApnsErrorKind::SslContext(e.to_string());
        let cert_err = |e: openssl::error::ErrorStack| ApnsErrorKind::SslCertificate(e.to_string());

        let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(context_err)?;
        if self.options.verify_peer {
            if let Some(ca_file) = &self.options.ca_file {
                builder.set_ca_file(ca_file).map_err(context_err)?;
            }
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }
        builder
            .set_certificate(self.credential.certificate())
            .map_err(cert_err)?;
        for cert in self.credential.chain() {
            builder
                .add_extra_chain_cert(cert.clone())
                .map_err(cert_err)?;
        }
        builder
            .set_private_key(self.credential.private_key()?)
            .map_err(cert_err)?;
        builder.check_private_key().map_err(cert_err)?;
        let connector = builder.build();

        let mut ssl = Ssl::new(connector.context())
            .map_err(|e| ApnsErrorKind::SslConnection(e.to_string()))?;
        let domain_err = |e: openssl::error::ErrorStack| {
            ApnsErrorKind::SslPeerDomainName(e.to_string())
        };
        ssl.set_hostname(&self.host).map_err(domain_err)?;
        if self.options.verify_peer {
            ssl.param_mut().set_host(&self.host).map_err(domain_err)?;
        }
        SslStream::new(ssl, socket)
            .map_err(|e| ApnsErrorKind::SslIOFuncs(e.to_string()).into())
    }

    /// Read whatever is available, up to `buf.len()` bytes. Returns 0 when
    /// nothing is buffered; a peer that went away is an error unless some
    /// bytes were already read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ApnsErrorKind::ReadFail("channel is not connected".to_owned()))?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut total = 0;
        while total < buf.len() {
            match stream.ssl_read(&mut buf[total..]) {
                Ok(0) => {
                    if total == 0 {
                        return Err(ApnsErrorKind::ReadClosedGraceful.into());
                    }
                    break;
                }
                Ok(n) => total += n,
                Err(e) if would_block(&e) => break,
                Err(e) => {
                    let kind = read_error(e);
                    if total == 0 {
                        return Err(kind.into());
                    }
                    debug!("Read stopped after {} bytes: {}", total, kind);
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Keep reading until `buf` is full or `timeout` passes. Returns the
    /// number of bytes read; a closed connection only errors when nothing
    /// arrived at all.
    pub fn read_within(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_START;
        let mut total = 0;
        while total < buf.len() {
            let n = match self.read(&mut buf[total..]) {
                Ok(n) => n,
                Err(e) if total > 0 => {
                    debug!("Read ended early: {}", e.kind);
                    break;
                }
                Err(e) => return Err(e),
            };
            total += n;
            if total == buf.len() || Instant::now() >= deadline {
                break;
            }
            if n == 0 {
                thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
        Ok(total)
    }

    /// Write all of `buf`, retrying a full transport until `write_timeout`.
    /// Returns how much was accepted, which is short only on timeout.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let write_timeout = self.options.write_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ApnsErrorKind::WriteFail("channel is not connected".to_owned()))?;
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + write_timeout;
        let mut backoff = BACKOFF_START;
        let mut total = 0;
        while total < buf.len() {
            match stream.ssl_write(&buf[total..]) {
                Ok(0) => return Err(ApnsErrorKind::WriteClosedGraceful.into()),
                Ok(n) => total += n,
                Err(e) if would_block(&e) => {
                    if Instant::now() >= deadline {
                        warn!("Write timed out after {} of {} bytes", total, buf.len());
                        break;
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Err(e) => return Err(write_error(e).into()),
            }
        }
        Ok(total)
    }

    /// Close the connection. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            // close_notify is best effort on a non-blocking socket
            if let Err(e) = stream.shutdown() {
                trace!("TLS shutdown: {e}");
            }
            if let Err(e) = stream.get_ref().shutdown(Shutdown::Both) {
                trace!("Socket shutdown: {e}");
            }
            debug!("Disconnected"; "host" => &self.host, "port" => self.port);
        }
        self.state = ChannelState::Disconnected;
    }
}

impl Drop for TlsChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn handshake(mut stream: SslStream<TcpStream>, deadline: Instant) -> Result<SslStream<TcpStream>> {
    let mut backoff = BACKOFF_START;
    loop {
        match stream.connect() {
            Ok(()) => return Ok(stream),
            Err(e) if would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(ApnsErrorKind::SslHandshakeTimeout.into());
                }
                thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
            Err(e) => {
                let verify = stream.ssl().verify_result();
                return Err(handshake_error(&e, verify.as_raw(), verify.error_string()).into());
            }
        }
    }
}

fn would_block(e: &ssl::Error) -> bool {
    e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE
}

fn connect_error(e: io::Error) -> ApnsErrorKind {
    match e.raw_os_error() {
        Some(code) if OUT_OF_DESCRIPTORS.contains(&code) => {
            ApnsErrorKind::SocketCreate(e.to_string())
        }
        _ => ApnsErrorKind::SocketConnect(e.to_string()),
    }
}

fn is_abort(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn read_error(e: ssl::Error) -> ApnsErrorKind {
    let detail = e.to_string();
    match e.code() {
        ErrorCode::ZERO_RETURN => ApnsErrorKind::ReadClosedGraceful,
        ErrorCode::SYSCALL => match e.io_error() {
            Some(io) if is_abort(io) => ApnsErrorKind::ReadClosedAbort(detail),
            _ => ApnsErrorKind::ReadDroppedByServer(detail),
        },
        _ => ApnsErrorKind::ReadFail(detail),
    }
}

fn write_error(e: ssl::Error) -> ApnsErrorKind {
    let detail = e.to_string();
    match e.code() {
        ErrorCode::ZERO_RETURN => ApnsErrorKind::WriteClosedGraceful,
        ErrorCode::SYSCALL => match e.io_error() {
            Some(io) if is_abort(io) => ApnsErrorKind::WriteClosedAbort(detail),
            _ => ApnsErrorKind::WriteDroppedByServer(detail),
        },
        _ => ApnsErrorKind::WriteFail(detail),
    }
}

/// Classify a failed handshake from the OpenSSL error and the peer
/// verification result (`verify_raw` is an `X509_V_ERR_*` code, 0 for ok).
fn handshake_error(e: &ssl::Error, verify_raw: i32, verify_detail: &str) -> ApnsErrorKind {
    let detail = e.to_string();
    match e.code() {
        ErrorCode::ZERO_RETURN => ApnsErrorKind::SslHandshakeClosedAbort(detail),
        ErrorCode::SYSCALL => match e.io_error() {
            Some(io) if is_abort(io) => ApnsErrorKind::SslHandshakeClosedAbort(detail),
            _ => ApnsErrorKind::SslDroppedByServer(detail),
        },
        ErrorCode::SSL => classify_verify_result(verify_raw, verify_detail)
            .or_else(|| {
                e.ssl_error().and_then(|stack| {
                    stack
                        .errors()
                        .iter()
                        .filter_map(|err| err.reason())
                        .find_map(classify_alert)
                })
            })
            .unwrap_or(ApnsErrorKind::SslHandshakeFail(detail)),
        _ => ApnsErrorKind::SslHandshakeFail(detail),
    }
}

fn classify_verify_result(raw: i32, detail: &str) -> Option<ApnsErrorKind> {
    let detail = detail.to_owned();
    Some(match raw {
        0 => return None,
        // CERT_NOT_YET_VALID, CERT_HAS_EXPIRED
        9 | 10 => ApnsErrorKind::SslHandshakeCertExpired(detail),
        // UNABLE_TO_GET_ISSUER_CERT, UNABLE_TO_GET_ISSUER_CERT_LOCALLY
        2 | 20 => ApnsErrorKind::SslHandshakeUnknownRootCert(detail),
        // DEPTH_ZERO_SELF_SIGNED_CERT, SELF_SIGNED_CERT_IN_CHAIN,
        // UNABLE_TO_VERIFY_LEAF_SIGNATURE
        18 | 19 | 21 => ApnsErrorKind::SslHandshakeNoRootCert(detail),
        // CERT_REVOKED
        23 => ApnsErrorKind::SslHandshakePeerCertRevoked(detail),
        // CERT_SIGNATURE_FAILURE, CERT_CHAIN_TOO_LONG, INVALID_CA,
        // PATH_LENGTH_EXCEEDED
        7 | 22 | 24 | 25 => ApnsErrorKind::SslHandshakeXCertChainInvalid(detail),
        // HOSTNAME_MISMATCH
        62 => ApnsErrorKind::SslAuthFailed(detail),
        _ => ApnsErrorKind::SslHandshakeFail(detail),
    })
}

/// Map a TLS alert sent by the server onto a kind
fn classify_alert(reason: &str) -> Option<ApnsErrorKind> {
    let reason = reason.to_ascii_lowercase();
    let detail = reason.clone();
    if reason.contains("certificate expired") {
        Some(ApnsErrorKind::SslHandshakePeerCertExpired(detail))
    } else if reason.contains("certificate revoked") {
        Some(ApnsErrorKind::SslHandshakePeerCertRevoked(detail))
    } else if reason.contains("certificate unknown") || reason.contains("unknown ca") {
        Some(ApnsErrorKind::SslHandshakePeerCertUnknown(detail))
    } else if reason.contains("certificate required") {
        Some(ApnsErrorKind::SslHandshakeClientCertRequested(detail))
    } else if reason.contains("bad certificate")
        || reason.contains("decrypt error")
        || reason.contains("access denied")
    {
        Some(ApnsErrorKind::SslAuthFailed(detail))
    } else if reason.contains("internal error") {
        Some(ApnsErrorKind::SslHandshakeInternalError(detail))
    } else {
        None
    }
}
