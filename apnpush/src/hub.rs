//! Numbering, tracking and failure reporting on top of a pusher.
//!
//! The gateway only answers when something goes wrong, and then only with
//! the identifier of the offending notification. The hub gives every
//! notification an identifier, remembers what it sent for `feedback_span`,
//! and maps error responses back to the original notification.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use apnpush_common::errors::{ApnsError, Result};
use apnpush_common::notification::Notification;

use crate::credential::{self, Credential};
use crate::environment::Environment;
use crate::pusher::{PushTransport, Pusher};
use crate::settings::ApnsSettings;
use crate::store::CertificateStore;

/// How long a sent notification is kept around for matching failures
pub const DEFAULT_FEEDBACK_SPAN: Duration = Duration::from_secs(30);

/// Upper bound on error responses drained by [Hub::read_failed_count]
const READ_FAILED_MAX: usize = 1000;

/// A notification the gateway rejected or that could not be sent.
///
/// `notification` is `None` when the gateway names an identifier the hub no
/// longer remembers.
#[derive(Clone, Debug)]
pub struct NotificationFailure {
    pub notification: Option<Notification>,
    pub error: ApnsError,
}

struct Sent {
    notification: Notification,
    at: Instant,
}

pub struct Hub<P: PushTransport = Pusher> {
    pusher: P,
    index: u32,
    feedback_span: Duration,
    sent: HashMap<u32, Sent>,
    observer: Option<Sender<NotificationFailure>>,
}

impl Hub<Pusher> {
    pub fn with_settings(settings: ApnsSettings) -> Self {
        Self::new(Pusher::new(settings))
    }
}

impl<P: PushTransport> Hub<P> {
    pub fn new(pusher: P) -> Self {
        Self {
            pusher,
            index: 1,
            feedback_span: DEFAULT_FEEDBACK_SPAN,
            sent: HashMap::new(),
            observer: None,
        }
    }

    pub fn pusher(&self) -> &P {
        &self.pusher
    }

    pub fn pusher_mut(&mut self) -> &mut P {
        &mut self.pusher
    }

    pub fn feedback_span(&self) -> Duration {
        self.feedback_span
    }

    pub fn set_feedback_span(&mut self, span: Duration) {
        self.feedback_span = span;
    }

    /// Receive every failure from now on. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> Receiver<NotificationFailure> {
        let (tx, rx) = unbounded();
        self.observer = Some(tx);
        rx
    }

    /// Number of notifications still remembered
    pub fn tracked(&self) -> usize {
        self.sent.len()
    }

    pub fn connect(&mut self, credential: &Credential, environment: Environment) -> Result<()> {
        self.pusher.connect(credential, environment)
    }

    pub fn connect_pkcs12(
        &mut self,
        store: &dyn CertificateStore,
        data: &[u8],
        password: &str,
        environment: Environment,
    ) -> Result<()> {
        let credential = credential::load_single_from_pkcs12(store, data, password)?;
        self.connect(&credential, environment)
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.pusher.reconnect()
    }

    pub fn disconnect(&mut self) {
        self.pusher.disconnect()
    }

    /// Send one notification, assigning the next identifier when it has none.
    ///
    /// On failure the subscriber hears about it, the pusher reconnects if
    /// asked to, and the error is returned.
    pub fn push_notification(
        &mut self,
        mut notification: Notification,
        auto_reconnect: bool,
    ) -> Result<u32> {
        if notification.identifier == 0 {
            notification.identifier = self.next_identifier();
        }
        let identifier = notification.identifier;
        match self.pusher.push_notification(&notification) {
            Ok(()) => {
                self.sent.insert(
                    identifier,
                    Sent {
                        notification,
                        at: Instant::now(),
                    },
                );
                Ok(identifier)
            }
            Err(e) => {
                warn!("Push failed: {}", e.kind; "identifier" => identifier);
                self.notify(Some(notification), e.clone());
                if auto_reconnect {
                    if let Err(re) = self.pusher.reconnect() {
                        warn!("Reconnect failed: {}", re.kind);
                    }
                }
                Err(e)
            }
        }
    }

    /// Send each notification, reconnecting after failures. Returns the
    /// number that failed.
    pub fn push_notifications(&mut self, notifications: Vec<Notification>) -> usize {
        notifications
            .into_iter()
            .map(|notification| self.push_notification(notification, true))
            .filter(Result::is_err)
            .count()
    }

    pub fn push_payload(&mut self, payload: &str, token: &str) -> usize {
        self.push_notifications(vec![Notification::new(payload, token)])
    }

    /// One payload to many devices
    pub fn push_payload_to_tokens<S: AsRef<str>>(&mut self, payload: &str, tokens: &[S]) -> usize {
        self.push_notifications(
            tokens
                .iter()
                .map(|token| Notification::new(payload, token.as_ref()))
                .collect(),
        )
    }

    /// Many payloads to one device
    pub fn push_payloads_to_token<S: AsRef<str>>(&mut self, payloads: &[S], token: &str) -> usize {
        self.push_notifications(
            payloads
                .iter()
                .map(|payload| Notification::new(payload.as_ref(), token))
                .collect(),
        )
    }

    /// Drain up to `max` error responses, reporting each to the subscriber,
    /// then trim. Returns the notifications that were found to have failed.
    pub fn read_failed(&mut self, max: usize, auto_reconnect: bool) -> Result<Vec<Notification>> {
        self.drain_failed(max, auto_reconnect)
            .map(|(failed, _)| failed)
    }

    /// Drain pending error responses, reconnecting after any, and return how
    /// many there were. Errors are logged rather than returned.
    pub fn read_failed_count(&mut self) -> usize {
        match self.drain_failed(READ_FAILED_MAX, true) {
            Ok((_, reported)) => reported,
            Err(e) => {
                warn!("Reading failed notifications: {}", e.kind);
                0
            }
        }
    }

    fn drain_failed(
        &mut self,
        max: usize,
        auto_reconnect: bool,
    ) -> Result<(Vec<Notification>, usize)> {
        let mut failed = vec![];
        let mut reported = 0;
        while reported < max {
            let (identifier, error) = match self.pusher.read_failed_identifier() {
                Ok(found) => found,
                // the gateway hangs up right after an error response
                Err(e) if reported > 0 && e.kind.is_connection_lost() => {
                    debug!("Gateway closed after error response: {}", e.kind);
                    break;
                }
                Err(e) => return Err(e),
            };
            let error = match error {
                Some(error) if identifier != 0 => error,
                _ => break,
            };
            reported += 1;
            let notification = self
                .sent
                .get(&identifier)
                .map(|sent| sent.notification.clone());
            if notification.is_none() {
                debug!("Error response for untracked identifier"; "identifier" => identifier);
            }
            failed.extend(notification.clone());
            self.notify(notification, error);
        }
        if reported > 0 && auto_reconnect {
            self.pusher.reconnect()?;
        }
        self.trim_identifiers();
        Ok((failed, reported))
    }

    /// Forget notifications older than `feedback_span`. True if any went.
    pub fn trim_identifiers(&mut self) -> bool {
        self.trim_identifiers_at(Instant::now())
    }

    fn trim_identifiers_at(&mut self, now: Instant) -> bool {
        let cutoff = match now.checked_sub(self.feedback_span) {
            Some(cutoff) => cutoff,
            None => return false,
        };
        let before = self.sent.len();
        self.sent.retain(|_, sent| sent.at >= cutoff);
        let trimmed = before - self.sent.len();
        if trimmed > 0 {
            debug!("Trimmed {} tracked notifications", trimmed);
        }
        trimmed > 0
    }

    fn next_identifier(&mut self) -> u32 {
        let identifier = self.index;
        self.index = self.index.checked_add(1).unwrap_or(1);
        identifier
    }

    fn notify(&mut self, notification: Option<Notification>, error: ApnsError) {
        if let Some(observer) = &self.observer {
            if observer
                .send(NotificationFailure {
                    notification,
                    error,
                })
                .is_err()
            {
                // nobody is listening any more
                self.observer = None;
            }
        }
    }
}
