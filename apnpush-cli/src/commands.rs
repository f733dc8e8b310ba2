//! The `push`, `feedback` and `certs` sub-commands
use std::error::Error;
use std::fs;
use std::thread;

use chrono::{Duration as ChronoDuration, Utc};
use config::ConfigError;

use apnpush::credential::{self, Credential};
use apnpush::environment::Environment;
use apnpush::feedback::FeedbackClient;
use apnpush::hub::Hub;
use apnpush::store::{CertificateStore, OpensslStore};
use apnpush::{ApnsError, ApnsErrorKind, Notification};

use crate::settings::Settings;

type CommandResult = Result<(), Box<dyn Error>>;

/// Push the configured payload to every configured token
pub fn push(settings: &Settings) -> CommandResult {
    let notifications = notifications(settings)?;
    let credential = load_credential(settings)?;

    let mut hub = Hub::with_settings(settings.apns.clone());
    hub.set_feedback_span(settings.feedback_span);
    let failures = hub.subscribe();
    hub.connect(&credential, settings.environment)?;

    let sent = notifications.len();
    let unsent = hub.push_notifications(notifications);
    // the gateway only speaks up about rejected notifications, give it a moment
    thread::sleep(settings.read_failed_delay);
    let rejected = hub.read_failed(settings.feedback_max, false)?;

    for failure in failures.try_iter() {
        let token = failure
            .notification
            .as_ref()
            .map_or("<unknown>", |n| n.token.as_str());
        println!("FAILED\t{}\t{}", token, failure.error.kind);
    }
    hub.trim_identifiers();
    hub.disconnect();
    info!(
        "Pushed {} notifications: {} not sent, {} rejected",
        sent,
        unsent,
        rejected.len()
    );
    Ok(())
}

/// Print the tokens the feedback service reports as inactive
pub fn feedback(settings: &Settings) -> CommandResult {
    let credential = load_credential(settings)?;
    let mut client = FeedbackClient::new(settings.apns.clone());
    client.connect(&credential, settings.environment)?;
    let records = client.read_token_date_pairs(settings.feedback_max)?;
    client.disconnect();
    for record in &records {
        println!("{}\t{}", record.timestamp.to_rfc3339(), record.token_hex());
    }
    info!("Read {} feedback records", records.len());
    Ok(())
}

/// List the push certificates available from the configured sources
pub fn certs(settings: &Settings) -> CommandResult {
    if settings.certificate_dir.is_none() && settings.pkcs12.is_none() {
        return Err(no_source().into());
    }
    let mut found = vec![];
    if let Some(dir) = &settings.certificate_dir {
        found.extend(credential::push_certificates(&OpensslStore::from_pem_dir(dir)?)?);
    }
    if let Some(path) = &settings.pkcs12 {
        let data = fs::read(path)?;
        found.extend(credential::load_from_pkcs12(
            &OpensslStore::new(),
            &data,
            &settings.password,
        )?);
    }
    for credential in &found {
        println!("{}", describe(credential));
    }
    Ok(())
}

fn describe(credential: &Credential) -> String {
    let expires = credential
        .expiration()
        .map_or_else(|| "-".to_owned(), |at| at.to_rfc3339());
    let key = credential::resolve_environment(credential, Environment::Auto)
        .map(|environment| credential.config_key(environment))
        .unwrap_or_default();
    format!(
        "{}\t{}\t{}\t{}\t{}",
        credential.subject_summary(),
        credential.certificate_class(),
        credential.environment_capability(),
        expires,
        key
    )
}

fn no_source() -> ConfigError {
    ConfigError::Message("Set either pkcs12 or certificate_dir".to_owned())
}

/// The push credential from a PKCS#12 bundle, or else the one push
/// certificate with a key in the certificate directory
fn load_credential(settings: &Settings) -> Result<Credential, Box<dyn Error>> {
    if let Some(path) = &settings.pkcs12 {
        let data = fs::read(path)?;
        let credential =
            credential::load_single_from_pkcs12(&OpensslStore::new(), &data, &settings.password)?;
        return Ok(credential);
    }
    let dir = settings.certificate_dir.as_ref().ok_or_else(no_source)?;
    let store = OpensslStore::from_pem_dir(dir)?;
    let mut usable = vec![];
    for certificate in credential::push_certificates(&store)? {
        match store.identity_for_certificate(&certificate) {
            Ok(identity) => usable.push(
                certificate.with_private_key(store.private_key_for_identity(&identity)?),
            ),
            Err(e) => debug!("Skipping {}: {}", certificate.subject_summary(), e.kind),
        }
    }
    match usable.len() {
        1 => Ok(usable.remove(0)),
        0 => Err(ApnsError::from(ApnsErrorKind::KeychainItemNotFound).into()),
        n => Err(ConfigError::Message(format!(
            "{} push certificates with keys in {}, use pkcs12 to pick one",
            n,
            dir.display()
        ))
        .into()),
    }
}

/// One notification per token, refusing tokens that are not 64 hex digits
fn notifications(settings: &Settings) -> Result<Vec<Notification>, ConfigError> {
    if settings.tokens.is_empty() {
        return Err(ConfigError::Message("No device tokens to push to".to_owned()));
    }
    let expiration = settings.expiry_seconds.and_then(|secs| {
        let secs = ChronoDuration::try_seconds(i64::try_from(secs).ok()?)?;
        Utc::now().checked_add_signed(secs)
    });
    let mut notifications = vec![];
    for token in &settings.tokens {
        let mut notification = Notification::new(settings.payload.as_str(), token.as_str())
            .with_priority(settings.priority);
        if let Some(at) = expiration {
            notification = notification.with_expiration(at);
        }
        if !notification.token_is_valid() {
            return Err(ConfigError::Message(format!("Invalid device token: {}", token)));
        }
        notifications.push(notification);
    }
    if let Some(first) = notifications.first() {
        if !first.payload_is_json() {
            warn!("Payload is not valid JSON");
        }
        if first.payload_exceeds_limit() {
            warn!(
                "Payload is {} bytes, over the {} byte limit",
                first.payload.len(),
                apnpush_common::notification::PAYLOAD_MAX_SIZE
            );
        }
    }
    Ok(notifications)
}
