#![warn(rust_2018_idioms)]

#[macro_use]
extern crate slog_scope;

mod commands;
mod settings;

use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use docopt::Docopt;
use serde_derive::Deserialize;

use apnpush::ApnsError;
use apnpush_common::errors::ReportableError;
use apnpush_common::logging::{self, LogObserver};

const USAGE: &str = "
Usage:
    apnpush push [options] [<token>...]
    apnpush feedback [options]
    apnpush certs [options]
    apnpush (-h | --help)

Options:
    -h, --help              Show this message
    --config=CONFIGFILE     apnpush configuration file path.
    --pkcs12=FILE           PKCS#12 bundle holding the push certificate and key.
    --password=PASSWORD     Password for the PKCS#12 bundle.
    --environment=ENV       auto, sandbox or production.
    --payload=JSON          Notification payload.
    --priority=N            Notification priority, 5 or 10.
    --expiry=SECONDS        Let the gateway drop the notification after this long.
";

#[derive(Debug, Deserialize)]
struct Args {
    cmd_push: bool,
    cmd_feedback: bool,
    cmd_certs: bool,
    arg_token: Vec<String>,
    flag_config: Option<String>,
    flag_pkcs12: Option<String>,
    flag_password: Option<String>,
    flag_environment: Option<String>,
    flag_payload: Option<String>,
    flag_priority: Option<u8>,
    flag_expiry: Option<u64>,
}

impl Args {
    /// Command line flags win over the config file and the environment
    fn apply(&self, settings: &mut settings::Settings) -> Result<(), Box<dyn Error>> {
        if let Some(path) = &self.flag_pkcs12 {
            settings.pkcs12 = Some(path.into());
        }
        if let Some(password) = &self.flag_password {
            settings.password = password.clone();
        }
        if let Some(environment) = &self.flag_environment {
            settings.environment = environment.parse()?;
        }
        if let Some(payload) = &self.flag_payload {
            settings.payload = payload.clone();
        }
        if let Some(priority) = self.flag_priority {
            settings.priority = priority;
        }
        if let Some(expiry) = self.flag_expiry {
            settings.expiry_seconds = Some(expiry);
        }
        if !self.arg_token.is_empty() {
            settings.tokens = self.arg_token.clone();
        }
        settings.validate()?;
        Ok(())
    }
}

/// Appends info and warning messages to a transcript file
struct Transcript(File);

impl Transcript {
    fn open(path: &Path) -> std::io::Result<Self> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Self)
    }
}

impl LogObserver for Transcript {
    fn log(&self, message: &str, warning: bool) {
        let level = if warning { "WARN" } else { "INFO" };
        // Logging from here would deadlock, so write failures are dropped
        let _ = writeln!(
            &self.0,
            "{} {} {}",
            chrono::Utc::now().to_rfc3339(),
            level,
            message
        );
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let mut settings = settings::Settings::with_env_and_config_file(&args.flag_config)?;
    args.apply(&mut settings)?;
    logging::init_logging(
        !settings.human_logs,
        logging::get_default_hostname(settings::ENV_PREFIX),
    )?;
    if let Some(path) = &settings.log_file {
        logging::attach_observer(Box::new(Transcript::open(path)?));
    }
    debug!("Starting up...");

    // Configure sentry error capture
    let _sentry_guard = configure_sentry();

    let result = if args.cmd_push {
        commands::push(&settings)
    } else if args.cmd_feedback {
        commands::feedback(&settings)
    } else {
        commands::certs(&settings)
    };

    if let Err(e) = &result {
        if let Some(err) = e.downcast_ref::<ApnsError>() {
            if err.is_sentry_event() {
                sentry::capture_event(apnpush_common::sentry::event_from_error(err));
            }
            error!("{}", err.kind);
        } else {
            error!("{}", e);
        }
    }

    logging::detach_observer();
    logging::reset_logging();
    result
}

fn configure_sentry() -> sentry::ClientInitGuard {
    let sentry = sentry::init(apnpush_common::sentry::client_options());
    if sentry.is_enabled() {
        info!("Sentry error reporting enabled");
    }
    sentry
}
