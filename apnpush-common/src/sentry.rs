use std::error::Error;

use crate::errors::ReportableError;

/// Return a `sentry::ClientOptions` suitable for a short lived command line
/// process: default integrations off, the release taken from the crate.
pub fn client_options() -> sentry::ClientOptions {
    let mut opts = sentry::apply_defaults(sentry::ClientOptions {
        release: sentry::release_name!(),
        ..Default::default()
    });
    opts.integrations.retain(|i| i.name() != "debug-images");
    opts.default_integrations = false;
    opts
}

/// Custom `sentry::event_from_error` for `ReportableError`
///
/// `std::error::Error` doesn't support backtraces, thus `sentry::event_from_error`
/// doesn't either. This walks the `reportable_source` chain to pick up the
/// backtraces captured by our own errors, then falls back to `source()`.
pub fn event_from_error(
    mut reportable_err: &dyn ReportableError,
) -> sentry::protocol::Event<'static> {
    let mut exceptions = vec![];

    loop {
        exceptions.push(exception_from_reportable_error(reportable_err));
        reportable_err = match reportable_err.reportable_source() {
            Some(reportable_err) => reportable_err,
            None => break,
        };
    }

    let mut source = reportable_err.source();
    while let Some(err) = source {
        exceptions.push(exception_from_error(err));
        source = err.source();
    }

    exceptions.reverse();
    let mut event = sentry::protocol::Event {
        exception: exceptions.into(),
        level: sentry::protocol::Level::Error,
        ..Default::default()
    };
    for (key, value) in reportable_err.extras() {
        event.extra.insert(key.to_owned(), value.into());
    }
    event
}

fn exception_from_reportable_error(err: &dyn ReportableError) -> sentry::protocol::Exception {
    let mut exception = exception_from_error(err);
    if let Some(backtrace) = err.backtrace() {
        exception.stacktrace = sentry_backtrace::backtrace_to_stacktrace(backtrace)
    }
    exception
}

/// Copy of sentry's private `exception_from_error`
fn exception_from_error<E>(err: &E) -> sentry::protocol::Exception
where
    E: Error + ?Sized,
{
    let dbg = format!("{:?}", err);
    sentry::protocol::Exception {
        ty: sentry::parse_type_from_debug(&dbg).to_owned(),
        value: Some(err.to_string()),
        ..Default::default()
    }
}
