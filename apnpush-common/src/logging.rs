use std::{
    collections::VecDeque,
    io,
    sync::{Mutex, PoisonError},
};

use gethostname::gethostname;
use slog::{self, Drain, Level, OwnedKVList, Record};
use slog_mozlog_json::MozLogJson;

use crate::errors::Result;

/// Messages held while no observer is attached. The oldest are dropped first.
pub const LOG_BUFFER_CAPACITY: usize = 1000;

/// Receives info and warning level messages, e.g. to echo them to a user
/// facing transcript.
pub trait LogObserver: Send {
    fn log(&self, message: &str, warning: bool);
}

struct ObserverState {
    observer: Option<Box<dyn LogObserver>>,
    pending: VecDeque<(String, bool)>,
    dropped: usize,
}

static OBSERVER: Mutex<ObserverState> = Mutex::new(ObserverState {
    observer: None,
    pending: VecDeque::new(),
    dropped: 0,
});

/// Hand a message to the attached observer, or buffer it until one attaches.
pub fn publish(message: &str, warning: bool) {
    let mut state = OBSERVER.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(observer) = &state.observer {
        observer.log(message, warning);
        return;
    }
    if state.pending.len() >= LOG_BUFFER_CAPACITY {
        state.pending.pop_front();
        state.dropped += 1;
    }
    state.pending.push_back((message.to_owned(), warning));
}

/// Attach the process wide observer, flushing everything buffered so far.
///
/// Replaces any previously attached observer.
pub fn attach_observer(observer: Box<dyn LogObserver>) {
    let mut state = OBSERVER.lock().unwrap_or_else(PoisonError::into_inner);
    if state.dropped > 0 {
        observer.log(
            &format!(
                "{} log messages were dropped before an observer attached",
                state.dropped
            ),
            true,
        );
        state.dropped = 0;
    }
    for (message, warning) in state.pending.drain(..) {
        observer.log(&message, warning);
    }
    state.observer = Some(observer);
}

/// Detach the observer; messages are buffered again until the next attach.
pub fn detach_observer() -> Option<Box<dyn LogObserver>> {
    OBSERVER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .observer
        .take()
}

/// Forwards info and above to the observer
struct ObserverDrain;

impl Drain for ObserverDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(
        &self,
        record: &Record<'_>,
        _values: &OwnedKVList,
    ) -> std::result::Result<(), slog::Never> {
        if record.level().is_at_least(Level::Info) {
            publish(
                &record.msg().to_string(),
                record.level().is_at_least(Level::Warning),
            );
        }
        Ok(())
    }
}

/// Initialize logging.
///
/// This will generate either mozilla standardized JSON output or a
/// more "human readable" form. It also uses the provided hostname
/// identifier as part of the standardized output. Info and above are also
/// duplicated to the [LogObserver] (or its buffer).
pub fn init_logging(json: bool, hostname: String) -> Result<()> {
    let logger = if json {
        let drain = MozLogJson::new(io::stderr())
            .logger_name(format!(
                "{}-{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .msg_type(format!("{}:log", env!("CARGO_PKG_NAME")))
            .hostname(hostname)
            .build()
            .fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = slog::Duplicate::new(drain, ObserverDrain).fuse();
        slog::Logger::root(drain, slog_o!())
    } else {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = slog::Duplicate::new(drain, ObserverDrain).fuse();
        slog::Logger::root(drain, slog_o!())
    };
    // XXX: cancel slog_scope's NoGlobalLoggerSet for now, it's difficult to
    // prevent it from potentially panicing during tests. reset_logging resets
    // the global logger during shutdown anyway:
    // https://github.com/slog-rs/slog/issues/169
    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().ok();
    Ok(())
}

pub fn reset_logging() {
    let logger = slog::Logger::root(slog::Discard, o!());
    slog_scope::set_global_logger(logger).cancel_reset();
}

/// Initialize logging to `slog_term::TestStdoutWriter` for tests
///
/// Note: unfortunately this disables slog's `TermDecorator` (which can't be
/// captured by cargo test) color output
pub fn init_test_logging() {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = std::sync::Mutex::new(slog_term::FullFormat::new(decorator).build()).fuse();
    let logger = slog::Logger::root(drain, slog::o!());
    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().ok();
}

/// Use the run time specific Hostname identifier, falling back to the system level hostname
///
/// e.g. for `apnpush` this will attempt to look for `APNPUSH_HOSTNAME`, and if that
/// is not defined, will use the locally specified hostname.
pub fn get_default_hostname(prefix: &str) -> String {
    std::env::var(format!("{}_HOSTNAME", prefix.to_uppercase()))
        .unwrap_or_else(|_| gethostname().to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<(String, bool)>>>);

    impl LogObserver for Collect {
        fn log(&self, message: &str, warning: bool) {
            self.0.lock().unwrap().push((message.to_owned(), warning));
        }
    }

    // One test drives the whole observer lifecycle: the state is process wide.
    #[test]
    fn observer_lifecycle() {
        detach_observer();
        publish("connecting", false);
        publish("handshake slow", true);

        let seen = Collect::default();
        attach_observer(Box::new(seen.clone()));
        assert_eq!(
            *seen.0.lock().unwrap(),
            vec![
                ("connecting".to_owned(), false),
                ("handshake slow".to_owned(), true)
            ]
        );

        // pass through once attached
        publish("pushed", false);
        assert_eq!(seen.0.lock().unwrap().len(), 3);

        // buffer again once detached, dropping the oldest on overflow
        assert!(detach_observer().is_some());
        for i in 0..LOG_BUFFER_CAPACITY + 5 {
            publish(&format!("message {i}"), false);
        }
        let late = Collect::default();
        attach_observer(Box::new(late.clone()));
        let late = late.0.lock().unwrap();
        assert_eq!(late.len(), LOG_BUFFER_CAPACITY + 1);
        assert_eq!(
            late[0],
            (
                "5 log messages were dropped before an observer attached".to_owned(),
                true
            )
        );
        assert_eq!(late[1].0, "message 5");
        detach_observer();
    }

    #[test]
    fn hostname_from_env() {
        std::env::set_var("APNPUSH_TEST_HOSTNAME", "pusher.example.com");
        assert_eq!(get_default_hostname("apnpush_test"), "pusher.example.com");
        std::env::remove_var("APNPUSH_TEST_HOSTNAME");
    }
}
