//! Direct client for the legacy binary Apple Push Notification service.
//!
//! [pusher::Pusher] and [feedback::FeedbackClient] each own a single
//! [channel::TlsChannel] to the gateway or feedback host. [hub::Hub] sits on
//! top of a pusher, numbering notifications so that the gateway's
//! asynchronous error responses can be traced back to what was sent.
//!
//! None of these types are thread safe; drive each instance from one thread.
#[macro_use]
extern crate slog_scope;

pub mod channel;
pub mod codec;
pub mod credential;
pub mod environment;
pub mod feedback;
pub mod hub;
pub mod pusher;
pub mod settings;
pub mod store;
#[cfg(test)]
pub(crate) mod test_support;

pub use apnpush_common::errors::{ApnsError, ApnsErrorKind, Result};
pub use apnpush_common::notification::Notification;
