#[macro_use]
extern crate slog;

pub mod errors;
pub mod logging;
pub mod notification;
pub mod sentry;
pub mod util;
