//! HTTP middleware shared across the API surface.

mod logging;

pub use logging::request_logging;
