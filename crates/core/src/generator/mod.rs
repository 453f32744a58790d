//! The opaque generation operation.
//!
//! The scheduler treats inference as a black box with a duration and a
//! success or failure outcome. `HttpGenerator` forwards the work to an
//! inference backend over HTTP.

mod http;
mod types;

pub use http::HttpGenerator;
pub use types::*;
