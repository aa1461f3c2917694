//! Concrete origins behind the gateway.

mod directory;
mod http;

pub use directory::DirectoryOrigin;
pub use http::HttpOrigin;
