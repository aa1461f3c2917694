//! Offline-first caching gateway.
//!
//! Requests are answered from versioned cache sets when possible, otherwise
//! from the origin (with write-through caching of acceptable responses), and
//! finally from a designated fallback resource.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod infra;
