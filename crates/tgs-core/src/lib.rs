//! Core domain + application logic for tgstate-rs.
//!
//! This crate is intentionally framework-agnostic. Telegram, the HTTP server and the
//! worker process supervisor live in adapter crates and talk to this one through the
//! `ChatBackend` port and plain values like `ServiceConfig`.

pub mod access;
pub mod backend;
pub mod backoff;
pub mod codec;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod logging;
pub mod utils;

pub use errors::{Error, Result};
