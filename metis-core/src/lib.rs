// src/lib.rs
//! Consent-gated personal data core.
//!
//! Start at [`commands::Platform`]; everything else is reachable from there.

pub mod commands;
pub mod config;
pub mod error;
pub mod services;
pub mod utils;

pub use commands::{Platform, PlatformDeps, RequestContext};
pub use config::PlatformConfig;
pub use error::{PlatformError, PlatformResult};
