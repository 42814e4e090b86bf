// src/commands/mod.rs
pub mod init;
pub mod context;
mod api;

pub use api::{AnonymizationStatus, Platform, PlatformDeps};
pub use context::{ClientMeta, RequestContext, VerifiedCaller};
pub use init::{ensure_initialized_once, InitReport};
