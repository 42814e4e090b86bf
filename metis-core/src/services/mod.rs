// src/services/mod.rs

pub mod store;        // the SQLite store every service shares
pub mod audit;        // append-only trail; best-effort emission
pub mod consent;
pub mod gate;         // consent gate: decide + audit
pub mod minimizer;    // pure payload shaping
pub mod identity;
pub mod accounts;
pub mod invites;      // ledger + the redemption transaction
pub mod journal;
pub mod analysis;     // outbound HTTP client
pub mod retention;

// Public API
pub use audit::{AuditEvent, AuditLogEntry, AuditRecord, AuditSink, Auditor};
pub use consent::{ConsentRecord, ConsentStore, Permission, Permissions};
pub use gate::{ConsentGate, DenyReason, GateDecision, GatedAction};
pub use invites::{InviteLedger, InviteRecord, LinkTransaction, RedeemFailureKind, RedeemOutcome};
pub use store::Store;
