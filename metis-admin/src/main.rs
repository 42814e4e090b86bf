use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use metis_core::commands::init::{ensure_initialized_at, metis_root};
use metis_core::commands::{Platform, RequestContext};
use metis_core::services::consent::{Permission, Permissions};
use metis_core::services::identity::TrustedOperator;
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "metis-admin",
    about = "Operator CLI for a local Metis store"
)]
struct Cli {
    /// Metis root (defaults to $METIS_ROOT, then .metis)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Act as this user (local operator mode)
    #[arg(long = "as", global = true)]
    as_user: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create the root directory tree and seed config.toml
    Init,
    /// Create or refresh the acting user's account
    Onboard {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
    },
    #[command(subcommand)]
    Consent(ConsentCmd),
    #[command(subcommand)]
    Invite(InviteCmd),
    #[command(subcommand)]
    Journal(JournalCmd),
    /// Send text to the analysis service (requires sentimentAnalysis consent)
    Analyze {
        text: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Fire the retention trigger with the shared secret
    Cleanup {
        #[arg(long, env = "METIS_TRIGGER_SECRET")]
        secret: String,
    },
    #[command(subcommand)]
    Audit(AuditCmd),
}

#[derive(Subcommand)]
enum ConsentCmd {
    /// Replace the current consent with exactly the given permissions
    Submit {
        /// e.g. dataProcessing sentimentAnalysis
        #[arg(value_parser = parse_permission)]
        grant: Vec<Permission>,
    },
    Withdraw,
    Show {
        uid: Option<String>,
    },
}

#[derive(Subcommand)]
enum InviteCmd {
    Issue {
        #[arg(long, default_value_t = 72)]
        ttl_hours: u64,
    },
    Redeem {
        code: String,
    },
    Show {
        code: String,
    },
}

#[derive(Subcommand)]
enum JournalCmd {
    Save {
        text: String,
        #[arg(long)]
        shared: bool,
    },
    List {
        uid: Option<String>,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Entries for one user, oldest first
    Tail {
        uid: Option<String>,
        #[arg(long, default_value_t = 20)]
        n: usize,
        /// Only entries at or after this RFC3339 time
        #[arg(long)]
        since: Option<String>,
    },
}

fn parse_permission(s: &str) -> std::result::Result<Permission, String> {
    s.parse()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = cli.root.clone().unwrap_or_else(metis_root);
    let report = ensure_initialized_at(&root).with_context(|| format!("initializing {}", root.display()))?;

    tracing::debug!(root = %report.root.display(), created = report.created.len(), "metis root ready");
    let platform = Platform::open(&report.config)?;
    let ctx = match cli.as_user.as_deref() {
        Some(uid) => RequestContext::authenticate(&TrustedOperator, uid),
        None => RequestContext::anonymous(),
    };
    let acting = cli.as_user.clone().unwrap_or_default();

    match cli.cmd {
        Cmd::Init => {
            println!("root:  {}", report.root.display());
            println!("store: {}", platform.config().store.path.display());
            for path in &report.created {
                println!("created {path}");
            }
            for path in &report.existed {
                println!("exists  {path}");
            }
            Ok(())
        }
        Cmd::Onboard { email, display_name } => {
            print_json(&platform.onboard_user(&ctx, &acting, email.as_deref(), display_name.as_deref())?)
        }
        Cmd::Consent(ConsentCmd::Submit { grant }) => {
            print_json(&platform.submit_consent(&ctx, Permissions::granting(&grant))?)
        }
        Cmd::Consent(ConsentCmd::Withdraw) => print_json(&platform.withdraw_consent(&ctx)?),
        Cmd::Consent(ConsentCmd::Show { uid }) => {
            print_json(&platform.consent(uid.as_deref().unwrap_or(&acting))?)
        }
        Cmd::Invite(InviteCmd::Issue { ttl_hours }) => {
            print_json(&platform.issue_invite(&ctx, invite_ttl(ttl_hours)?)?)
        }
        Cmd::Invite(InviteCmd::Redeem { code }) => print_json(&platform.redeem_invite(&ctx, &code)?),
        Cmd::Invite(InviteCmd::Show { code }) => print_json(&platform.invite(&code)?),
        Cmd::Journal(JournalCmd::Save { text, shared }) => {
            let payload = serde_json::json!({ "text": text, "isShared": shared });
            print_json(&platform.gated_write(&ctx, "save_journal_entry", &payload)?)
        }
        Cmd::Journal(JournalCmd::List { uid }) => {
            print_json(&platform.journal_entries_for(uid.as_deref().unwrap_or(&acting))?)
        }
        Cmd::Analyze { text, timeout_ms } => {
            let ctx = match timeout_ms {
                Some(ms) => ctx.with_timeout(Duration::from_millis(ms)),
                None => ctx,
            };
            print_json(&platform.request_analysis(&ctx, &text)?)
        }
        Cmd::Cleanup { secret } => print_json(&platform.cleanup_expired_data(&secret)?),
        Cmd::Audit(AuditCmd::Tail { uid, n, since }) => {
            let since = since
                .as_deref()
                .map(|s| DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)))
                .transpose()
                .context("--since must be RFC3339")?;
            let records = platform.audit_records_for(uid.as_deref().unwrap_or(&acting))?;
            let mut tail: Vec<_> = records
                .into_iter()
                .filter(|r| since.map_or(true, |t| r.timestamp >= t))
                .collect();
            let skip = tail.len().saturating_sub(n);
            tail.drain(..skip);
            print_json(&tail)
        }
    }
}

fn invite_ttl(hours: u64) -> Result<Duration> {
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .with_context(|| format!("--ttl-hours {hours} is too large"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_ttl_is_a_cli_error() {
        assert_eq!(invite_ttl(72).unwrap(), Duration::from_secs(72 * 3600));
        assert!(invite_ttl(u64::MAX).is_err());
    }
}
