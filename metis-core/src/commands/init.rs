// metis-core/src/commands/init.rs
//! Root directory bootstrap. Components never read this state directly: the
//! caller passes `InitReport::config` into `Platform::open`.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::PlatformConfig;

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    /// Root-relative entries this call created.
    pub created: Vec<String>,
    /// Root-relative entries that were already present.
    pub existed: Vec<String>,
    pub config: PlatformConfig,
}

static INIT: OnceCell<InitReport> = OnceCell::new();

/// Initialize [`metis_root`] once per process; later calls return the same report.
pub fn ensure_initialized_once() -> Result<&'static InitReport> {
    INIT.get_or_try_init(|| ensure_initialized_at(&metis_root()))
}

/// `$METIS_ROOT`, else `.metis` in the working directory.
pub fn metis_root() -> PathBuf {
    std::env::var_os("METIS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".metis"))
}

/// Create the tree and seed `config.toml` under `root` if missing, then load it.
pub fn ensure_initialized_at(root: &Path) -> Result<InitReport> {
    let mut seed = Seeder::new(root);
    for dir in ["", "store", "logbook"] {
        seed.dir(dir)?;
    }
    seed.file("config.toml", DEFAULT_CONFIG_TOML)?;

    let config = PlatformConfig::load(root)?;
    tracing::debug!(root = %root.display(), created = seed.created.len(), "metis root ready");

    Ok(InitReport {
        root: root.to_path_buf(),
        created: seed.created,
        existed: seed.existed,
        config,
    })
}

struct Seeder<'a> {
    root: &'a Path,
    created: Vec<String>,
    existed: Vec<String>,
}

impl<'a> Seeder<'a> {
    fn new(root: &'a Path) -> Self {
        Self { root, created: Vec::new(), existed: Vec::new() }
    }

    fn note(&mut self, rel: &str, was_there: bool) {
        let label = if rel.is_empty() { "." } else { rel };
        let list = if was_there { &mut self.existed } else { &mut self.created };
        list.push(label.to_string());
    }

    fn dir(&mut self, rel: &str) -> Result<()> {
        let path = self.root.join(rel);
        let was_there = path.is_dir();
        if !was_there {
            std::fs::create_dir_all(&path)
                .with_context(|| format!("creating directory {}", path.display()))?;
        }
        self.note(rel, was_there);
        Ok(())
    }

    /// Write `contents` only when the file is absent; an existing file is never touched.
    fn file(&mut self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        let was_there = path.exists();
        if !was_there {
            replace_file(&path, contents.as_bytes())?;
        }
        self.note(rel, was_there);
        Ok(())
    }
}

/// Write through a sibling temp file and rename, so readers never see a partial config.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let staging = path.with_extension("partial");
    let mut out = std::fs::File::create(&staging)
        .with_context(|| format!("creating {}", staging.display()))?;
    out.write_all(bytes)?;
    out.sync_all()?;
    drop(out);
    std::fs::rename(&staging, path)
        .with_context(|| format!("moving {} into place", path.display()))?;
    Ok(())
}

// ---------- defaults ----------

const DEFAULT_CONFIG_TOML: &str = r#"[system]
name = "metis"
version = "0.1.0"

[store]
path = "store/metis.db"
busy_timeout_ms = 5000
max_txn_retries = 3

[audit]
enabled = true
backend = "sqlite"
jsonl_path = "logbook/audit.jsonl"
default_ip_address = "0.0.0.0"
default_user_agent = "Unknown"

[analysis]
# endpoint = "https://analysis.example.invalid/analyze"
focus = "Menopause Analysis"
connect_timeout_ms = 3000
request_timeout_ms = 15000

[retention]
period_days = 2555
jurisdiction = "OTHER"
data_type = "personal"
# trigger_secret = "set-me"

[journal]
app_origin = "MenoWellness"
"#;
