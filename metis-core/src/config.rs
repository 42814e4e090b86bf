use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

impl PlatformConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            Self::from_toml_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using PlatformConfig::default().",
                path.display()
            );
            PlatformConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str::<PlatformConfig>(text)?)
    }

    /// Defaults with every relative path re-rooted under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let mut cfg = PlatformConfig::default();
        cfg.resolve_paths(root);
        cfg
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.store.path = absolutize(root, &self.store.path);
        self.audit.jsonl_path = absolutize(root, &self.audit.jsonl_path);
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            store: StoreConfig::default(),
            audit: AuditConfig::default(),
            analysis: AnalysisConfig::default(),
            retention: RetentionConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
    #[serde(default = "SystemConfig::default_version")]
    pub version: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "metis".to_string()
    }

    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            version: Self::default_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_path")]
    pub path: PathBuf,
    #[serde(default = "StoreConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "StoreConfig::default_max_txn_retries")]
    pub max_txn_retries: u32,
}

impl StoreConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("store/metis.db")
    }

    fn default_busy_timeout_ms() -> u64 {
        5_000
    }

    fn default_max_txn_retries() -> u32 {
        3
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            busy_timeout_ms: Self::default_busy_timeout_ms(),
            max_txn_retries: Self::default_max_txn_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    Sqlite,
    Jsonl,
}

impl Default for AuditBackend {
    fn default() -> Self {
        AuditBackend::Sqlite
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "AuditConfig::default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: AuditBackend,
    #[serde(default = "AuditConfig::default_jsonl_path")]
    pub jsonl_path: PathBuf,
    #[serde(default = "AuditConfig::default_ip_address")]
    pub default_ip_address: String,
    #[serde(default = "AuditConfig::default_user_agent")]
    pub default_user_agent: String,
}

impl AuditConfig {
    fn default_true() -> bool {
        true
    }

    fn default_jsonl_path() -> PathBuf {
        PathBuf::from("logbook/audit.jsonl")
    }

    fn default_ip_address() -> String {
        "0.0.0.0".to_string()
    }

    fn default_user_agent() -> String {
        "Unknown".to_string()
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: AuditBackend::default(),
            jsonl_path: Self::default_jsonl_path(),
            default_ip_address: Self::default_ip_address(),
            default_user_agent: Self::default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Absent means the analysis service is not configured.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "AnalysisConfig::default_focus")]
    pub focus: String,
    #[serde(default = "AnalysisConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "AnalysisConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl AnalysisConfig {
    fn default_focus() -> String {
        "Menopause Analysis".to_string()
    }

    fn default_connect_timeout_ms() -> u64 {
        3_000
    }

    fn default_request_timeout_ms() -> u64 {
        15_000
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            focus: Self::default_focus(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "RetentionConfig::default_period_days")]
    pub period_days: u32,
    #[serde(default = "RetentionConfig::default_jurisdiction")]
    pub jurisdiction: String,
    #[serde(default = "RetentionConfig::default_data_type")]
    pub data_type: String,
    /// Shared secret the scheduler presents. Absent means every trigger is rejected.
    #[serde(default)]
    pub trigger_secret: Option<String>,
}

impl RetentionConfig {
    fn default_period_days() -> u32 {
        2555
    }

    fn default_jurisdiction() -> String {
        "OTHER".to_string()
    }

    fn default_data_type() -> String {
        "personal".to_string()
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            period_days: Self::default_period_days(),
            jurisdiction: Self::default_jurisdiction(),
            data_type: Self::default_data_type(),
            trigger_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "JournalConfig::default_app_origin")]
    pub app_origin: String,
}

impl JournalConfig {
    fn default_app_origin() -> String {
        "MenoWellness".to_string()
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            app_origin: Self::default_app_origin(),
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
