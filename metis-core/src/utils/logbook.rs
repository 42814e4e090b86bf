// src/utils/logbook.rs
use anyhow::{Context, Result};
use serde::Serialize;
use std::{fs, io::Write, path::Path};

/// Append a single JSON value as one line to a JSONL file, creating parents as needed.
pub fn append_jsonl<S: Serialize>(path: &Path, val: &S) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create_dir_all({:?})", parent))?;
    }
    let json = serde_json::to_string(val)?;
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open logbook {:?}", path))?;
    writeln!(f, "{}", json)?;
    f.flush()?;
    Ok(())
}

/// Read back every line of a JSONL file; blank lines are skipped. A missing file reads as empty.
pub fn read_jsonl(path: &Path) -> Result<Vec<serde_json::Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("read logbook {:?}", path))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).with_context(|| format!("bad logbook line in {:?}", path)))
        .collect()
}
