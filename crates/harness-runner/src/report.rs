use crate::run::RunSummary;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::Path;

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    let partial = dir.join(format!(".{}.partial", name));
    {
        let mut out = fs::File::create(&partial)?;
        out.write_all(bytes)?;
        out.sync_all()?;
    }
    fs::rename(&partial, path)?;
    Ok(())
}

pub fn summary_to_json(summary: &RunSummary) -> Value {
    json!({
        "schema_version": "harness_run_summary_v1",
        "run_id": summary.run_id,
        "phase": summary.phase,
        "phases": summary.phases,
        "operator": summary.operator,
        "selection": summary.selection,
        "outcome": summary.outcome,
        "error": summary.error,
        "status_count": summary.status_count,
        "last_status": summary.last_status,
        "started_at": summary.started_at.to_rfc3339(),
        "finished_at": summary.finished_at.map(|t| t.to_rfc3339()),
        "exported_at": Utc::now().to_rfc3339(),
    })
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&summary_to_json(summary))?;
    write_atomically(path, &bytes)
        .with_context(|| format!("failed to write run summary to {}", path.display()))
}
