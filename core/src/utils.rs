use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use crate::{FlowStatsError, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn format_timestamp_micros(timestamp_us: i64) -> String {
    let dt = DateTime::from_timestamp_micros(timestamp_us).unwrap_or_else(Utc::now);
    dt.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string()
}

/// `X.pcapng` becomes `X<suffix>` in the same directory.
pub fn output_path_for(capture: &Path, suffix: &str) -> Result<PathBuf> {
    let stem = capture
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| FlowStatsError::Parse(format!("invalid capture file name: {}", capture.display())))?;
    Ok(capture.with_file_name(format!("{}{}", stem, suffix)))
}

pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == extension.trim_start_matches('.'))
        .unwrap_or(false)
}

/// Writes through a sibling temporary file so readers never observe a partial artifact.
pub fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| FlowStatsError::Parse(format!("invalid output path: {}", path.display())))?;
    let temp = path.with_file_name(format!(
        ".{}.{}-{}.tmp",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = std::fs::write(&temp, content) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}
