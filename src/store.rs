use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One extracted municipality. Optional fields are absent when that facet was not found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MunicipalityRecord {
    pub name: String,
    #[serde(default)]
    pub bfs_id: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stylized_image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geography: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appearance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_of_interest: Option<Vec<String>>,
}

/// Previously saved results. A missing or unreadable file means "nothing saved yet".
pub async fn load_results(path: &Path) -> Vec<MunicipalityRecord> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!("No previous results at {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<MunicipalityRecord>>(&raw) {
        Ok(records) => {
            info!("Loaded {} previous results from {}", records.len(), path.display());
            records
        }
        Err(e) => {
            warn!("Ignoring unreadable results file {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Rewrite the whole results file with `records`.
pub async fn save_results(path: &Path, records: &[MunicipalityRecord]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(records)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
