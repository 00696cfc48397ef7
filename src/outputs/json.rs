//! JSON run reports.
//!
//! Each run writes one file, grouped by the UTC date the run started:
//! ```text
//! report_dir/
//! └── 2025-05-06/
//!     └── run_20250506_143000_3fa9c2.json
//! ```
//! The same JSON is also stored in the `pipeline_runs` table.

use std::error::Error;
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, info, instrument};

use crate::pipeline::RunReport;

/// Write a [`RunReport`] below `report_dir`.
///
/// # Returns
///
/// The path of the written file.
///
/// # Output Path
///
/// `{report_dir}/{started_at date}/{run_id}.json`
#[instrument(level = "info", skip_all, fields(report_dir = %report_dir, run_id = %report.run_id))]
pub async fn write_report(report: &RunReport, report_dir: &str) -> Result<PathBuf, Box<dyn Error>> {
    let json = serde_json::to_string_pretty(report)?;

    let day_dir = PathBuf::from(report_dir).join(report.started_at.date_naive().to_string());
    if let Err(e) = fs::create_dir_all(&day_dir).await {
        error!(path = %day_dir.display(), error = %e, "Failed to create report dir");
        return Err(e.into());
    }

    let path = day_dir.join(format!("{}.json", report.run_id));
    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote run report");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_report_groups_by_start_date() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RunReport::new("run_test_000001".to_string());
        report.inserted = 7;

        let path = write_report(&report, dir.path().to_str().unwrap()).await.unwrap();
        assert!(path.ends_with(format!("{}/run_test_000001.json", report.started_at.date_naive())));

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let back: RunReport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.inserted, 7);
        assert_eq!(back.run_id, report.run_id);
    }
}
