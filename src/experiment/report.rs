use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;

use crate::service::MetricsBundle;

/// Columns of a sweep report.
pub const REPORT_HEADER: [&str; 6] = ["identifier", "rmse", "spearman", "top_1", "top_3", "top_5"];

/// Identifier of the no-descriptor baseline row.
pub const IDENTITY: &str = "identity";

/// (identifier, metrics) pairs of one sweep.
#[derive(Debug, Clone, Default)]
pub struct ExperimentResult {
    entries: Vec<(String, MetricsBundle)>,
}

impl ExperimentResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, identifier: impl Into<String>, bundle: MetricsBundle) {
        self.entries.push((identifier.into(), bundle));
    }

    pub fn entries(&self) -> &[(String, MetricsBundle)] {
        &self.entries
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn get(&self, identifier: &str) -> Option<&MetricsBundle> {
        self.entries
            .iter()
            .find(|(id, _)| id == identifier)
            .map(|(_, b)| b)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Two stable sorts: ascending rmse, then descending top-1 accuracy.
    /// Top-1 is therefore the primary key and rmse breaks its ties.
    pub fn rank(&mut self) {
        self.entries
            .sort_by(|(_, a), (_, b)| a.rmse_scores.total_cmp(&b.rmse_scores));
        self.entries
            .sort_by(|(_, a), (_, b)| b.top_1_accuracy.total_cmp(&a.top_1_accuracy));
    }

    /// Tab-separated header plus one line per entry, in current order.
    pub fn format_report(&self) -> Vec<String> {
        std::iter::once(REPORT_HEADER.join("\t"))
            .chain(self.entries.iter().map(|(id, b)| {
                format!(
                    "{id}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}",
                    b.rmse_scores,
                    b.spearman_scores,
                    b.top_1_accuracy,
                    b.top_3_accuracy,
                    b.top_5_accuracy
                )
            }))
            .collect()
    }

    /// Write the report as a TSV file at full precision.
    pub fn save_report(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .with_context(|| format!("creating report {}", path.display()))?;

        writer.write_record(REPORT_HEADER)?;
        for (id, b) in &self.entries {
            writer.write_record([
                id.clone(),
                b.rmse_scores.to_string(),
                b.spearman_scores.to_string(),
                b.top_1_accuracy.to_string(),
                b.top_3_accuracy.to_string(),
                b.top_5_accuracy.to_string(),
            ])?;
        }
        writer.flush()?;
        log::info!("report with {} rows written to {}", self.len(), path.display());
        Ok(())
    }
}
