//! One end-to-end run: load, consolidate, aggregate, verify, write.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use shelfplan_eval::{Rollups, RunSummary, aggregate, verify_rollups};
use shelfplan_gates::{PipelineOutput, run_pipeline};
use tracing::{info, warn};

use crate::config::LoadedConfig;
use crate::report::RunReport;
use crate::tables::InputPaths;

/// Everything needed to execute a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub config: LoadedConfig,
    pub core_categories_override: Option<PathBuf>,
    pub inputs: InputPaths,
    /// Stamp recorded in the summary; excluded from the digest.
    pub generated_at: Option<String>,
}

/// Results of a completed run.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub output: PipelineOutput,
    pub rollups: Rollups,
    pub summary: RunSummary,
}

impl RunArtifacts {
    pub fn report(&self) -> RunReport<'_> {
        RunReport {
            records: &self.output.records,
            rejections: &self.output.rejections,
            stores: &self.rollups.stores,
            cluster_subcategories: &self.rollups.cluster_subcategories,
            summary: &self.summary,
        }
    }

    /// Write all output files.
    pub fn write(&self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        self.report().write_all(out_dir)
    }
}

/// Run the pipeline in memory. Nothing is written.
pub fn execute(request: &RunRequest) -> Result<RunArtifacts> {
    let config = &request.config.config;
    let (core, core_warning) = request
        .config
        .core_categories(request.core_categories_override.as_deref());

    let inputs = request.inputs.load().context("load input tables")?;
    let mut output = run_pipeline(&inputs, config, &core).context("consolidation pipeline")?;
    if let Some(w) = core_warning {
        warn!(warning = %w, "Core category fallback");
        output.warnings.insert(0, w);
    }

    let rollups = aggregate(&output.records);
    verify_rollups(&output.records, &rollups).context("rollup verification")?;

    let mut summary = RunSummary::build(&output, config, &core, &rollups);
    if let Some(ts) = &request.generated_at {
        summary = summary.with_generated_at(ts.clone());
    }

    info!(
        records = summary.total_records,
        rejections = summary.total_rejections,
        units = summary.total_units,
        digest = %summary.digest,
        "Run complete"
    );

    Ok(RunArtifacts {
        output,
        rollups,
        summary,
    })
}
