//! shelfplan CLI: bounded inventory-adjustment consolidation.
//!
//! ## Usage
//!
//! ```bash
//! # Consolidate rule tables into one decision per (store, product)
//! shelfplan run --config configs/standard.toml \
//!               --clusters data/clusters.csv \
//!               --rule below_minimum=data/below_minimum.csv \
//!               --rule overcapacity=data/overcapacity.csv \
//!               --rule growth_candidate=data/growth_candidate.csv \
//!               --rule growth_scaling=data/growth_scaling.csv \
//!               --approved data/approved.csv \
//!               --siblings data/sibling_sales.csv \
//!               --out-dir out/
//!
//! # Validate a config and print its fingerprint
//! shelfplan check-config --config configs/standard.toml
//!
//! # Print a preset as TOML
//! shelfplan preset conservative
//! ```
//!
//! ## Exit Codes
//! - 0: Success
//! - 2: Error (unreadable or malformed inputs, invalid config, etc.)

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use shelfplan_runner::{InputPaths, LoadedConfig, RunRequest, execute, parse_rule_arg, preset_toml};

/// shelfplan: consolidate inventory adjustment rules under safety bounds.
#[derive(Parser)]
#[command(name = "shelfplan")]
#[command(version)]
#[command(about = "Bounded inventory-adjustment consolidation")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: text (default) or json
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consolidation pipeline and write all output tables
    Run {
        /// Pipeline config (TOML). Defaults to the named preset.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Preset used when no config file is given
        #[arg(long, default_value = "standard")]
        preset: String,

        /// Core category file (JSON); overrides the config's path
        #[arg(long)]
        core_categories: Option<PathBuf>,

        /// Peer-cluster table (store_id, cluster_id)
        #[arg(long)]
        clusters: PathBuf,

        /// Rule table as RULE=PATH; repeat per stage
        #[arg(long = "rule", short = 'r', value_name = "RULE=PATH")]
        rules: Vec<String>,

        /// Approved candidate table
        #[arg(long)]
        approved: Option<PathBuf>,

        /// Sibling sales table for family allocation
        #[arg(long)]
        siblings: Option<PathBuf>,

        /// Manual minimum table (store_id, subcategory, min_qty)
        #[arg(long)]
        manual_minimums: Option<PathBuf>,

        /// Output directory
        #[arg(long, short = 'o', default_value = "shelfplan_out")]
        out_dir: PathBuf,
    },

    /// Validate a config and print its fingerprint
    CheckConfig {
        /// Pipeline config (TOML). Defaults to the named preset.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Preset checked when no config file is given
        #[arg(long, default_value = "standard")]
        preset: String,

        /// Core category file (JSON); overrides the config's path
        #[arg(long)]
        core_categories: Option<PathBuf>,
    },

    /// Print a built-in preset as TOML
    Preset {
        /// standard | conservative
        #[arg(default_value = "standard")]
        name: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            config,
            preset,
            core_categories,
            clusters,
            rules,
            approved,
            siblings,
            manual_minimums,
            out_dir,
        } => {
            let mut inputs = InputPaths {
                clusters,
                approved,
                siblings,
                manual_minimums,
                ..InputPaths::default()
            };
            for arg in &rules {
                let (rule, path) = parse_rule_arg(arg)?;
                inputs.rule_tables.insert(rule, path);
            }
            let request = RunRequest {
                config: LoadedConfig::resolve(config.as_deref(), &preset)?,
                core_categories_override: core_categories,
                inputs,
                generated_at: Some(Utc::now().to_rfc3339()),
            };

            let artifacts = execute(&request)?;
            let written = artifacts.write(&out_dir)?;

            match cli.format {
                OutputFormat::Text => {
                    print!("{}", artifacts.summary.to_text());
                    for path in &written {
                        println!("wrote {}", path.display());
                    }
                }
                OutputFormat::Json => println!("{}", artifacts.summary.to_json()?),
            }
            Ok(())
        }

        Commands::CheckConfig {
            config,
            preset,
            core_categories,
        } => {
            let loaded = LoadedConfig::resolve(config.as_deref(), &preset)?;
            let (core, warning) = loaded.core_categories(core_categories.as_deref());
            let cfg = &loaded.config;

            match cli.format {
                OutputFormat::Text => {
                    println!("Config:       {}", cfg.name);
                    println!("Schema:       {}", cfg.schema_version);
                    println!("Fingerprint:  {}", cfg.fingerprint());
                    println!("Core list:    {} ({} entries)", core.source().as_str(), core.len());
                    if let Some(w) = &warning {
                        println!("Warning:      {w}");
                    }
                    for (i, stage) in cfg.stages.iter().enumerate() {
                        println!("Stage {}:      {}", i + 1, stage.rule);
                    }
                    println!("Status:       OK");
                }
                OutputFormat::Json => {
                    let report = serde_json::json!({
                        "name": cfg.name,
                        "schema_version": cfg.schema_version,
                        "fingerprint": cfg.fingerprint(),
                        "core_category_source": core.source().as_str(),
                        "core_category_entries": core.len(),
                        "warning": warning,
                        "stages": cfg.stages.iter().map(|s| s.rule.as_str()).collect::<Vec<_>>(),
                        "valid": true,
                    });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
            Ok(())
        }

        Commands::Preset { name } => {
            print!("{}", preset_toml(&name)?);
            Ok(())
        }
    }
}
