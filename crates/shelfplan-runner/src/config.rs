//! Configuration loading: TOML pipeline configs, presets, core categories.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use shelfplan_gates::{CoreCategorySet, PipelineConfig};
use shelfplan_models::SourceRule;
use tracing::info;

/// Names accepted by `preset()`.
pub const PRESET_NAMES: [&str; 2] = ["standard", "conservative"];

/// Look up a built-in preset by name.
pub fn preset(name: &str) -> Option<PipelineConfig> {
    match name.trim().to_ascii_lowercase().as_str() {
        "standard" => Some(PipelineConfig::standard()),
        "conservative" => Some(PipelineConfig::conservative()),
        _ => None,
    }
}

/// Render a preset as TOML.
pub fn preset_toml(name: &str) -> Result<String> {
    let config = preset(name).ok_or_else(|| {
        anyhow!(
            "unknown preset '{}' (expected one of: {})",
            name,
            PRESET_NAMES.join(", ")
        )
    })?;
    toml::to_string_pretty(&config).with_context(|| format!("serialize preset '{name}'"))
}

/// A validated config plus the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PipelineConfig,
    /// `None` for presets.
    pub path: Option<PathBuf>,
}

impl LoadedConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let config: PipelineConfig = toml::from_str(&content)
            .with_context(|| format!("parse pipeline config TOML: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validate config: {}", path.display()))?;
        info!(
            path = %path.display(),
            name = %config.name,
            fingerprint = %config.fingerprint(),
            "Loaded pipeline config"
        );
        Ok(Self {
            config,
            path: Some(path.to_path_buf()),
        })
    }

    /// Use a built-in preset.
    pub fn from_preset(name: &str) -> Result<Self> {
        let config = preset(name).ok_or_else(|| anyhow!("unknown preset '{name}'"))?;
        config.validate().with_context(|| format!("validate preset '{name}'"))?;
        Ok(Self { config, path: None })
    }

    /// Config file path if given, else the named preset.
    pub fn resolve(path: Option<&Path>, preset_name: &str) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_preset(preset_name),
        }
    }

    /// Core category file: explicit override, else the config's own path
    /// resolved against the config file's directory.
    pub fn core_categories_path(&self, override_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = override_path {
            return Some(path.to_path_buf());
        }
        let declared = Path::new(self.config.core_categories_path.as_deref()?);
        if declared.is_absolute() {
            return Some(declared.to_path_buf());
        }
        match self.path.as_deref().and_then(Path::parent) {
            Some(dir) => Some(dir.join(declared)),
            None => Some(declared.to_path_buf()),
        }
    }

    /// Load the core category set. A missing or malformed file falls back to
    /// the built-in list and yields a warning for the run summary.
    pub fn core_categories(&self, override_path: Option<&Path>) -> (CoreCategorySet, Option<String>) {
        let path = self.core_categories_path(override_path);
        let (set, warning) = CoreCategorySet::load_or_builtin(path.as_deref());
        info!(
            source = set.source().as_str(),
            entries = set.len(),
            "Core categories ready"
        );
        (set, warning)
    }
}

/// Parse `rule=path` pairs given on the command line.
pub fn parse_rule_arg(arg: &str) -> Result<(SourceRule, PathBuf)> {
    let Some((rule, path)) = arg.split_once('=') else {
        bail!("expected RULE=PATH, got '{arg}'");
    };
    let rule = rule
        .parse::<SourceRule>()
        .with_context(|| format!("rule table argument '{arg}'"))?;
    if path.trim().is_empty() {
        bail!("empty path in '{arg}'");
    }
    Ok((rule, PathBuf::from(path.trim())))
}
