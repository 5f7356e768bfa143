//! YAML run configuration.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tagwp_core::{CalibrationConfig, EventSchema, MassPointSelection, Selection, TaggerVariant};

/// Process-name labels of the ctau hypotheses, in tensor order. Note that the 1 mm point is
/// labelled `1` in process names but `0` in tagger field names.
const DEFAULT_SIGNAL_CTAU: [&str; 7] = ["0p01", "0p1", "1", "10", "100", "1000", "10000"];

/// Display titles of the ctau hypotheses.
const DEFAULT_CTAU_TITLES: [&str; 7] = [
    "ctau = 10 um",
    "ctau = 100 um",
    "ctau = 1 mm",
    "ctau = 10 mm",
    "ctau = 100 mm",
    "ctau = 1 m",
    "ctau = 10 m",
];

/// Either the name of a preset or a full selection expression.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PreselectionConfig {
    Preset(String),
    Expression(Selection),
}

impl Default for PreselectionConfig {
    fn default() -> Self {
        Self::Preset("sr".to_string())
    }
}

impl PreselectionConfig {
    pub fn resolve(&self) -> Result<Selection> {
        match self {
            Self::Preset(name) => Ok(Selection::preset(name)?),
            Self::Expression(selection) => Ok(selection.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
    /// Cache name of the background sample.
    pub cache: String,
    /// Processes summed into the background.
    pub processes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    /// Name shown in the report.
    pub name: String,
    /// Cache name; `{ctau}` is replaced by the ctau label.
    pub cache: String,
    /// Process names; `{ctau}` is replaced by the ctau label.
    pub processes: Vec<String>,
    pub llp: u32,
    pub lsp: u32,
    /// Cross-section of the mass point in pb.
    pub cross_section: f64,
}

impl SignalConfig {
    pub fn point(&self) -> MassPointSelection {
        MassPointSelection::new(self.llp, self.lsp, self.cross_section)
    }

    pub fn cache_for(&self, ctau: &str) -> String {
        self.cache.replace("{ctau}", ctau)
    }

    pub fn processes_for(&self, ctau: &str) -> Vec<String> {
        self.processes.iter().map(|p| p.replace("{ctau}", ctau)).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Directory with one folder of event files per production folder.
    pub input_dir: PathBuf,
    /// Tree read from ROOT files.
    #[serde(default = "default_tree")]
    pub tree: String,
    /// Generator-weight sums (JSON).
    pub genweights: PathBuf,
    /// Directory holding extracted samples.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub variant: TaggerVariant,
    #[serde(default)]
    pub cross_sections: IndexMap<String, f64>,
    #[serde(default)]
    pub aliases: IndexMap<String, String>,
    #[serde(default)]
    pub preselection: PreselectionConfig,
    pub background: BackgroundConfig,
    #[serde(default)]
    pub signals: Vec<SignalConfig>,
    /// Process-name labels of the ctau hypotheses.
    #[serde(default = "default_signal_ctau")]
    pub signal_ctau: Vec<String>,
    /// Report titles of the ctau hypotheses.
    #[serde(default = "default_ctau_titles")]
    pub ctau_titles: Vec<String>,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub schema: EventSchema,
}

fn default_tree() -> String {
    tagwp_core::data::io::DEFAULT_TREE.to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_signal_ctau() -> Vec<String> {
    DEFAULT_SIGNAL_CTAU.iter().map(|s| s.to_string()).collect()
}

fn default_ctau_titles() -> Vec<String> {
    DEFAULT_CTAU_TITLES.iter().map(|s| s.to_string()).collect()
}

impl RunConfig {
    /// Parse a run file. Relative paths inside it are resolved against its directory.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read run config {}", path.display()))?;
        let mut config: RunConfig = serde_yaml_ng::from_slice(&bytes)
            .with_context(|| format!("failed to parse run config {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        config.validate()?;
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        for path in [&mut self.input_dir, &mut self.genweights, &mut self.cache_dir] {
            let expands = path.to_string_lossy().starts_with(['~', '$']);
            if path.is_relative() && !expands {
                *path = base.join(&*path);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let n_ctau = self.schema.n_ctau();
        if self.signal_ctau.len() != n_ctau {
            anyhow::bail!(
                "signal_ctau lists {} labels but the schema has {} ctau hypotheses",
                self.signal_ctau.len(),
                n_ctau
            );
        }
        if self.ctau_titles.len() != n_ctau {
            anyhow::bail!(
                "ctau_titles lists {} titles but the schema has {} ctau hypotheses",
                self.ctau_titles.len(),
                n_ctau
            );
        }
        if self.background.processes.is_empty() {
            anyhow::bail!("background.processes must be non-empty");
        }
        Ok(())
    }

    /// Title of one ctau hypothesis.
    pub fn ctau_title(&self, ctau: usize) -> &str {
        &self.ctau_titles[ctau]
    }
}
