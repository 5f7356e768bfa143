use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{data::io::is_event_file, utils::expand_path, TagwpError, TagwpResult};

/// A signal hyperparameter pair: the masses of the long-lived and the lightest particle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MassPoint {
    /// Heavy-state mass
    pub llp: u32,
    /// Light-state mass
    pub lsp: u32,
}

impl MassPoint {
    /// Create a new mass point.
    pub fn new(llp: u32, lsp: u32) -> Self {
        Self { llp, lsp }
    }
}

impl std::fmt::Display for MassPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.llp, self.lsp)
    }
}

/// One physics process: its files, cross-section and generator-weight integral.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessDescriptor {
    /// Canonical process name
    pub name: String,
    /// Event files in processing order
    pub files: Vec<PathBuf>,
    /// Cross-section in pb
    pub cross_section: f64,
    /// Sum of generator weights over all files of the process
    pub normalization_integral: f64,
    /// Generator-weight integrals of individual signal mass points
    pub mass_points: IndexMap<MassPoint, f64>,
}

impl ProcessDescriptor {
    /// Create a process without signal mass points.
    pub fn new<S, I, P>(name: S, files: I, cross_section: f64, normalization_integral: f64) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            name: name.into(),
            files: files.into_iter().map(Into::into).collect(),
            cross_section,
            normalization_integral,
            mass_points: IndexMap::new(),
        }
    }

    /// Attach the generator-weight integral of one mass point.
    pub fn with_mass_point(mut self, point: MassPoint, integral: f64) -> Self {
        self.mass_points.insert(point, integral);
        self
    }

    /// Whether the process can be normalized to its cross-section.
    pub fn is_normalized(&self) -> bool {
        self.normalization_integral > 0.0
    }

    /// `cross_section / normalization_integral`, or `0.0` when the integral is zero.
    pub fn scale_factor(&self) -> f64 {
        if self.is_normalized() {
            self.cross_section / self.normalization_integral
        } else {
            0.0
        }
    }

    /// The generator-weight integral of one mass point.
    pub fn mass_point_integral(&self, point: MassPoint) -> TagwpResult<f64> {
        self.mass_points
            .get(&point)
            .copied()
            .ok_or_else(|| TagwpError::MissingMassPoint {
                process: self.name.clone(),
                llp: point.llp,
                lsp: point.lsp,
            })
    }
}

/// Generator-weight sums of one production folder.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FolderWeights {
    /// Number of generated events
    pub sum: Option<f64>,
    /// Sum of generator weights
    pub weighted: f64,
    /// Per mass point sums of generator weights
    pub mass_points: IndexMap<MassPoint, f64>,
}

/// Generator-weight sums keyed by production folder.
///
/// The JSON layout is `{folder: {"sum": n, "weighted": w, "<llp>": {"<lsp>": {"weighted": w}}}}`
/// where the mass-point entries only exist for signal folders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenWeights {
    folders: IndexMap<String, FolderWeights>,
}

fn parse_mass(key: &str) -> Option<u32> {
    key.parse::<u32>()
        .ok()
        .or_else(|| key.parse::<f64>().ok().map(|mass| mass.round() as u32))
}

impl GenWeights {
    /// Read generator weights from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> TagwpResult<Self> {
        let path = expand_path(path)?;
        let value: Value = serde_json::from_reader(BufReader::new(File::open(&path)?))?;
        Self::from_value(&value)
    }

    /// Interpret an already parsed JSON document.
    pub fn from_value(value: &Value) -> TagwpResult<Self> {
        let invalid = |reason: String| TagwpError::Custom(format!("Invalid genweights: {reason}"));
        let root = value
            .as_object()
            .ok_or_else(|| invalid("top level is not an object".to_string()))?;
        let mut folders = IndexMap::new();
        for (folder, entry) in root {
            let entry = entry
                .as_object()
                .ok_or_else(|| invalid(format!("entry '{folder}' is not an object")))?;
            let mut weights = FolderWeights::default();
            for (key, value) in entry {
                match key.as_str() {
                    "weighted" => {
                        weights.weighted = value.as_f64().ok_or_else(|| {
                            invalid(format!("'{folder}.weighted' is not a number"))
                        })?
                    }
                    "sum" => weights.sum = value.as_f64(),
                    llp => {
                        let (Some(llp), Some(lsps)) = (parse_mass(llp), value.as_object()) else {
                            debug!("Ignoring genweights key '{folder}.{key}'");
                            continue;
                        };
                        for (lsp, point) in lsps {
                            let Some(lsp) = parse_mass(lsp) else {
                                continue;
                            };
                            let weighted = point
                                .get("weighted")
                                .and_then(Value::as_f64)
                                .ok_or_else(|| {
                                    invalid(format!("'{folder}.{key}.{lsp}' has no weighted sum"))
                                })?;
                            weights.mass_points.insert(MassPoint::new(llp, lsp), weighted);
                        }
                    }
                }
            }
            folders.insert(folder.clone(), weights);
        }
        Ok(Self { folders })
    }

    /// The sums of one folder.
    pub fn folder(&self, name: &str) -> Option<&FolderWeights> {
        self.folders.get(name)
    }

    /// Number of folders.
    pub fn len(&self) -> usize {
        self.folders.len()
    }

    /// Returns `true` if no folder is listed.
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }
}

/// Named processes in insertion order.
#[derive(Clone, Debug, Default)]
pub struct ProcessRegistry {
    processes: IndexMap<String, ProcessDescriptor>,
}

impl ProcessRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a process.
    pub fn insert(&mut self, descriptor: ProcessDescriptor) {
        self.processes.insert(descriptor.name.clone(), descriptor);
    }

    /// Look up a process by name.
    pub fn get(&self, name: &str) -> TagwpResult<&ProcessDescriptor> {
        self.processes
            .get(name)
            .ok_or_else(|| TagwpError::UnknownProcess {
                name: name.to_string(),
            })
    }

    /// Look up several processes, failing on the first unknown name.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> TagwpResult<Vec<&ProcessDescriptor>> {
        names.iter().map(|name| self.get(name.as_ref())).collect()
    }

    /// All processes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessDescriptor> {
        self.processes.values()
    }

    /// Number of processes.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Returns `true` if the registry holds no process.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Build a registry from a directory with one sub-folder of event files per production
    /// folder.
    ///
    /// Folder names are mapped through `aliases` (several folders may share one process name).
    /// A process takes its cross-section from `cross_sections`; the weighted generator sums of
    /// all its folders are added up only when a cross-section exists, so processes without one
    /// are unnormalized. Signal mass-point sums are always collected. Folders and files are
    /// visited in lexicographic order.
    pub fn discover<P: AsRef<Path>>(
        root: P,
        cross_sections: &IndexMap<String, f64>,
        aliases: &IndexMap<String, String>,
        genweights: &GenWeights,
    ) -> TagwpResult<Self> {
        let root = expand_path(root)?;
        let mut folders = fs::read_dir(&root)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        folders.retain(|path| path.is_dir());
        folders.sort();

        let mut registry = Self::new();
        for folder_path in folders {
            let folder = folder_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let name = aliases.get(&folder).cloned().unwrap_or_else(|| folder.clone());
            let mut files = fs::read_dir(&folder_path)?
                .map(|entry| entry.map(|entry| entry.path()))
                .collect::<Result<Vec<_>, _>>()?;
            files.retain(|path| path.is_file() && is_event_file(path));
            files.sort();
            debug!("{folder} -> {name}: {} files", files.len());

            let descriptor = registry
                .processes
                .entry(name.clone())
                .or_insert_with(|| {
                    ProcessDescriptor::new(name.clone(), Vec::<PathBuf>::new(), 0.0, 0.0)
                });
            descriptor.files.extend(files);
            let weights = genweights.folder(&folder);
            if let Some(&cross_section) = cross_sections.get(&name) {
                descriptor.cross_section = cross_section;
                match weights {
                    Some(weights) => descriptor.normalization_integral += weights.weighted,
                    None => warn!(
                        "Folder '{folder}' has a cross-section but no generator weights; \
                         it does not count towards the integral of {name}"
                    ),
                }
            }
            if let Some(weights) = weights {
                for (point, integral) in &weights.mass_points {
                    *descriptor.mass_points.entry(*point).or_insert(0.0) += integral;
                }
            }
        }
        info!(
            "Discovered {} processes under {}",
            registry.len(),
            root.display()
        );
        Ok(registry)
    }
}
