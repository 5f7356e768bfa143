//! tagwp CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tagwp_core::{
    EventChain, ExtractedSample, FieldRef, FileReader, GenWeights, ProcessRegistry,
    SampleExtractor, Selection, ThresholdCalibrator, YieldEvaluator, YieldReport,
};

mod config;

use config::RunConfig;

#[derive(Parser)]
#[command(name = "tagwp")]
#[command(about = "tagwp - Displaced-jet tagger working-point calibration")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show event counts of files read as one chain
    Inspect {
        /// Event files (.parquet, .pq or .root)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Tree read from ROOT files
        #[arg(long, default_value = "Friends")]
        tree: String,

        /// Fields to print for the first entries, e.g. `selectedJets_nominal_pt[0]`
        #[arg(short, long)]
        field: Vec<FieldRef>,

        /// Number of entries to print
        #[arg(long, default_value = "5")]
        head: usize,
    },
    /// List the processes discovered from a run config
    Registry {
        /// Run config (YAML)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Build (or load) the cached background and signal samples
    Extract {
        /// Run config (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Only extract the background sample
        #[arg(long)]
        background_only: bool,
    },
    /// Calibrate working points and print the yield report
    Calibrate {
        /// Run config (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Restrict to these ctau indices (default: all)
        #[arg(long)]
        ctau: Vec<usize>,

        /// Also write the reports as pretty JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Inspect { files, tree, field, head } => cmd_inspect(&files, &tree, &field, head),
        Commands::Registry { config } => cmd_registry(&config),
        Commands::Extract { config, background_only } => cmd_extract(&config, background_only),
        Commands::Calibrate { config, ctau, output } => {
            cmd_calibrate(&config, &ctau, output.as_deref())
        }
    }
}

fn cmd_inspect(files: &[PathBuf], tree: &str, fields: &[FieldRef], head: usize) -> Result<()> {
    let mut chain = EventChain::new(FileReader::with_tree(tree), files)?;
    for (path, n_events) in chain.files() {
        println!("{:>10}  {}", n_events, path.display());
    }
    println!("{:>10}  total", chain.n_events());
    if fields.is_empty() || chain.is_empty() {
        return Ok(());
    }
    let header: Vec<String> = fields.iter().map(|f| format!("{:>16}", f.to_string())).collect();
    println!("{:>10}  {}", "entry", header.join(" "));
    for index in 0..head.min(chain.n_events()) {
        chain.seek(index as i64)?;
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            values.push(format!("{:>16.6}", chain.field_checked(field)?));
        }
        println!("{:>10}  {}", index, values.join(" "));
    }
    Ok(())
}

fn load_registry(config: &RunConfig) -> Result<ProcessRegistry> {
    let genweights = GenWeights::from_path(&config.genweights).with_context(|| {
        format!("failed to read generator weights {}", config.genweights.display())
    })?;
    let registry = ProcessRegistry::discover(
        &config.input_dir,
        &config.cross_sections,
        &config.aliases,
        &genweights,
    )
    .with_context(|| format!("failed to list processes in {}", config.input_dir.display()))?;
    Ok(registry)
}

fn cmd_registry(config_path: &Path) -> Result<()> {
    let config = RunConfig::read(config_path)?;
    let registry = load_registry(&config)?;
    println!(
        "{:<60} {:>6} {:>12} {:>14} {:>12}",
        "process", "files", "xsec [pb]", "integral", "scale"
    );
    for process in registry.iter() {
        println!(
            "{:<60} {:>6} {:>12.6} {:>14.1} {:>12.4e}",
            process.name,
            process.files.len(),
            process.cross_section,
            process.normalization_integral,
            process.scale_factor()
        );
        for (point, integral) in &process.mass_points {
            println!("    mass point {point}: {integral:.1}");
        }
    }
    Ok(())
}

/// The samples one run works with.
struct Samples {
    background: ExtractedSample,
    /// Per ctau index, one sample per configured signal.
    signals: Vec<Vec<ExtractedSample>>,
}

fn extract_samples(
    config: &RunConfig,
    registry: &ProcessRegistry,
    ctau_indices: &[usize],
    background_only: bool,
) -> Result<Samples> {
    let preselection: Selection = config.preselection.resolve()?;
    tracing::info!("Preselection: {preselection}");
    let extractor = SampleExtractor::new(
        FileReader::with_tree(&config.tree),
        config.schema.clone(),
        &config.cache_dir,
    )?;
    let background_processes = registry.select(&config.background.processes)?;
    let background = extractor
        .extract(&config.background.cache, &background_processes, &preselection, config.variant)
        .with_context(|| format!("failed to extract {}", config.background.cache))?;

    let mut signals = Vec::with_capacity(ctau_indices.len());
    for &ctau in ctau_indices {
        let label = &config.signal_ctau[ctau];
        let mut samples = Vec::with_capacity(config.signals.len());
        if !background_only {
            for signal in &config.signals {
                let names = signal.processes_for(label);
                let processes = registry.select(&names)?;
                let cache = signal.cache_for(label);
                let sample = extractor
                    .extract_signal(
                        &cache,
                        &processes,
                        signal.point(),
                        &preselection,
                        config.variant,
                    )
                    .with_context(|| format!("failed to extract {cache}"))?;
                samples.push(sample);
            }
        }
        signals.push(samples);
    }
    Ok(Samples { background, signals })
}

fn cmd_extract(config_path: &Path, background_only: bool) -> Result<()> {
    let config = RunConfig::read(config_path)?;
    let registry = load_registry(&config)?;
    let all: Vec<usize> = (0..config.schema.n_ctau()).collect();
    let samples = extract_samples(&config, &registry, &all, background_only)?;
    println!(
        "{:<40} {:>10} {:>14}",
        config.background.cache,
        samples.background.n_events(),
        format!("{:.3}", samples.background.weighted_total() * config.calibration.luminosity)
    );
    for (&ctau, ctau_samples) in all.iter().zip(&samples.signals) {
        for (signal, sample) in config.signals.iter().zip(ctau_samples) {
            println!(
                "{:<40} {:>10} {:>14}",
                signal.cache_for(&config.signal_ctau[ctau]),
                sample.n_events(),
                format!("{:.3}", sample.weighted_total() * config.calibration.luminosity)
            );
        }
    }
    Ok(())
}

fn cmd_calibrate(config_path: &Path, ctau: &[usize], output: Option<&Path>) -> Result<()> {
    let config = RunConfig::read(config_path)?;
    let n_ctau = config.schema.n_ctau();
    let ctau_indices: Vec<usize> = if ctau.is_empty() {
        (0..n_ctau).collect()
    } else {
        ctau.to_vec()
    };
    if let Some(&bad) = ctau_indices.iter().find(|&&i| i >= n_ctau) {
        anyhow::bail!("ctau index {bad} out of range (the schema has {n_ctau} hypotheses)");
    }
    let registry = load_registry(&config)?;
    let samples = extract_samples(&config, &registry, &ctau_indices, false)?;

    let calibrator = ThresholdCalibrator::new(config.calibration.clone());
    let evaluator = YieldEvaluator::new(config.calibration.luminosity);
    let mut reports: Vec<YieldReport> = Vec::with_capacity(ctau_indices.len());
    for (&index, signal_samples) in ctau_indices.iter().zip(&samples.signals) {
        let thresholds = calibrator
            .calibrate(&samples.background, index)
            .with_context(|| format!("calibration failed for ctau index {index}"))?;
        let signals: Vec<(&str, &ExtractedSample)> = config
            .signals
            .iter()
            .map(|signal| signal.name.as_str())
            .zip(signal_samples)
            .collect();
        let report = evaluator.report(
            config.ctau_title(index),
            &thresholds,
            ("background", &samples.background),
            &signals,
        )?;
        print!("{report}");
        reports.push(report);
    }
    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&reports)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
