use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    chain::EventChain,
    data::{
        io::{read_sample, write_sample},
        EventScalars, EventSchema, ExtractedSample, TableReader,
    },
    registry::{MassPoint, ProcessDescriptor},
    selection::Selection,
    utils::{enums::TaggerVariant, expand_path},
    TagwpError, TagwpResult,
};

/// A signal mass point together with the cross-section it is normalized to.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MassPointSelection {
    /// Heavy-state mass
    pub llp: u32,
    /// Light-state mass
    pub lsp: u32,
    /// Cross-section of this mass point in pb
    pub cross_section: f64,
}

impl MassPointSelection {
    /// Create a new mass point selection.
    pub fn new(llp: u32, lsp: u32, cross_section: f64) -> Self {
        Self {
            llp,
            lsp,
            cross_section,
        }
    }

    /// The mass point without its cross-section.
    pub fn point(&self) -> MassPoint {
        MassPoint::new(self.llp, self.lsp)
    }
}

/// Builds [`ExtractedSample`]s from the event files of a set of processes, memoized on disk.
///
/// A sample is stored under `<cache_dir>/<cache_name>.parquet`. If that file exists it is
/// returned as-is and no input file is opened, so changing the inputs or the preselection
/// requires a new cache name (or deleting the artifact).
pub struct SampleExtractor<R: TableReader> {
    reader: R,
    schema: EventSchema,
    cache_dir: PathBuf,
}

impl<R: TableReader> SampleExtractor<R> {
    /// Create an extractor reading files with `reader` and caching under `cache_dir`.
    pub fn new<P: AsRef<Path>>(reader: R, schema: EventSchema, cache_dir: P) -> TagwpResult<Self> {
        Ok(Self {
            reader,
            schema,
            cache_dir: expand_path(cache_dir)?,
        })
    }

    /// The field names used during extraction.
    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    /// Location of the cache artifact for `cache_name`.
    pub fn cache_path(&self, cache_name: &str) -> PathBuf {
        let path = self.cache_dir.join(cache_name);
        if path.extension().is_some_and(|ext| ext == "parquet") {
            path
        } else {
            let mut name = path.into_os_string();
            name.push(".parquet");
            PathBuf::from(name)
        }
    }

    fn cached(&self, cache_name: &str) -> TagwpResult<Option<ExtractedSample>> {
        let path = self.cache_path(cache_name);
        if !path.exists() {
            return Ok(None);
        }
        let sample = read_sample(&path)?;
        info!(
            "Loaded {} events from cache {}",
            sample.n_events(),
            path.display()
        );
        Ok(Some(sample))
    }

    fn store(&self, cache_name: &str, sample: &ExtractedSample) -> TagwpResult<()> {
        let path = self.cache_path(cache_name);
        write_sample(sample, &path)?;
        info!("Wrote {} events to {}", sample.n_events(), path.display());
        Ok(())
    }

    /// Extract the events of `processes` passing `preselection`, each weighted by its
    /// generator weight times the process scale factor.
    ///
    /// # Errors
    ///
    /// Returns [`TagwpError::Unnormalized`] if a process has a zero normalization integral and
    /// [`TagwpError::Extraction`] if reading the events of a process fails.
    pub fn extract(
        &self,
        cache_name: &str,
        processes: &[&ProcessDescriptor],
        preselection: &Selection,
        variant: TaggerVariant,
    ) -> TagwpResult<ExtractedSample> {
        if let Some(sample) = self.cached(cache_name)? {
            return Ok(sample);
        }
        let mut sample = ExtractedSample::new(self.schema.n_ctau(), self.schema.n_stages);
        for process in processes {
            if !process.is_normalized() {
                return Err(TagwpError::Unnormalized {
                    process: process.name.clone(),
                });
            }
            self.extract_process(
                process,
                process.scale_factor(),
                None,
                preselection,
                variant,
                &mut sample,
            )
            .map_err(|err| err.in_process(&process.name))?;
        }
        self.store(cache_name, &sample)?;
        Ok(sample)
    }

    /// Extract the events of one signal mass point.
    ///
    /// Only entries whose `llp` and `lsp` fields equal the requested masses are kept, and each
    /// process is scaled by `point.cross_section` over its generator-weight integral for that
    /// mass point.
    ///
    /// # Errors
    ///
    /// Returns [`TagwpError::MissingMassPoint`] if a process has no integral for the point and
    /// [`TagwpError::Unnormalized`] if that integral is zero.
    pub fn extract_signal(
        &self,
        cache_name: &str,
        processes: &[&ProcessDescriptor],
        point: MassPointSelection,
        preselection: &Selection,
        variant: TaggerVariant,
    ) -> TagwpResult<ExtractedSample> {
        if let Some(sample) = self.cached(cache_name)? {
            return Ok(sample);
        }
        let mut sample = ExtractedSample::new(self.schema.n_ctau(), self.schema.n_stages);
        for process in processes {
            let integral = process.mass_point_integral(point.point())?;
            if integral <= 0.0 {
                return Err(TagwpError::Unnormalized {
                    process: process.name.clone(),
                });
            }
            self.extract_process(
                process,
                point.cross_section / integral,
                Some(point.point()),
                preselection,
                variant,
                &mut sample,
            )
            .map_err(|err| err.in_process(&process.name))?;
        }
        self.store(cache_name, &sample)?;
        Ok(sample)
    }

    fn extract_process(
        &self,
        process: &ProcessDescriptor,
        scale_factor: f64,
        mass_point: Option<MassPoint>,
        preselection: &Selection,
        variant: TaggerVariant,
        sample: &mut ExtractedSample,
    ) -> TagwpResult<()> {
        info!("Processing {} ({} files)", process.name, process.files.len());
        let mut chain = EventChain::new(&self.reader, &process.files)?;
        let tagger_fields = self.schema.tagger_fields(variant);
        let mut scores = vec![0.0; tagger_fields.len()];
        let before = sample.n_events();
        for index in 0..chain.n_events() {
            chain.seek(index as i64)?;
            if !preselection.evaluate(&mut chain)? {
                continue;
            }
            if let Some(point) = mass_point {
                if chain.field(&self.schema.llp)? != f64::from(point.llp)
                    || chain.field(&self.schema.lsp)? != f64::from(point.lsp)
                {
                    continue;
                }
            }
            for (score, field) in scores.iter_mut().zip(&tagger_fields) {
                *score = chain.field(field)?;
            }
            let scalars = EventScalars {
                ht: chain.field(&self.schema.ht)?,
                pt: chain.field(&self.schema.leading_jet_pt)?,
                mht: chain.field(&self.schema.mht)?,
                njets: chain.field(&self.schema.njets)?,
                weight: chain.field(&self.schema.generator_weight)? * scale_factor,
            };
            sample.push(&scores, scalars);
        }
        if chain.out_of_range_count() > 0 {
            warn!(
                "{}: {} field reads were out of range and replaced by 0.0",
                process.name,
                chain.out_of_range_count()
            );
        }
        debug!(
            "{}: {} of {} events selected",
            process.name,
            sample.n_events() - before,
            chain.n_events()
        );
        Ok(())
    }
}
