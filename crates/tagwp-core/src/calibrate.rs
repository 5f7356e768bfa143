use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    data::ExtractedSample,
    selection::Selection,
    utils::{
        argmin_distance,
        enums::{EmptyStratumPolicy, JetBand},
        weighted_sum,
    },
    TagwpError, TagwpResult,
};

/// Integrated luminosity in pb⁻¹ used to turn weights into expected event counts.
pub const DEFAULT_LUMINOSITY: f64 = 36000.0;
/// Expected background events allowed to survive the working point in each stratum.
pub const DEFAULT_TARGET_YIELD: f64 = 3.0;
/// Offset added to the quantile score so that the quantile event itself fails the cut.
pub const DEFAULT_EPSILON: f64 = 1e-5;
/// HT value in GeV splitting the calibration strata.
pub const DEFAULT_HT_THRESHOLD: f64 = 900.0;
/// The tight working point; carried along but never applied.
pub const TOP_TAG: f64 = 1.0;

/// Parameters of a [`ThresholdCalibrator`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Integrated luminosity in pb⁻¹.
    pub luminosity: f64,
    /// Expected background events per stratum above the working point.
    pub target_yield: f64,
    /// Added to the quantile score.
    pub epsilon: f64,
    /// HT split of the strata in GeV.
    pub ht_threshold: f64,
    /// What to do with strata without entries.
    pub empty_stratum: EmptyStratumPolicy,
    /// A selection over sample rows (`ht`, `pt`, `mht`, `njets`) applied to every stratum.
    pub base_selection: Selection,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            luminosity: DEFAULT_LUMINOSITY,
            target_yield: DEFAULT_TARGET_YIELD,
            epsilon: DEFAULT_EPSILON,
            ht_threshold: DEFAULT_HT_THRESHOLD,
            empty_stratum: EmptyStratumPolicy::default(),
            base_selection: Selection::Pass,
        }
    }
}

impl CalibrationConfig {
    /// Create a new [`Default`] configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the integrated luminosity.
    pub fn luminosity(mut self, luminosity: f64) -> Self {
        self.luminosity = luminosity;
        self
    }

    /// Set the expected background yield per stratum.
    pub fn target_yield(mut self, target_yield: f64) -> Self {
        self.target_yield = target_yield;
        self
    }

    /// Set the quantile offset.
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Set the HT split.
    pub fn ht_threshold(mut self, ht_threshold: f64) -> Self {
        self.ht_threshold = ht_threshold;
        self
    }

    /// Set the empty-stratum policy.
    pub fn empty_stratum(mut self, policy: EmptyStratumPolicy) -> Self {
        self.empty_stratum = policy;
        self
    }

    /// Restrict every stratum with an additional selection.
    pub fn base_selection(mut self, selection: Selection) -> Self {
        self.base_selection = selection;
        self
    }
}

/// The working point of one calibration stratum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StratumWorkingPoint {
    /// `true` for HT above the threshold, `false` for HT below it
    pub ht_above: bool,
    /// Jet-multiplicity band
    pub band: JetBand,
    /// Tagger stage the quantile was taken on
    pub stage: usize,
    /// The stratum's own working point, `None` if it had no entries
    pub working_point: Option<f64>,
    /// Number of entries in the stratum
    pub entries: usize,
    /// Expected events in the stratum (luminosity times summed weight)
    pub expected: f64,
}

impl Display for StratumWorkingPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ht = if self.ht_above { "HT>thr" } else { "HT<thr" };
        write!(f, "{ht} {:<4} stage {}: ", self.band, self.stage)?;
        match self.working_point {
            Some(wp) => write!(f, "{wp:.6}")?,
            None => write!(f, "empty")?,
        }
        write!(f, " ({} entries, {:.1} expected)", self.entries, self.expected)
    }
}

/// The calibrated cut for one ctau hypothesis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    /// Index of the ctau hypothesis in the tagger tensor
    pub ctau_index: usize,
    /// Combined working point: the minimum over all populated strata
    pub working_point: f64,
    /// The tight working point, always [`TOP_TAG`]
    pub top_tag: f64,
    /// HT split used for the strata
    pub ht_threshold: f64,
    /// Per-stratum diagnostics
    pub strata: Vec<StratumWorkingPoint>,
}

impl ThresholdSet {
    /// A threshold set without calibration diagnostics.
    pub fn new(ctau_index: usize, working_point: f64) -> Self {
        Self {
            ctau_index,
            working_point,
            top_tag: TOP_TAG,
            ht_threshold: DEFAULT_HT_THRESHOLD,
            strata: Vec::new(),
        }
    }
}

/// Derives working points from weighted quantiles of the background tagger scores.
#[derive(Clone, Debug, Default)]
pub struct ThresholdCalibrator {
    config: CalibrationConfig,
}

impl ThresholdCalibrator {
    /// Create a calibrator with the given configuration.
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// The score above which about `target` expected events of the masked entries remain.
    ///
    /// Entries are sorted by their `(ctau, stage)` score (stably, ascending), their
    /// luminosity-scaled weights are accumulated in that order, and the entry whose cumulative
    /// sum is closest to `total - target` is chosen (the first one on ties). Its score plus
    /// epsilon is returned. Returns `None` if no entry is selected by `mask`.
    ///
    /// # Errors
    ///
    /// Returns [`TagwpError::LengthMismatch`] if `mask` does not hold one flag per event.
    pub fn weighted_quantile_working_point(
        &self,
        sample: &ExtractedSample,
        mask: &[bool],
        ctau: usize,
        stage: usize,
        target: f64,
    ) -> TagwpResult<Option<f64>> {
        if mask.len() != sample.n_events() {
            return Err(TagwpError::LengthMismatch {
                context: "quantile mask".to_string(),
                expected: sample.n_events(),
                actual: mask.len(),
            });
        }
        let mut entries: Vec<(f64, f64)> = mask
            .iter()
            .enumerate()
            .filter(|(_, selected)| **selected)
            .map(|(event, _)| {
                (
                    sample.score(event, ctau, stage),
                    sample.weights()[event] * self.config.luminosity,
                )
            })
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        let cumulative: Vec<f64> = entries
            .iter()
            .scan(0.0, |sum, (_, weight)| {
                *sum += weight;
                Some(*sum)
            })
            .collect();
        let total = cumulative[cumulative.len() - 1];
        Ok(argmin_distance(&cumulative, total - target)
            .map(|position| entries[position].0 + self.config.epsilon))
    }

    /// Rows passing the configured base selection.
    fn base_mask(&self, sample: &ExtractedSample) -> TagwpResult<Vec<bool>> {
        (0..sample.n_events())
            .map(|event| self.config.base_selection.evaluate(&mut sample.row(event)))
            .collect()
    }

    /// Calibrate the working point of one ctau hypothesis on a background sample.
    ///
    /// The sample is split into six strata (HT above or below the threshold, times the three
    /// [`JetBand`]s). Each stratum gets its own working point on the band's tagger stage, and
    /// the combined working point is the smallest of them.
    ///
    /// # Errors
    ///
    /// Returns [`TagwpError::CalibrationUndefined`] if a stratum is empty under
    /// [`EmptyStratumPolicy::Fail`], if every stratum is empty, or if the sample lacks the
    /// requested ctau hypothesis or tagger stages.
    pub fn calibrate(&self, sample: &ExtractedSample, ctau: usize) -> TagwpResult<ThresholdSet> {
        if ctau >= sample.n_ctau() {
            return Err(TagwpError::CalibrationUndefined {
                reason: format!(
                    "ctau index {ctau} requested but the sample holds {} hypotheses",
                    sample.n_ctau()
                ),
            });
        }
        let needed_stages = JetBand::ALL.iter().map(|band| band.stage() + 1).max().unwrap_or(0);
        if sample.n_stages() < needed_stages {
            return Err(TagwpError::CalibrationUndefined {
                reason: format!(
                    "the sample holds {} tagger stages but {needed_stages} are needed",
                    sample.n_stages()
                ),
            });
        }
        let base = self.base_mask(sample)?;
        let threshold = self.config.ht_threshold;
        let mut strata = Vec::with_capacity(6);
        for ht_above in [true, false] {
            for band in JetBand::ALL {
                let mask: Vec<bool> = (0..sample.n_events())
                    .map(|event| {
                        let ht = sample.ht()[event];
                        base[event]
                            && if ht_above { ht > threshold } else { ht < threshold }
                            && band.contains(sample.njets()[event])
                    })
                    .collect();
                let entries = mask.iter().filter(|selected| **selected).count();
                let expected = self.config.luminosity
                    * weighted_sum(
                        mask.iter()
                            .zip(sample.weights())
                            .filter(|(selected, _)| **selected)
                            .map(|(_, weight)| *weight),
                    );
                let working_point = self.weighted_quantile_working_point(
                    sample,
                    &mask,
                    ctau,
                    band.stage(),
                    self.config.target_yield,
                )?;
                let stratum = StratumWorkingPoint {
                    ht_above,
                    band,
                    stage: band.stage(),
                    working_point,
                    entries,
                    expected,
                };
                if stratum.working_point.is_none() {
                    match self.config.empty_stratum {
                        EmptyStratumPolicy::Fail => {
                            return Err(TagwpError::CalibrationUndefined {
                                reason: format!("stratum \"{stratum}\" has no entries"),
                            })
                        }
                        EmptyStratumPolicy::Skip => {
                            warn!("Skipping empty calibration stratum \"{stratum}\"")
                        }
                    }
                }
                debug!("ctau {ctau}: {stratum}");
                strata.push(stratum);
            }
        }
        let working_point = strata
            .iter()
            .filter_map(|stratum| stratum.working_point)
            .min_by(f64::total_cmp)
            .ok_or_else(|| TagwpError::CalibrationUndefined {
                reason: "every calibration stratum is empty".to_string(),
            })?;
        Ok(ThresholdSet {
            ctau_index: ctau,
            working_point,
            top_tag: TOP_TAG,
            ht_threshold: threshold,
            strata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::EventScalars, selection::Comparison};
    use approx::assert_relative_eq;

    /// One ctau hypothesis with three stages, every stage holding the same score.
    fn push(sample: &mut ExtractedSample, score: f64, ht: f64, njets: f64, weight: f64) {
        sample.push(
            &[score, score, score],
            EventScalars {
                ht,
                pt: 200.0,
                mht: 350.0,
                njets,
                weight,
            },
        );
    }

    fn unit_weight() -> f64 {
        1.0 / DEFAULT_LUMINOSITY
    }

    /// `n` events with scores `1/n, 2/n, ..., 1` and weight one.
    fn ladder(n: usize) -> ExtractedSample {
        let mut sample = ExtractedSample::new(1, 3);
        for i in 1..=n {
            push(&mut sample, i as f64 / n as f64, 1000.0, 3.0, 1.0);
        }
        sample
    }

    fn unit_luminosity() -> ThresholdCalibrator {
        ThresholdCalibrator::new(CalibrationConfig::new().luminosity(1.0))
    }

    fn tail(sample: &ExtractedSample, mask: &[bool], stage: usize, cut: f64, lumi: f64) -> f64 {
        (0..sample.n_events())
            .filter(|&event| mask[event] && sample.score(event, 0, stage) > cut)
            .map(|event| sample.weights()[event] * lumi)
            .sum()
    }

    fn random_background(seed: u64, n: usize) -> ExtractedSample {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut sample = ExtractedSample::new(1, 3);
        for _ in 0..n {
            let scores = [rng.f64(), rng.f64(), rng.f64()];
            sample.push(
                &scores,
                EventScalars {
                    ht: 400.0 + 1000.0 * rng.f64(),
                    pt: 150.0,
                    mht: 320.0,
                    njets: rng.u32(3..=8) as f64,
                    weight: (0.05 + 0.1 * rng.f64()) / DEFAULT_LUMINOSITY,
                },
            );
        }
        sample
    }

    #[test]
    fn test_quantile_leaves_target_above() {
        let sample = ladder(10);
        let calibrator = unit_luminosity();
        let mask = vec![true; 10];
        let wp = calibrator
            .weighted_quantile_working_point(&sample, &mask, 0, 1, 3.0)
            .unwrap()
            .unwrap();
        assert_relative_eq!(wp, 0.7 + DEFAULT_EPSILON);
        assert_relative_eq!(tail(&sample, &mask, 1, wp, 1.0), 3.0);
        // the quantile event itself sits just below the cut
        assert!(sample.score(6, 0, 1) < wp);
    }

    #[test]
    fn test_quantile_prefers_first_tie() {
        let sample = ladder(4);
        let calibrator = unit_luminosity();
        // cumulative sums 1, 2, 3, 4 are equally close to 4 - 2.5 = 1.5 at positions 0 and 1
        let wp = calibrator
            .weighted_quantile_working_point(&sample, &[true; 4], 0, 0, 2.5)
            .unwrap()
            .unwrap();
        assert_relative_eq!(wp, 0.25 + DEFAULT_EPSILON);
    }

    #[test]
    fn test_quantile_respects_mask_and_empty_selection() {
        let sample = ladder(10);
        let calibrator = unit_luminosity();
        let mut mask = vec![false; 10];
        assert_eq!(
            calibrator
                .weighted_quantile_working_point(&sample, &mask, 0, 0, 3.0)
                .unwrap(),
            None
        );
        mask[..5].fill(true);
        let wp = calibrator
            .weighted_quantile_working_point(&sample, &mask, 0, 0, 3.0)
            .unwrap()
            .unwrap();
        assert_relative_eq!(wp, 0.2 + DEFAULT_EPSILON);
    }

    #[test]
    fn test_quantile_rejects_mask_of_wrong_length() {
        let sample = ladder(1);
        let calibrator = unit_luminosity();
        assert!(matches!(
            calibrator.weighted_quantile_working_point(&sample, &[true, true], 0, 0, 3.0),
            Err(TagwpError::LengthMismatch {
                expected: 1,
                actual: 2,
                ..
            })
        ));
        let sample = ladder(3);
        assert!(matches!(
            calibrator.weighted_quantile_working_point(&sample, &[true], 0, 0, 3.0),
            Err(TagwpError::LengthMismatch {
                expected: 3,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_quantile_is_monotonic_in_target() {
        let sample = random_background(7, 400);
        let calibrator = ThresholdCalibrator::default();
        let mask = vec![true; sample.n_events()];
        let mut previous = f64::NEG_INFINITY;
        for target in [20.0, 10.0, 8.0, 5.0, 3.0, 2.0, 1.0, 0.5] {
            let wp = calibrator
                .weighted_quantile_working_point(&sample, &mask, 0, 1, target)
                .unwrap()
                .unwrap();
            assert!(
                wp >= previous,
                "target {target} gave {wp}, below {previous} for a larger target"
            );
            previous = wp;
        }
    }

    #[test]
    fn test_calibration_takes_minimum_over_strata() {
        let sample = random_background(11, 1500);
        let calibrator = ThresholdCalibrator::default();
        let thresholds = calibrator.calibrate(&sample, 0).unwrap();
        assert_eq!(thresholds.strata.len(), 6);
        assert_eq!(thresholds.top_tag, 1.0);
        let smallest = thresholds
            .strata
            .iter()
            .map(|stratum| stratum.working_point.unwrap())
            .fold(f64::INFINITY, f64::min);
        assert_eq!(thresholds.working_point, smallest);
        assert_eq!(
            thresholds.strata.iter().map(|s| s.entries).sum::<usize>(),
            sample.n_events()
        );
    }

    #[test]
    fn test_threshold_application_consistency() {
        let sample = random_background(23, 1500);
        let calibrator = ThresholdCalibrator::default();
        let thresholds = calibrator.calibrate(&sample, 0).unwrap();
        let max_weight = sample
            .weights()
            .iter()
            .fold(0.0_f64, |acc, w| acc.max(*w))
            * DEFAULT_LUMINOSITY;
        for stratum in &thresholds.strata {
            let mask: Vec<bool> = (0..sample.n_events())
                .map(|event| {
                    let ht = sample.ht()[event];
                    let in_ht = if stratum.ht_above { ht > 900.0 } else { ht < 900.0 };
                    in_ht && stratum.band.contains(sample.njets()[event])
                })
                .collect();
            let own = tail(
                &sample,
                &mask,
                stratum.stage,
                stratum.working_point.unwrap(),
                DEFAULT_LUMINOSITY,
            );
            assert!(
                (own - DEFAULT_TARGET_YIELD).abs() <= 2.0 * max_weight,
                "stratum {stratum} keeps {own} expected events"
            );
            let combined = tail(
                &sample,
                &mask,
                stratum.stage,
                thresholds.working_point,
                DEFAULT_LUMINOSITY,
            );
            assert!(combined >= own);
        }
    }

    #[test]
    fn test_empty_stratum_policies() {
        let mut sample = ExtractedSample::new(1, 3);
        for i in 0..20 {
            let score = (i + 1) as f64 / 21.0;
            push(&mut sample, score, 1000.0, 3.0, unit_weight());
            push(&mut sample, score, 600.0, 5.0, unit_weight());
        }
        let skip = ThresholdCalibrator::default().calibrate(&sample, 0).unwrap();
        assert_eq!(
            skip.strata
                .iter()
                .filter(|stratum| stratum.working_point.is_none())
                .count(),
            4
        );
        assert_relative_eq!(skip.working_point, 17.0 / 21.0 + DEFAULT_EPSILON);

        let fail = ThresholdCalibrator::new(
            CalibrationConfig::new().empty_stratum(EmptyStratumPolicy::Fail),
        )
        .calibrate(&sample, 0);
        assert!(matches!(fail, Err(TagwpError::CalibrationUndefined { .. })));

        let empty = ThresholdCalibrator::default().calibrate(&ExtractedSample::new(1, 3), 0);
        assert!(matches!(empty, Err(TagwpError::CalibrationUndefined { .. })));
    }

    #[test]
    fn test_base_selection_and_configuration() {
        let mut sample = ExtractedSample::new(1, 3);
        for i in 0..20 {
            let score = (i + 1) as f64 / 21.0;
            push(&mut sample, score, 1000.0, 3.0, unit_weight());
        }
        let calibrator = ThresholdCalibrator::new(
            CalibrationConfig::new()
                .target_yield(5.0)
                .base_selection(Selection::cut("ht", Comparison::Gt, 2000.0)),
        );
        assert!(matches!(
            calibrator.calibrate(&sample, 0),
            Err(TagwpError::CalibrationUndefined { .. })
        ));
        let calibrator = ThresholdCalibrator::new(
            CalibrationConfig::new().target_yield(5.0).ht_threshold(1200.0),
        );
        let thresholds = calibrator.calibrate(&sample, 0).unwrap();
        assert_relative_eq!(thresholds.working_point, 15.0 / 21.0 + DEFAULT_EPSILON);
        assert!(thresholds.strata[3].working_point.is_some());
        assert!(calibrator.calibrate(&sample, 1).is_err());
    }
}
