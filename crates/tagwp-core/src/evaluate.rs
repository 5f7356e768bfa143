use std::fmt::Display;

use serde::Serialize;

use crate::{
    calibrate::{ThresholdSet, DEFAULT_LUMINOSITY},
    data::ExtractedSample,
    selection::{Comparison, Selection},
    utils::{enums::ReportCategory, weighted_sum},
    TagwpError, TagwpResult,
};

/// Expected yield and raw entry count of one reporting category.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CategoryYield {
    /// The category
    pub category: ReportCategory,
    /// Luminosity times the summed weight of the selected entries
    #[serde(rename = "yield")]
    pub expected: f64,
    /// Number of selected entries
    pub count: usize,
}

impl Display for CategoryYield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:8.1} ({:8})  ", self.expected, self.count)
    }
}

/// Yields of a sample in every [`ReportCategory`], in report order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct YieldTable {
    /// One entry per category
    pub categories: Vec<CategoryYield>,
}

impl YieldTable {
    /// The yield of one category.
    pub fn get(&self, category: ReportCategory) -> Option<&CategoryYield> {
        self.categories.iter().find(|c| c.category == category)
    }
}

impl Display for YieldTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for category in &self.categories {
            write!(f, "{category}")?;
        }
        Ok(())
    }
}

/// Re-applies calibrated working points to samples.
#[derive(Clone, Debug)]
pub struct YieldEvaluator {
    luminosity: f64,
}

impl Default for YieldEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_LUMINOSITY)
    }
}

impl YieldEvaluator {
    /// Create an evaluator scaling weights by `luminosity` (pb⁻¹).
    pub fn new(luminosity: f64) -> Self {
        Self { luminosity }
    }

    /// Yields of `sample` after applying the working point of `thresholds` to the `ctau`
    /// hypothesis.
    ///
    /// If `filter` is given, rows failing it are dropped before categorization. A row enters
    /// a category when its jet multiplicity lies in the category's range and its score on the
    /// category's stage is strictly above the working point.
    pub fn evaluate(
        &self,
        sample: &ExtractedSample,
        thresholds: &ThresholdSet,
        ctau: usize,
        filter: Option<&Selection>,
    ) -> TagwpResult<YieldTable> {
        if ctau >= sample.n_ctau() {
            return Err(TagwpError::Custom(format!(
                "ctau index {ctau} requested but the sample holds {} hypotheses",
                sample.n_ctau()
            )));
        }
        let needed_stages = ReportCategory::ALL
            .iter()
            .map(|category| category.stage() + 1)
            .max()
            .unwrap_or(0);
        if sample.n_stages() < needed_stages {
            return Err(TagwpError::Custom(format!(
                "the sample holds {} tagger stages but {needed_stages} are needed",
                sample.n_stages()
            )));
        }
        let mut passing = Vec::with_capacity(sample.n_events());
        for event in 0..sample.n_events() {
            let keep = match filter {
                Some(selection) => selection.evaluate(&mut sample.row(event))?,
                None => true,
            };
            if keep {
                passing.push(event);
            }
        }
        let categories = ReportCategory::ALL
            .iter()
            .map(|&category| {
                let selected: Vec<usize> = passing
                    .iter()
                    .copied()
                    .filter(|&event| {
                        category.contains(sample.njets()[event])
                            && sample.score(event, ctau, category.stage())
                                > thresholds.working_point
                    })
                    .collect();
                CategoryYield {
                    category,
                    expected: self.luminosity
                        * weighted_sum(selected.iter().map(|&event| sample.weights()[event])),
                    count: selected.len(),
                }
            })
            .collect();
        Ok(YieldTable { categories })
    }

    /// Evaluate background and signal samples without a filter, above the HT threshold of
    /// `thresholds` and below it.
    pub fn report(
        &self,
        label: &str,
        thresholds: &ThresholdSet,
        background: (&str, &ExtractedSample),
        signals: &[(&str, &ExtractedSample)],
    ) -> TagwpResult<YieldReport> {
        let ht = thresholds.ht_threshold;
        let filters = [
            (String::from("all"), None),
            (
                format!("HT > {ht}"),
                Some(Selection::cut("ht", Comparison::Gt, ht)),
            ),
            (
                format!("HT < {ht}"),
                Some(Selection::cut("ht", Comparison::Lt, ht)),
            ),
        ];
        let mut sections = Vec::with_capacity(filters.len());
        for (name, filter) in filters {
            let mut rows = Vec::with_capacity(signals.len() + 1);
            for (sample_name, sample) in std::iter::once(&background).chain(signals) {
                rows.push((
                    sample_name.to_string(),
                    self.evaluate(sample, thresholds, thresholds.ctau_index, filter.as_ref())?,
                ));
            }
            sections.push(ReportSection { filter: name, rows });
        }
        Ok(YieldReport {
            label: label.to_string(),
            thresholds: thresholds.clone(),
            sections,
        })
    }
}

/// One filter of a [`YieldReport`] with a row per sample.
#[derive(Clone, Debug, Serialize)]
pub struct ReportSection {
    /// Description of the filter
    pub filter: String,
    /// Sample name and its yields
    pub rows: Vec<(String, YieldTable)>,
}

/// The calibration summary of one ctau hypothesis: its thresholds and yield tables.
#[derive(Clone, Debug, Serialize)]
pub struct YieldReport {
    /// Human-readable ctau label
    pub label: String,
    /// The calibrated thresholds
    pub thresholds: ThresholdSet,
    /// Unfiltered, HT-above and HT-below sections
    pub sections: Vec<ReportSection>,
}

impl Display for YieldReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", "-".repeat(60))?;
        writeln!(f, "var {} {}", self.thresholds.ctau_index, self.label)?;
        for stratum in &self.thresholds.strata {
            writeln!(f, "  {stratum}")?;
        }
        writeln!(
            f,
            "working point {:.6} (top tag {:.1})",
            self.thresholds.working_point, self.thresholds.top_tag
        )?;
        let width = self
            .sections
            .iter()
            .flat_map(|section| section.rows.iter().map(|(name, _)| name.len()))
            .max()
            .unwrap_or(0);
        write!(f, "{:width$} ", "")?;
        for category in ReportCategory::ALL {
            write!(f, "{:>19}  ", category.to_string())?;
        }
        writeln!(f)?;
        for (i, section) in self.sections.iter().enumerate() {
            let rule = if i < 2 { "=" } else { "-" };
            writeln!(f, "{} {}", rule.repeat(100), section.filter)?;
            for (name, table) in &section.rows {
                writeln!(f, "{name:width$} {table}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EventScalars;
    use approx::assert_relative_eq;

    /// Events with one ctau hypothesis and three stages; stage 1 and 2 scores given.
    fn sample(events: &[(f64, f64, f64, f64, f64)]) -> ExtractedSample {
        let mut sample = ExtractedSample::new(1, 3);
        for &(njets, ht, stage1, stage2, weight) in events {
            sample.push(
                &[0.0, stage1, stage2],
                EventScalars {
                    ht,
                    pt: 100.0,
                    mht: 300.0,
                    njets,
                    weight,
                },
            );
        }
        sample
    }

    fn fixture() -> ExtractedSample {
        sample(&[
            (2.0, 1000.0, 0.99, 0.99, 1.0),
            (3.0, 1000.0, 0.95, 0.10, 1.0),
            (4.0, 800.0, 0.92, 0.10, 2.0),
            (4.0, 800.0, 0.50, 0.10, 4.0),
            (5.0, 950.0, 0.91, 0.10, 1.0),
            (6.0, 700.0, 0.10, 0.97, 3.0),
            (7.0, 1200.0, 0.99, 0.80, 5.0),
        ])
    }

    #[test]
    fn test_category_yields() {
        let evaluator = YieldEvaluator::new(1.0);
        let thresholds = ThresholdSet::new(0, 0.9);
        let table = evaluator.evaluate(&fixture(), &thresholds, 0, None).unwrap();
        let low = table.get(ReportCategory::TwoTagThreeJet).unwrap();
        assert_eq!(low.count, 2);
        assert_relative_eq!(low.expected, 3.0);
        let mid = table.get(ReportCategory::TwoTagFiveJet).unwrap();
        assert_eq!(mid.count, 1);
        assert_relative_eq!(mid.expected, 1.0);
        let high = table.get(ReportCategory::ThreeTagSixPlusJet).unwrap();
        assert_eq!(high.count, 1);
        assert_relative_eq!(high.expected, 3.0);
    }

    #[test]
    fn test_filter_applies_first() {
        let evaluator = YieldEvaluator::new(1.0);
        let thresholds = ThresholdSet::new(0, 0.9);
        let above = Selection::cut("ht", Comparison::Gt, 900.0);
        let table = evaluator
            .evaluate(&fixture(), &thresholds, 0, Some(&above))
            .unwrap();
        let counts: Vec<usize> = table.categories.iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![1, 1, 0]);
    }

    #[test]
    fn test_luminosity_scaling_and_format() {
        let evaluator = YieldEvaluator::default();
        let thresholds = ThresholdSet::new(0, 0.9);
        let events = sample(&[(3.0, 1000.0, 0.95, 0.0, 1.0 / 3600.0)]);
        let table = evaluator.evaluate(&events, &thresholds, 0, None).unwrap();
        assert_relative_eq!(table.categories[0].expected, 10.0, epsilon = 1e-9);
        assert_eq!(
            table.to_string(),
            "    10.0 (       1)       0.0 (       0)       0.0 (       0)  "
        );
        assert!(evaluator.evaluate(&events, &thresholds, 3, None).is_err());
    }

    #[test]
    fn test_too_few_stages_is_an_error() {
        let mut sample = ExtractedSample::new(2, 2);
        sample.push(
            &[0.1, 0.2, 0.95, 0.96],
            EventScalars {
                ht: 1000.0,
                pt: 100.0,
                mht: 300.0,
                njets: 7.0,
                weight: 1.0,
            },
        );
        let evaluator = YieldEvaluator::new(1.0);
        let thresholds = ThresholdSet::new(0, 0.9);
        assert!(matches!(
            evaluator.evaluate(&sample, &thresholds, 0, None),
            Err(TagwpError::Custom(_))
        ));
        assert!(evaluator.evaluate(&sample, &thresholds, 1, None).is_err());
    }

    #[test]
    fn test_report_sections_partition_unfiltered_rows() {
        let evaluator = YieldEvaluator::new(1.0);
        let thresholds = ThresholdSet::new(0, 0.9);
        let background = fixture();
        let signal = sample(&[(6.0, 1500.0, 0.0, 0.95, 0.5), (3.0, 600.0, 0.95, 0.0, 0.25)]);
        let report = evaluator
            .report("ctau = 1 mm", &thresholds, ("background", &background), &[("signal", &signal)])
            .unwrap();
        assert_eq!(report.sections.len(), 3);
        for row in 0..2 {
            for category in 0..3 {
                let all = &report.sections[0].rows[row].1.categories[category];
                let above = &report.sections[1].rows[row].1.categories[category];
                let below = &report.sections[2].rows[row].1.categories[category];
                assert_eq!(all.count, above.count + below.count);
                assert_relative_eq!(all.expected, above.expected + below.expected);
            }
        }
        let text = report.to_string();
        assert!(text.contains("var 0 ctau = 1 mm"));
        assert!(text.contains("HT > 900"));
        assert_eq!(text.lines().filter(|l| l.starts_with("signal")).count(), 3);
    }
}
