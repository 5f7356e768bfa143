use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::Path, str::FromStr};

use crate::{
    selection::FieldSource,
    utils::{enums::TaggerVariant, weighted_sum},
    TagwpError, TagwpResult,
};

/// Event-table backends and the cache artifact format.
pub mod io;

/// A fully loaded field of one event table.
///
/// Every numeric type a backend understands is promoted to `f64`. List-valued fields (one
/// variable-length list per event, such as the transverse momenta of all selected jets) are
/// kept as nested vectors.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// One value per event.
    Scalar(Vec<f64>),
    /// One list of values per event.
    List(Vec<Vec<f64>>),
}

impl Column {
    /// Number of events in the column.
    pub fn len(&self) -> usize {
        match self {
            Column::Scalar(values) => values.len(),
            Column::List(values) => values.len(),
        }
    }

    /// Returns `true` if the column holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value of `entry`, optionally picking one element of a list-valued field.
    ///
    /// A scalar field only has element `0`. Returns `None` when either index is out of range.
    pub fn get(&self, entry: usize, element: Option<usize>) -> Option<f64> {
        match (self, element) {
            (Column::Scalar(values), None | Some(0)) => values.get(entry).copied(),
            (Column::Scalar(_), Some(_)) => None,
            (Column::List(values), element) => values
                .get(entry)
                .and_then(|list| list.get(element.unwrap_or(0)).copied()),
        }
    }
}

/// A reference to a field of an event table, optionally selecting one element of a
/// list-valued field with the `name[index]` syntax.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldRef {
    name: String,
    element: Option<usize>,
}

impl FieldRef {
    /// Reference a whole field by name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            element: None,
        }
    }

    /// Reference one element of a list-valued field.
    pub fn element<S: Into<String>>(name: S, element: usize) -> Self {
        Self {
            name: name.into(),
            element: Some(element),
        }
    }

    /// The name of the underlying field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The selected element, if any.
    pub fn element_index(&self) -> Option<usize> {
        self.element
    }
}

impl Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.element {
            Some(element) => write!(f, "{}[{}]", self.name, element),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for FieldRef {
    type Err = TagwpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || TagwpError::InvalidField(s.to_string());
        let (name, element) = match s.split_once('[') {
            Some((name, rest)) => {
                let index = rest.strip_suffix(']').ok_or_else(invalid)?;
                let index = index.trim().parse::<usize>().map_err(|_| invalid())?;
                (name.trim(), Some(index))
            }
            None => (s, None),
        };
        if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == ']') {
            return Err(invalid());
        }
        Ok(Self {
            name: name.to_string(),
            element,
        })
    }
}

impl TryFrom<String> for FieldRef {
    type Error = TagwpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldRef> for String {
    fn from(value: FieldRef) -> Self {
        value.to_string()
    }
}

impl From<&str> for FieldRef {
    fn from(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| FieldRef::new(value))
    }
}

/// One opened event table: a record-oriented dataset whose fields can be loaded whole.
pub trait EventTable {
    /// Path of the file this table was opened from.
    fn path(&self) -> &Path;
    /// Number of events the file declares.
    fn n_events(&self) -> usize;
    /// Load an entire field.
    ///
    /// # Errors
    ///
    /// Returns [`TagwpError::FieldNotFound`] if the table has no field by this name.
    fn load_column(&self, name: &str) -> TagwpResult<Column>;
}

/// Something which can open event files as [`EventTable`]s.
pub trait TableReader {
    /// Open the event table stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TagwpError::FileOpen`] if the file cannot be read and
    /// [`TagwpError::MissingTable`] if it does not contain the expected table.
    fn open(&self, path: &Path) -> TagwpResult<Box<dyn EventTable>>;

    /// Number of events in the table at `path`, without loading any field.
    fn count_events(&self, path: &Path) -> TagwpResult<usize> {
        Ok(self.open(path)?.n_events())
    }
}

impl<R: TableReader + ?Sized> TableReader for &R {
    fn open(&self, path: &Path) -> TagwpResult<Box<dyn EventTable>> {
        (**self).open(path)
    }

    fn count_events(&self, path: &Path) -> TagwpResult<usize> {
        (**self).count_events(path)
    }
}

/// Names of the event fields read during extraction.
///
/// The defaults describe the tables written by the upstream event-production stage. Tagger
/// fields follow the pattern `{tagger_prefix}_{variant}_{systematic}_{ctau}_LLP_min{stage}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSchema {
    /// Scalar sum of jet transverse momenta.
    pub ht: FieldRef,
    /// Transverse momentum of the leading jet.
    pub leading_jet_pt: FieldRef,
    /// Number of selected jets.
    pub njets: FieldRef,
    /// Missing transverse momentum computed from jets.
    pub mht: FieldRef,
    /// Generator weight of the event.
    pub generator_weight: FieldRef,
    /// Heavy-state mass of a signal event.
    pub llp: FieldRef,
    /// Light-state mass of a signal event.
    pub lsp: FieldRef,
    /// Common prefix of all tagger fields.
    pub tagger_prefix: String,
    /// Systematic variation of the tagger fields.
    pub systematic: String,
    /// Labels of the ctau hypotheses, in tensor order.
    pub ctau_labels: Vec<String>,
    /// Number of tagger stages per ctau hypothesis.
    pub n_stages: usize,
}

impl Default for EventSchema {
    fn default() -> Self {
        Self {
            ht: FieldRef::new("nominal_ht"),
            leading_jet_pt: FieldRef::element("selectedJets_nominal_pt", 0),
            njets: FieldRef::new("nselectedJets_nominal"),
            mht: FieldRef::new("nominal_mht"),
            generator_weight: FieldRef::new("genweight"),
            llp: FieldRef::new("llp"),
            lsp: FieldRef::new("lsp"),
            tagger_prefix: "llpdnnx".to_string(),
            systematic: "nominal".to_string(),
            ctau_labels: DEFAULT_CTAU_LABELS.iter().map(|s| s.to_string()).collect(),
            n_stages: DEFAULT_TAGGER_STAGES,
        }
    }
}

/// Field labels of the ctau hypotheses evaluated by the tagger: 10 µm, 100 µm, 1 mm, 10 mm,
/// 100 mm, 1 m and 10 m.
pub const DEFAULT_CTAU_LABELS: [&str; 7] = ["0p01", "0p1", "0", "10", "100", "1000", "10000"];
/// Number of tagger stages stored per ctau hypothesis.
pub const DEFAULT_TAGGER_STAGES: usize = 5;

impl EventSchema {
    /// Create a new [`Default`] schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the ctau labels (and therefore the number of ctau hypotheses).
    pub fn ctau_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ctau_labels = labels.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Override the number of stages per ctau hypothesis.
    pub fn n_stages(mut self, n_stages: usize) -> Self {
        self.n_stages = n_stages;
        self
    }

    /// Number of ctau hypotheses.
    pub fn n_ctau(&self) -> usize {
        self.ctau_labels.len()
    }

    /// The field holding the score of one (ctau, stage) cell for a tagger variant.
    pub fn tagger_field(&self, variant: TaggerVariant, ctau: usize, stage: usize) -> FieldRef {
        FieldRef::new(format!(
            "{}_{}_{}_{}_LLP_min{}",
            self.tagger_prefix,
            variant.infix(),
            self.systematic,
            self.ctau_labels[ctau],
            stage
        ))
    }

    /// All tagger fields of a variant in row-major (ctau, stage) order.
    pub fn tagger_fields(&self, variant: TaggerVariant) -> Vec<FieldRef> {
        (0..self.n_ctau())
            .flat_map(|ctau| (0..self.n_stages).map(move |stage| (ctau, stage)))
            .map(|(ctau, stage)| self.tagger_field(variant, ctau, stage))
            .collect()
    }
}

/// The per-event scalars stored next to the tagger block of an [`ExtractedSample`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventScalars {
    /// Scalar sum of jet transverse momenta.
    pub ht: f64,
    /// Leading-jet transverse momentum.
    pub pt: f64,
    /// Missing transverse momentum from jets.
    pub mht: f64,
    /// Number of selected jets.
    pub njets: f64,
    /// Generator weight multiplied by the process scale factor.
    pub weight: f64,
}

/// A columnar sample of the events which passed a preselection.
///
/// The tagger scores form a tensor of shape `[event][ctau][stage]` stored flat in row-major
/// order. All per-event arrays share the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedSample {
    n_ctau: usize,
    n_stages: usize,
    tagger: Vec<f64>,
    ht: Vec<f64>,
    pt: Vec<f64>,
    mht: Vec<f64>,
    njets: Vec<f64>,
    weights: Vec<f64>,
}

impl ExtractedSample {
    /// An empty sample with the given tagger tensor shape.
    pub fn new(n_ctau: usize, n_stages: usize) -> Self {
        Self {
            n_ctau,
            n_stages,
            ..Default::default()
        }
    }

    /// Assemble a sample from its columns, checking that all lengths agree.
    #[allow(clippy::too_many_arguments)]
    pub fn from_columns(
        n_ctau: usize,
        n_stages: usize,
        tagger: Vec<f64>,
        ht: Vec<f64>,
        pt: Vec<f64>,
        mht: Vec<f64>,
        njets: Vec<f64>,
        weights: Vec<f64>,
    ) -> TagwpResult<Self> {
        let n_events = weights.len();
        for (context, actual) in [
            ("column 'ht'", ht.len()),
            ("column 'pt'", pt.len()),
            ("column 'mht'", mht.len()),
            ("column 'njets'", njets.len()),
        ] {
            if actual != n_events {
                return Err(TagwpError::LengthMismatch {
                    context: context.to_string(),
                    expected: n_events,
                    actual,
                });
            }
        }
        if tagger.len() != n_events * n_ctau * n_stages {
            return Err(TagwpError::LengthMismatch {
                context: "column 'tagger'".to_string(),
                expected: n_events * n_ctau * n_stages,
                actual: tagger.len(),
            });
        }
        Ok(Self {
            n_ctau,
            n_stages,
            tagger,
            ht,
            pt,
            mht,
            njets,
            weights,
        })
    }

    /// Append one event.
    ///
    /// # Panics
    ///
    /// Panics if `scores` does not hold exactly `n_ctau * n_stages` values.
    pub fn push(&mut self, scores: &[f64], scalars: EventScalars) {
        assert_eq!(
            scores.len(),
            self.block_len(),
            "tagger block must hold n_ctau * n_stages scores"
        );
        self.tagger.extend_from_slice(scores);
        self.ht.push(scalars.ht);
        self.pt.push(scalars.pt);
        self.mht.push(scalars.mht);
        self.njets.push(scalars.njets);
        self.weights.push(scalars.weight);
    }

    /// Number of events in the sample.
    pub fn n_events(&self) -> usize {
        self.weights.len()
    }

    /// Returns `true` if no event passed the preselection.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Number of ctau hypotheses in the tagger tensor.
    pub fn n_ctau(&self) -> usize {
        self.n_ctau
    }

    /// Number of stages per ctau hypothesis.
    pub fn n_stages(&self) -> usize {
        self.n_stages
    }

    fn block_len(&self) -> usize {
        self.n_ctau * self.n_stages
    }

    /// The tagger score of one event at `(ctau, stage)`.
    pub fn score(&self, event: usize, ctau: usize, stage: usize) -> f64 {
        self.tagger[event * self.block_len() + ctau * self.n_stages + stage]
    }

    /// The `[ctau][stage]` score block of one event.
    pub fn scores_of(&self, event: usize) -> &[f64] {
        let len = self.block_len();
        &self.tagger[event * len..(event + 1) * len]
    }

    /// The flat row-major tagger tensor.
    pub fn tagger(&self) -> &[f64] {
        &self.tagger
    }

    /// Scalar sum of jet transverse momenta, per event.
    pub fn ht(&self) -> &[f64] {
        &self.ht
    }

    /// Leading-jet transverse momentum, per event.
    pub fn pt(&self) -> &[f64] {
        &self.pt
    }

    /// Missing transverse momentum from jets, per event.
    pub fn mht(&self) -> &[f64] {
        &self.mht
    }

    /// Number of selected jets, per event.
    pub fn njets(&self) -> &[f64] {
        &self.njets
    }

    /// Normalized event weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Sum of all event weights.
    pub fn weighted_total(&self) -> f64 {
        weighted_sum(self.weights.iter().copied())
    }

    /// A row view of one event, usable as a [`FieldSource`].
    pub fn row(&self, event: usize) -> SampleRow<'_> {
        SampleRow {
            sample: self,
            event,
        }
    }
}

/// A single event of an [`ExtractedSample`].
///
/// Exposes the fields `ht`, `pt`, `mht`, `njets` and `weight` to [`Selection`]s, and the tagger
/// block as `tagger[k]` with `k` the row-major (ctau, stage) index.
///
/// [`Selection`]: crate::selection::Selection
#[derive(Debug, Clone, Copy)]
pub struct SampleRow<'a> {
    sample: &'a ExtractedSample,
    event: usize,
}

impl SampleRow<'_> {
    /// Index of the event within its sample.
    pub fn index(&self) -> usize {
        self.event
    }
}

impl FieldSource for SampleRow<'_> {
    fn value(&mut self, field: &FieldRef) -> TagwpResult<f64> {
        let event = self.event;
        let sample = self.sample;
        let scalar = match field.name() {
            "ht" => Some(sample.ht[event]),
            "pt" => Some(sample.pt[event]),
            "mht" => Some(sample.mht[event]),
            "njets" => Some(sample.njets[event]),
            "weight" | "weights" => Some(sample.weights[event]),
            "tagger" => {
                let block = sample.scores_of(event);
                let element = field.element_index().unwrap_or(0);
                return block.get(element).copied().ok_or(TagwpError::OutOfRange {
                    name: field.to_string(),
                    entry: element,
                    length: block.len(),
                });
            }
            _ => None,
        };
        match (scalar, field.element_index()) {
            (Some(value), None | Some(0)) => Ok(value),
            (Some(_), Some(element)) => Err(TagwpError::OutOfRange {
                name: field.to_string(),
                entry: element,
                length: 1,
            }),
            (None, _) => Err(TagwpError::FieldNotFound {
                name: field.to_string(),
                path: "<extracted sample>".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_event_sample() -> ExtractedSample {
        let mut sample = ExtractedSample::new(2, 3);
        sample.push(
            &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
            EventScalars {
                ht: 500.0,
                pt: 120.0,
                mht: 310.0,
                njets: 3.0,
                weight: 0.25,
            },
        );
        sample.push(
            &[0.9, 0.8, 0.7, 0.6, 0.5, 0.4],
            EventScalars {
                ht: 1200.0,
                pt: 450.0,
                mht: 640.0,
                njets: 6.0,
                weight: 0.5,
            },
        );
        sample
    }

    #[test]
    fn test_field_ref_parsing() {
        let plain: FieldRef = "nominal_ht".parse().unwrap();
        assert_eq!(plain.name(), "nominal_ht");
        assert_eq!(plain.element_index(), None);
        let element: FieldRef = "selectedJets_nominal_pt[0]".parse().unwrap();
        assert_eq!(element.name(), "selectedJets_nominal_pt");
        assert_eq!(element.element_index(), Some(0));
        assert_eq!(element.to_string(), "selectedJets_nominal_pt[0]");
        assert!("pt[".parse::<FieldRef>().is_err());
        assert!("pt[x]".parse::<FieldRef>().is_err());
        assert!("[2]".parse::<FieldRef>().is_err());
    }

    #[test]
    fn test_column_get() {
        let scalar = Column::Scalar(vec![1.0, 2.0]);
        assert_eq!(scalar.get(1, None), Some(2.0));
        assert_eq!(scalar.get(1, Some(0)), Some(2.0));
        assert_eq!(scalar.get(1, Some(1)), None);
        assert_eq!(scalar.get(2, None), None);
        let list = Column::List(vec![vec![300.0, 80.0], vec![]]);
        assert_eq!(list.get(0, Some(1)), Some(80.0));
        assert_eq!(list.get(0, None), Some(300.0));
        assert_eq!(list.get(1, Some(0)), None);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_default_schema_tagger_fields() {
        let schema = EventSchema::default();
        assert_eq!(schema.n_ctau(), 7);
        assert_eq!(
            schema.tagger_field(TaggerVariant::DomainAdapted, 0, 4).to_string(),
            "llpdnnx_da_nominal_0p01_LLP_min4"
        );
        let fields = schema.tagger_fields(TaggerVariant::Nominal);
        assert_eq!(fields.len(), 35);
        assert_eq!(fields[7].to_string(), "llpdnnx_noda_nominal_0p1_LLP_min2");
    }

    #[test]
    fn test_sample_indexing() {
        let sample = two_event_sample();
        assert_eq!(sample.n_events(), 2);
        assert_relative_eq!(sample.score(0, 1, 0), 0.4);
        assert_relative_eq!(sample.score(1, 0, 2), 0.7);
        assert_eq!(sample.scores_of(1), &[0.9, 0.8, 0.7, 0.6, 0.5, 0.4]);
        assert_relative_eq!(sample.weighted_total(), 0.75);
    }

    #[test]
    fn test_sample_from_columns_rejects_ragged_columns() {
        let result = ExtractedSample::from_columns(
            1,
            1,
            vec![0.5, 0.5],
            vec![1.0, 2.0],
            vec![1.0],
            vec![1.0, 2.0],
            vec![3.0, 4.0],
            vec![1.0, 1.0],
        );
        assert!(matches!(result, Err(TagwpError::LengthMismatch { .. })));
    }

    #[test]
    fn test_sample_row_fields() {
        let sample = two_event_sample();
        let mut row = sample.row(1);
        assert_relative_eq!(row.value(&FieldRef::new("ht")).unwrap(), 1200.0);
        assert_relative_eq!(row.value(&FieldRef::new("weight")).unwrap(), 0.5);
        assert_relative_eq!(row.value(&FieldRef::element("tagger", 4)).unwrap(), 0.5);
        assert!(matches!(
            row.value(&FieldRef::new("met")),
            Err(TagwpError::FieldNotFound { .. })
        ));
    }
}
