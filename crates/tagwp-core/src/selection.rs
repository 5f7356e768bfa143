use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{data::FieldRef, TagwpError, TagwpResult};

/// Anything which can produce the value of a field for a single event.
///
/// Implemented by [`EventChain`](crate::chain::EventChain) for the active chain entry and by
/// [`SampleRow`](crate::data::SampleRow) for one event of an extracted sample.
pub trait FieldSource {
    /// The value of `field` for the current event.
    fn value(&mut self, field: &FieldRef) -> TagwpResult<f64>;
}

impl<S: FieldSource + ?Sized> FieldSource for &mut S {
    fn value(&mut self, field: &FieldRef) -> TagwpResult<f64> {
        (**self).value(field)
    }
}

/// A binary comparison between a field value and a constant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    /// `<`
    #[serde(rename = "<", alias = "lt")]
    Lt,
    /// `<=`
    #[serde(rename = "<=", alias = "le")]
    Le,
    /// `>`
    #[serde(rename = ">", alias = "gt")]
    Gt,
    /// `>=`
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    /// `==`
    #[serde(rename = "==", alias = "eq")]
    Eq,
    /// `!=`
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl Comparison {
    /// Apply the comparison as `lhs <op> rhs`.
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
        }
    }
}

impl Display for Comparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        };
        write!(f, "{symbol}")
    }
}

impl FromStr for Comparison {
    type Err = TagwpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "<" | "lt" => Ok(Self::Lt),
            "<=" | "le" => Ok(Self::Le),
            ">" | "gt" => Ok(Self::Gt),
            ">=" | "ge" => Ok(Self::Ge),
            "==" | "eq" => Ok(Self::Eq),
            "!=" | "ne" => Ok(Self::Ne),
            _ => Err(TagwpError::ParseError {
                name: s.to_string(),
                object: "Comparison".to_string(),
            }),
        }
    }
}

/// A per-event predicate over named fields.
///
/// Selections deserialize from a tagged representation, for example
///
/// ```yaml
/// all:
///   - cut: { field: nselectedJets_nominal, op: ">=", value: 3 }
///   - ratio: { numerator: nominal_mht, denominator: nominal_met, op: "<=", value: 1.25 }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    /// Accepts every event.
    #[default]
    Pass,
    /// `field <op> value`
    Cut {
        /// Field to compare
        field: FieldRef,
        /// Comparison operator
        op: Comparison,
        /// Constant right-hand side
        value: f64,
    },
    /// `numerator / denominator <op> value`
    Ratio {
        /// Field in the numerator
        numerator: FieldRef,
        /// Field in the denominator
        denominator: FieldRef,
        /// Comparison operator
        op: Comparison,
        /// Constant right-hand side
        value: f64,
    },
    /// Accepts an event when every member does (short-circuiting).
    All(Vec<Selection>),
    /// Accepts an event when any member does (short-circuiting).
    Any(Vec<Selection>),
    /// Inverts a selection.
    Not(Box<Selection>),
}

impl Selection {
    /// `field <op> value`
    pub fn cut<F: Into<FieldRef>>(field: F, op: Comparison, value: f64) -> Self {
        Selection::Cut {
            field: field.into(),
            op,
            value,
        }
    }

    /// `numerator / denominator <op> value`
    pub fn ratio<N: Into<FieldRef>, D: Into<FieldRef>>(
        numerator: N,
        denominator: D,
        op: Comparison,
        value: f64,
    ) -> Self {
        Selection::Ratio {
            numerator: numerator.into(),
            denominator: denominator.into(),
            op,
            value,
        }
    }

    /// Conjunction of `selections`.
    pub fn all<I: IntoIterator<Item = Selection>>(selections: I) -> Self {
        Selection::All(selections.into_iter().collect())
    }

    /// Disjunction of `selections`.
    pub fn any<I: IntoIterator<Item = Selection>>(selections: I) -> Self {
        Selection::Any(selections.into_iter().collect())
    }

    /// Negation of `self`.
    pub fn negate(self) -> Self {
        Selection::Not(Box::new(self))
    }

    /// Conjunction of `self` and `other`, flattening nested conjunctions.
    pub fn and(self, other: Selection) -> Self {
        match (self, other) {
            (Selection::Pass, other) => other,
            (this, Selection::Pass) => this,
            (Selection::All(mut lhs), Selection::All(rhs)) => {
                lhs.extend(rhs);
                Selection::All(lhs)
            }
            (Selection::All(mut lhs), rhs) => {
                lhs.push(rhs);
                Selection::All(lhs)
            }
            (lhs, rhs) => Selection::All(vec![lhs, rhs]),
        }
    }

    /// Evaluate the selection for the current event of `source`.
    pub fn evaluate<S: FieldSource + ?Sized>(&self, source: &mut S) -> TagwpResult<bool> {
        Ok(match self {
            Selection::Pass => true,
            Selection::Cut { field, op, value } => op.apply(source.value(field)?, *value),
            Selection::Ratio {
                numerator,
                denominator,
                op,
                value,
            } => {
                let num = source.value(numerator)?;
                let den = source.value(denominator)?;
                op.apply(num / den, *value)
            }
            Selection::All(selections) => {
                for selection in selections {
                    if !selection.evaluate(source)? {
                        return Ok(false);
                    }
                }
                true
            }
            Selection::Any(selections) => {
                for selection in selections {
                    if selection.evaluate(source)? {
                        return Ok(true);
                    }
                }
                false
            }
            Selection::Not(selection) => !selection.evaluate(source)?,
        })
    }

    /// The signal-region preselection: at least three jets, MHT of at least 300 GeV, MHT/MET
    /// at most 1.25 and a minimum jet-MET azimuthal separation of at least 0.2.
    pub fn signal_region() -> Self {
        Selection::all([
            Selection::cut("nselectedJets_nominal", Comparison::Ge, 3.0),
            Selection::cut("nominal_mht", Comparison::Ge, 300.0),
            Selection::ratio("nominal_mht", "nominal_met", Comparison::Le, 1.25),
            Selection::cut("nominal_minPhi", Comparison::Ge, 0.2),
        ])
    }

    fn lepton_control_base() -> Vec<Selection> {
        vec![
            Selection::cut("nselectedJets_nominal", Comparison::Ge, 2.0),
            Selection::cut("nominal_mht", Comparison::Ge, 300.0),
            Selection::cut("nvetoElectrons", Comparison::Eq, 0.0),
            Selection::cut("nvetoMuons", Comparison::Eq, 0.0),
        ]
    }

    /// The single-muon control region.
    pub fn single_muon() -> Self {
        let mut selections = Self::lepton_control_base();
        selections.push(Selection::cut("nominal_met", Comparison::Ge, 150.0));
        selections.push(Selection::cut("ntightMuons", Comparison::Eq, 1.0));
        Selection::All(selections)
    }

    /// The di-muon control region.
    pub fn di_muon() -> Self {
        let mut selections = Self::lepton_control_base();
        selections.push(Selection::cut("ntightMuons", Comparison::Eq, 2.0));
        selections.push(Selection::cut("muonsys_mass", Comparison::Ge, 10.0));
        Selection::All(selections)
    }

    /// Look up a named preset: `pass`, `sr`, `single-muon` or `di-muon`.
    pub fn preset(name: &str) -> TagwpResult<Self> {
        match name.to_lowercase().replace('_', "-").as_str() {
            "pass" | "none" => Ok(Selection::Pass),
            "sr" | "signal-region" => Ok(Self::signal_region()),
            "single-muon" | "singlemuon" | "1mu" => Ok(Self::single_muon()),
            "di-muon" | "dimuon" | "2mu" => Ok(Self::di_muon()),
            _ => Err(TagwpError::ParseError {
                name: name.to_string(),
                object: "Selection".to_string(),
            }),
        }
    }
}

impl Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join(
            f: &mut std::fmt::Formatter<'_>,
            items: &[Selection],
            sep: &str,
        ) -> std::fmt::Result {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {sep} ")?;
                }
                write!(f, "{item}")?;
            }
            write!(f, ")")
        }
        match self {
            Selection::Pass => write!(f, "true"),
            Selection::Cut { field, op, value } => write!(f, "{field} {op} {value}"),
            Selection::Ratio {
                numerator,
                denominator,
                op,
                value,
            } => write!(f, "{numerator}/{denominator} {op} {value}"),
            Selection::All(items) => join(f, items, "&&"),
            Selection::Any(items) => join(f, items, "||"),
            Selection::Not(item) => write!(f, "!({item})"),
        }
    }
}
