use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::TagwpError;

/// Which flavor of tagger output to read from the event tables.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaggerVariant {
    /// Scores of the tagger trained with domain adaptation (field infix `da`).
    #[serde(rename = "da", alias = "domain-adapted")]
    DomainAdapted,
    /// Scores of the tagger trained without domain adaptation (field infix `noda`).
    #[default]
    #[serde(rename = "noda", alias = "nominal")]
    Nominal,
}

impl TaggerVariant {
    /// The infix used in tagger field names.
    pub fn infix(&self) -> &'static str {
        match self {
            TaggerVariant::DomainAdapted => "da",
            TaggerVariant::Nominal => "noda",
        }
    }
}

impl Display for TaggerVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.infix())
    }
}

impl FromStr for TaggerVariant {
    type Err = TagwpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "da" | "domain-adapted" | "domain adapted" | "adapted" => Ok(Self::DomainAdapted),
            "noda" | "nominal" | "no-da" | "plain" => Ok(Self::Nominal),
            _ => Err(TagwpError::ParseError {
                name: s.to_string(),
                object: "TaggerVariant".to_string(),
            }),
        }
    }
}

/// Jet-multiplicity bands used to stratify the calibration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JetBand {
    /// Fewer than 4.5 jets.
    Low,
    /// At least 4.5 and fewer than 5.5 jets.
    Mid,
    /// More than 5.5 jets.
    High,
}

impl JetBand {
    /// All bands in calibration order.
    pub const ALL: [JetBand; 3] = [JetBand::Low, JetBand::Mid, JetBand::High];

    /// Whether a (floating-point) jet multiplicity falls into this band.
    pub fn contains(&self, njets: f64) -> bool {
        match self {
            JetBand::Low => njets < 4.5,
            JetBand::Mid => (4.5..5.5).contains(&njets),
            JetBand::High => njets > 5.5,
        }
    }

    /// The tagger stage whose score is calibrated in this band: the 2-tag stage for the
    /// low and mid bands, the 3-tag stage for the high band.
    pub fn stage(&self) -> usize {
        match self {
            JetBand::Low | JetBand::Mid => 1,
            JetBand::High => 2,
        }
    }
}

impl Display for JetBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JetBand::Low => write!(f, "low"),
            JetBand::Mid => write!(f, "mid"),
            JetBand::High => write!(f, "high"),
        }
    }
}

impl FromStr for JetBand {
    type Err = TagwpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "l" => Ok(Self::Low),
            "mid" | "medium" | "m" => Ok(Self::Mid),
            "high" | "h" => Ok(Self::High),
            _ => Err(TagwpError::ParseError {
                name: s.to_string(),
                object: "JetBand".to_string(),
            }),
        }
    }
}

/// The categories in which selected yields are reported.
///
/// Labels follow the `<tags>m<jets>t` convention of the analysis tables, so `2m3t` means
/// "two tagged, three or four jets".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportCategory {
    /// Stage-1 tag with 3 or 4 jets.
    #[serde(rename = "2m3t")]
    TwoTagThreeJet,
    /// Stage-1 tag with exactly 5 jets.
    #[serde(rename = "2m5t")]
    TwoTagFiveJet,
    /// Stage-2 tag with 6 or more jets.
    #[serde(rename = "3m6t")]
    ThreeTagSixPlusJet,
}

impl ReportCategory {
    /// All categories in report order.
    pub const ALL: [ReportCategory; 3] = [
        ReportCategory::TwoTagThreeJet,
        ReportCategory::TwoTagFiveJet,
        ReportCategory::ThreeTagSixPlusJet,
    ];

    /// Whether a jet multiplicity belongs to this category.
    pub fn contains(&self, njets: f64) -> bool {
        match self {
            ReportCategory::TwoTagThreeJet => njets > 2.5 && njets < 4.5,
            ReportCategory::TwoTagFiveJet => njets > 4.5 && njets < 5.5,
            ReportCategory::ThreeTagSixPlusJet => njets > 5.5,
        }
    }

    /// The tagger stage compared against the working point.
    pub fn stage(&self) -> usize {
        match self {
            ReportCategory::TwoTagThreeJet | ReportCategory::TwoTagFiveJet => 1,
            ReportCategory::ThreeTagSixPlusJet => 2,
        }
    }
}

impl Display for ReportCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportCategory::TwoTagThreeJet => write!(f, "2m3t"),
            ReportCategory::TwoTagFiveJet => write!(f, "2m5t"),
            ReportCategory::ThreeTagSixPlusJet => write!(f, "3m6t"),
        }
    }
}

impl FromStr for ReportCategory {
    type Err = TagwpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "2m3t" | "(2,3)" => Ok(Self::TwoTagThreeJet),
            "2m5t" | "(2,5)" => Ok(Self::TwoTagFiveJet),
            "3m6t" | "(3,6+)" | "(3,6)" => Ok(Self::ThreeTagSixPlusJet),
            _ => Err(TagwpError::ParseError {
                name: s.to_string(),
                object: "ReportCategory".to_string(),
            }),
        }
    }
}

/// What the calibrator does when a stratum contains no entries.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyStratumPolicy {
    /// Treat the stratum's working point as `+inf` so it never wins the minimum. Calibration
    /// still fails if every stratum is empty.
    #[default]
    Skip,
    /// Abort the calibration at the first empty stratum.
    Fail,
}

impl Display for EmptyStratumPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmptyStratumPolicy::Skip => write!(f, "skip"),
            EmptyStratumPolicy::Fail => write!(f, "fail"),
        }
    }
}

impl FromStr for EmptyStratumPolicy {
    type Err = TagwpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" | "ignore" => Ok(Self::Skip),
            "fail" | "error" | "abort" => Ok(Self::Fail),
            _ => Err(TagwpError::ParseError {
                name: s.to_string(),
                object: "EmptyStratumPolicy".to_string(),
            }),
        }
    }
}
